use anyhow::{bail, Context, Result};
use nanorun_compute::ComputeContext;
use nanorun_topology::{PlanDigest, TrainingHorizon, TrainingPlan};
use tracing::debug;

/// Exchanges digests of the plan and its horizon, and fails on every rank if
/// any rank resolved something different from rank 0.
pub fn ensure_plan_agreement(
    ctx: &ComputeContext,
    plan: &TrainingPlan,
    horizon: &TrainingHorizon,
) -> Result<PlanDigest> {
    let digest = PlanDigest::of(&(plan, horizon))?;
    let gathered = ctx
        .all_gather(digest.as_bytes())
        .context("could not exchange plan digests")?;
    let agreed = check_digests(&gathered)?;
    debug!(rank = ctx.rank(), digest = %agreed.short(), "all ranks agree on the plan");
    Ok(agreed)
}

fn check_digests(gathered: &[Vec<u8>]) -> Result<PlanDigest> {
    let Some(reference) = gathered.first().and_then(|bytes| PlanDigest::from_slice(bytes)) else {
        bail!("rank 0 sent no plan digest");
    };
    let dissenting: Vec<String> = gathered
        .iter()
        .enumerate()
        .skip(1)
        .filter_map(|(rank, bytes)| match PlanDigest::from_slice(bytes) {
            Some(digest) if digest == reference => None,
            Some(digest) => Some(format!("rank {rank} ({})", digest.short())),
            None => Some(format!("rank {rank} (malformed digest)")),
        })
        .collect();
    if !dissenting.is_empty() {
        bail!(
            "ranks resolved different training plans: rank 0 has {}, but {} differ",
            reference.short(),
            dissenting.join(", ")
        );
    }
    Ok(reference)
}

#[cfg(test)]
mod tests {
    use nanorun_topology::{resolve, HorizonRequest};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::run_local_ranks;

    #[test_log::test]
    fn identical_plans_agree() {
        let results = run_local_ranks(4, |ctx| {
            let plan = resolve(20, 32, 524288, 2048, ctx.world_size()).unwrap();
            let horizon = plan.horizon(&HorizonRequest::default()).unwrap();
            ensure_plan_agreement(&ctx, &plan, &horizon)
                .map(|digest| digest == PlanDigest::of(&(plan, horizon)).unwrap())
        });
        for result in results {
            assert!(result.unwrap());
        }
    }

    #[test_log::test]
    fn a_diverging_rank_fails_everyone() {
        let results = run_local_ranks(3, |ctx| {
            let device_batch_size = if ctx.rank() == 2 { 16 } else { 32 };
            let plan = resolve(20, device_batch_size, 393216, 2048, ctx.world_size()).unwrap();
            let horizon = plan.horizon(&HorizonRequest::default()).unwrap();
            ensure_plan_agreement(&ctx, &plan, &horizon).map_err(|err| err.to_string())
        });
        for result in results {
            let err = result.unwrap_err();
            assert!(err.contains("rank 2 ("), "{err}");
            assert!(!err.contains("rank 1 ("), "{err}");
        }
    }

    #[test_log::test]
    fn a_diverging_horizon_fails_everyone() {
        let results = run_local_ranks(2, |ctx| {
            let plan = resolve(20, 32, 524288, 2048, ctx.world_size()).unwrap();
            let request = HorizonRequest {
                num_iterations: Some(100 + ctx.rank() as u64),
                ..Default::default()
            };
            let horizon = plan.horizon(&request).unwrap();
            ensure_plan_agreement(&ctx, &plan, &horizon).is_err()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn malformed_digests_are_named() {
        let good = resolve(20, 32, 524288, 2048, 2).unwrap().digest().unwrap();
        let err = check_digests(&[good.as_bytes().to_vec(), vec![1, 2, 3]]).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "ranks resolved different training plans: rank 0 has {}, but rank 1 (malformed digest) differ",
                good.short()
            )
        );
    }
}
