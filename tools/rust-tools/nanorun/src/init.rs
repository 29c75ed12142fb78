use anyhow::{Context, Result};
use nanorun_compute::{Bootstrapper, ComputeContext, ComputeGuard};
use nanorun_topology::{PlanDigest, PlanRequest, TrainingHorizon, TrainingPlan};
use tracing::{debug, info, info_span};

use crate::{agreement::ensure_plan_agreement, args::InitArgs};

pub fn run(args: InitArgs) -> Result<()> {
    // a bad config file fails every rank before any of them touches the group
    let request = args.plan.request()?;

    let ctx = ComputeGuard::new(
        Bootstrapper::from_env(args.device_type)?
            .with_connect_timeout(args.connect_timeout())
            .initialize()
            .context("compute bootstrap failed")?,
    );
    let agreed = init_rank(&ctx, &request)?;
    debug!(
        digest = %agreed.digest.short(),
        grad_accum_steps = agreed.plan.schedule.grad_accum_steps,
        num_iterations = agreed.horizon.num_iterations,
        "rank ready"
    );
    Ok(())
}

/// What one rank settled on once every rank agreed.
#[derive(Debug)]
pub struct AgreedPlan {
    pub plan: TrainingPlan,
    pub horizon: TrainingHorizon,
    pub digest: PlanDigest,
}

/// Resolves the plan for this context's world, checks it against every other
/// rank and meets them at a final barrier.
pub fn init_rank(ctx: &ComputeContext, request: &PlanRequest) -> Result<AgreedPlan> {
    let _rank = info_span!("rank", rank = ctx.rank()).entered();

    let plan = request
        .resolve(ctx.world_size())
        .context("invalid training topology")?;
    let horizon = plan
        .horizon(&request.horizon)
        .context("invalid training horizon")?;
    let digest = ensure_plan_agreement(ctx, &plan, &horizon)?;

    if ctx.is_master() {
        plan.log_summary();
        horizon.log_summary();
        info!(
            world_size = ctx.world_size(),
            device = %ctx.device(),
            backend = %ctx.backend(),
            digest = %digest,
            "all ranks resolved the same plan"
        );
    }

    ctx.barrier().context("final barrier failed")?;
    Ok(AgreedPlan {
        plan,
        horizon,
        digest,
    })
}
