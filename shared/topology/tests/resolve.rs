use std::{sync::Arc, thread};

use nanorun_topology::{resolve, PlanRequest, Preset, TopologyError};
use pretty_assertions::assert_eq;

#[test]
fn shapes_at_the_named_scales() {
    let plan = resolve(38, 48, 786432, 2048, 8).unwrap();
    assert_eq!(plan.shape.model_width, 2432);
    assert_eq!(plan.shape.head_count, 19);
    assert_eq!(plan.shape.kv_head_count, 19);

    let plan = resolve(52, 16, 262144, 2048, 8).unwrap();
    assert_eq!(plan.shape.model_width, 3328);
    assert_eq!(plan.shape.head_count, 26);
}

#[test]
fn accumulation_arithmetic() {
    let plan = resolve(38, 48, 786432, 2048, 8).unwrap();
    assert_eq!(plan.schedule.grad_accum_steps, 1);

    let plan = resolve(38, 24, 393216, 2048, 8).unwrap();
    assert_eq!(plan.schedule.grad_accum_steps, 1);

    let plan = resolve(52, 16, 262144, 2048, 8).unwrap();
    assert_eq!(plan.schedule.tokens_per_world_microbatch, 262144);
    assert_eq!(plan.schedule.grad_accum_steps, 1);

    // fewer ranks, same global batch: each rank accumulates more
    let plan = resolve(38, 48, 786432, 2048, 2).unwrap();
    assert_eq!(plan.schedule.grad_accum_steps, 4);
}

#[test]
fn non_divisible_totals_are_rejected() {
    let err = resolve(20, 20, 300000, 2048, 8).unwrap_err();
    assert!(matches!(
        err,
        TopologyError::NotDivisible {
            total_batch_size: 300000,
            tokens_per_world_microbatch: 327680,
            ..
        }
    ));
}

#[test]
fn divisibility_holds_for_every_accepted_plan() {
    for device_batch_size in 1..=12u32 {
        for world_size in 1..=8usize {
            for total_batch_size in (1..=64u64).map(|k| k * 4096) {
                let microbatch = device_batch_size as u64 * 512 * world_size as u64;
                match resolve(4, device_batch_size, total_batch_size, 512, world_size) {
                    Ok(plan) => {
                        assert_eq!(total_batch_size % microbatch, 0);
                        assert_eq!(
                            plan.schedule.grad_accum_steps * microbatch,
                            total_batch_size
                        );
                        assert!(plan.schedule.grad_accum_steps >= 1);
                    }
                    Err(TopologyError::NotDivisible { .. }) => {
                        assert_ne!(total_batch_size % microbatch, 0)
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        }
    }
}

#[test]
fn non_positive_knobs_are_rejected() {
    assert!(matches!(
        resolve(0, 32, 524288, 2048, 8),
        Err(TopologyError::NonPositive { name: "depth" })
    ));
    assert!(matches!(
        resolve(20, 0, 524288, 2048, 8),
        Err(TopologyError::NonPositive {
            name: "device_batch_size"
        })
    ));
    assert!(matches!(
        resolve(20, 32, 524288, 0, 8),
        Err(TopologyError::NonPositive {
            name: "sequence_length"
        })
    ));
    assert!(matches!(
        resolve(20, 32, 524288, 2048, 0),
        Err(TopologyError::NonPositive { name: "world_size" })
    ));
}

#[test]
fn odd_depth_parity() {
    assert!(resolve(1, 1, 2048, 2048, 1).is_ok());
    assert!(matches!(
        resolve(19, 32, 524288, 2048, 8),
        Err(TopologyError::Parity { .. })
    ));
}

#[test]
fn every_simulated_rank_resolves_the_same_plan() {
    let request = Arc::new(Preset::ThreeB.request());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let request = request.clone();
            thread::spawn(move || {
                let plan = request.resolve(8).unwrap();
                (plan, plan.digest().unwrap())
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let (first_plan, first_digest) = results[0];
    for (plan, digest) in results {
        assert_eq!(plan, first_plan);
        assert_eq!(digest, first_digest);
    }

    // a second invocation in this process agrees too
    let again = request.resolve(8).unwrap();
    assert_eq!(again.digest().unwrap(), first_digest);
}

#[test]
fn world_size_is_part_of_the_plan() {
    let request = PlanRequest::default();
    let eight = request.resolve(8).unwrap().digest().unwrap();
    let four = request.resolve(4).unwrap().digest().unwrap();
    assert_ne!(eight, four);
}

#[test]
fn valid_knobs_always_resolve() {
    // one microbatch per step on a tiny model: far less than one step of data per parameter
    let plan = resolve(4, 1, 1 << 30, 2048, 1).unwrap();
    assert_eq!(plan.shape.model_width, 256);
    assert_eq!(plan.schedule.grad_accum_steps, 1 << 19);

    // wide enough that the parameter count leaves 64 bits behind
    let plan = resolve(2_000_000, 1, 2048, 2048, 1).unwrap();
    assert_eq!(plan.shape.model_width, 128_000_000);
    assert_eq!(plan.schedule.grad_accum_steps, 1);
}
