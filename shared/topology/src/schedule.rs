use serde::{Deserialize, Serialize};

use crate::TopologyError;

/// How one optimizer step's worth of tokens is split across ranks and micro-steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSchedule {
    pub device_batch_size: u32,
    pub sequence_length: u32,
    pub world_size: u64,
    pub tokens_per_process_step: u64,
    pub tokens_per_world_microbatch: u64,
    pub total_batch_size: u64,
    pub grad_accum_steps: u64,
}

impl BatchSchedule {
    pub fn new(
        device_batch_size: u32,
        sequence_length: u32,
        world_size: u64,
        total_batch_size: u64,
    ) -> Result<Self, TopologyError> {
        if device_batch_size == 0 {
            return Err(TopologyError::NonPositive {
                name: "device_batch_size",
            });
        }
        if sequence_length == 0 {
            return Err(TopologyError::NonPositive {
                name: "sequence_length",
            });
        }
        if world_size == 0 {
            return Err(TopologyError::NonPositive { name: "world_size" });
        }
        if total_batch_size == 0 {
            return Err(TopologyError::NonPositive {
                name: "total_batch_size",
            });
        }

        let tokens_per_process_step = device_batch_size as u64 * sequence_length as u64;
        // a microbatch wider than u64 can never divide a u64 total
        let world_microbatch = tokens_per_process_step as u128 * world_size as u128;
        let tokens_per_world_microbatch = match u64::try_from(world_microbatch) {
            Ok(tokens) if total_batch_size % tokens == 0 => tokens,
            _ => {
                let below = (total_batch_size as u128 / world_microbatch * world_microbatch) as u64;
                return Err(TopologyError::NotDivisible {
                    total_batch_size,
                    tokens_per_world_microbatch: world_microbatch,
                    device_batch_size,
                    sequence_length,
                    world_size,
                    nearest_below: Some(below).filter(|below| *below > 0),
                    nearest_above: u64::try_from(below as u128 + world_microbatch).ok(),
                });
            }
        };

        Ok(Self {
            device_batch_size,
            sequence_length,
            world_size,
            tokens_per_process_step,
            tokens_per_world_microbatch,
            total_batch_size,
            grad_accum_steps: total_batch_size / tokens_per_world_microbatch,
        })
    }

    /// Number of forward/backward passes each rank runs per optimizer step.
    pub fn micro_steps_per_iteration(&self) -> u64 {
        self.grad_accum_steps
    }

    /// Whether the optimizer steps after micro-step `micro_step` (counted from zero).
    pub fn is_optimizer_step(&self, micro_step: u64) -> bool {
        (micro_step + 1) % self.grad_accum_steps == 0
    }

    /// Factor each micro-step's loss is scaled by so accumulated gradients average.
    pub fn loss_scale(&self) -> f64 {
        1.0 / self.grad_accum_steps as f64
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn exact_multiples_accumulate() {
        let s = BatchSchedule::new(48, 2048, 8, 786432).unwrap();
        assert_eq!(s.tokens_per_process_step, 98304);
        assert_eq!(s.tokens_per_world_microbatch, 786432);
        assert_eq!(s.grad_accum_steps, 1);

        let s = BatchSchedule::new(24, 2048, 8, 393216).unwrap();
        assert_eq!(s.grad_accum_steps, 1);

        let s = BatchSchedule::new(16, 2048, 8, 262144).unwrap();
        assert_eq!(s.tokens_per_world_microbatch, 262144);
        assert_eq!(s.grad_accum_steps, 1);

        let s = BatchSchedule::new(32, 2048, 2, 524288).unwrap();
        assert_eq!(s.grad_accum_steps, 4);
        assert_eq!(s.loss_scale(), 0.25);
    }

    #[test]
    fn remainders_are_rejected_with_neighbours() {
        let err = BatchSchedule::new(20, 2048, 8, 300000).unwrap_err();
        match &err {
            TopologyError::NotDivisible {
                tokens_per_world_microbatch,
                nearest_below,
                nearest_above,
                ..
            } => {
                assert_eq!(*tokens_per_world_microbatch, 327680);
                assert_eq!(*nearest_below, None);
                assert_eq!(*nearest_above, Some(327680));
            }
            other => panic!("expected divisibility error, got {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "total_batch_size 300000 is not divisible by tokens_per_world_microbatch 327680 \
             (device_batch_size 20 x sequence_length 2048 x world_size 8); nearest valid total is 327680"
        );

        let err = BatchSchedule::new(20, 2048, 8, 700000).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("nearest valid totals are 655360 and 983040"));
    }

    #[test]
    fn microbatches_wider_than_the_total_never_divide() {
        let err = BatchSchedule::new(u32::MAX, u32::MAX, u64::MAX, u64::MAX).unwrap_err();
        match err {
            TopologyError::NotDivisible {
                tokens_per_world_microbatch,
                nearest_below,
                nearest_above,
                ..
            } => {
                assert!(tokens_per_world_microbatch > u64::MAX as u128);
                assert_eq!(nearest_below, None);
                assert_eq!(nearest_above, None);
            }
            other => panic!("expected divisibility error, got {other:?}"),
        }
    }

    #[test]
    fn optimizer_steps_close_each_accumulation_window() {
        let s = BatchSchedule::new(8, 1024, 4, 8 * 1024 * 4 * 3).unwrap();
        assert_eq!(s.micro_steps_per_iteration(), 3);
        let steps: Vec<bool> = (0..6).map(|m| s.is_optimizer_step(m)).collect();
        assert_eq!(steps, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn zero_knobs_are_rejected() {
        assert!(matches!(
            BatchSchedule::new(0, 2048, 8, 1),
            Err(TopologyError::NonPositive {
                name: "device_batch_size"
            })
        ));
        assert!(matches!(
            BatchSchedule::new(1, 2048, 0, 1),
            Err(TopologyError::NonPositive { name: "world_size" })
        ));
        assert!(matches!(
            BatchSchedule::new(1, 2048, 1, 0),
            Err(TopologyError::NonPositive {
                name: "total_batch_size"
            })
        ));
    }
}
