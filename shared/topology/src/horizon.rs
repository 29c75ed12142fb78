use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{BatchSchedule, ModelShape, TopologyError};

pub const DEFAULT_PARAM_DATA_RATIO: f64 = 20.0;

fn default_param_data_ratio() -> f64 {
    DEFAULT_PARAM_DATA_RATIO
}

/// How long to train. The first knob that is set wins: an explicit iteration
/// count, then a FLOP budget, then a tokens-per-parameter ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizonRequest {
    #[serde(default)]
    pub num_iterations: Option<u64>,
    #[serde(default)]
    pub target_flops: Option<f64>,
    #[serde(default = "default_param_data_ratio")]
    pub target_param_data_ratio: f64,
}

impl Default for HorizonRequest {
    fn default() -> Self {
        Self {
            num_iterations: None,
            target_flops: None,
            target_param_data_ratio: DEFAULT_PARAM_DATA_RATIO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HorizonSource {
    Iterations,
    TargetFlops,
    ParamDataRatio,
}

impl fmt::Display for HorizonSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HorizonSource::Iterations => write!(f, "explicit iteration count"),
            HorizonSource::TargetFlops => write!(f, "FLOP budget"),
            HorizonSource::ParamDataRatio => write!(f, "tokens-per-parameter ratio"),
        }
    }
}

/// The run length derived from a [`HorizonRequest`]. Resolved after the plan,
/// so a degenerate horizon never invalidates a valid shape and schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingHorizon {
    pub source: HorizonSource,
    pub num_iterations: u64,
    pub total_tokens: u64,
    pub tokens_per_param: f64,
    pub total_flops: f64,
}

impl TrainingHorizon {
    pub fn resolve(
        request: &HorizonRequest,
        shape: &ModelShape,
        schedule: &BatchSchedule,
    ) -> Result<Self, TopologyError> {
        let num_params = shape.num_params();
        let flops_per_token = shape.flops_per_token();
        let total_batch_size = schedule.total_batch_size;

        let (source, num_iterations) = if let Some(num_iterations) = request.num_iterations {
            if num_iterations == 0 {
                return Err(TopologyError::NonPositive {
                    name: "num_iterations",
                });
            }
            (HorizonSource::Iterations, num_iterations)
        } else if let Some(target_flops) = request.target_flops {
            check_positive("target_flops", target_flops)?;
            let steps = (target_flops / (flops_per_token as f64 * total_batch_size as f64)).round();
            (
                HorizonSource::TargetFlops,
                whole_steps(steps, || format!("{target_flops:e} FLOPs"), total_batch_size)?,
            )
        } else {
            let ratio = request.target_param_data_ratio;
            check_positive("target_param_data_ratio", ratio)?;
            let steps = (ratio * num_params as f64 / total_batch_size as f64).floor();
            (
                HorizonSource::ParamDataRatio,
                whole_steps(steps, || format!("{ratio} tokens per parameter"), total_batch_size)?,
            )
        };

        let total_tokens = num_iterations
            .checked_mul(total_batch_size)
            .ok_or(TopologyError::Overflow {
                what: "total training tokens",
            })?;

        Ok(Self {
            source,
            num_iterations,
            total_tokens,
            tokens_per_param: total_tokens as f64 / num_params as f64,
            total_flops: flops_per_token as f64 * total_tokens as f64,
        })
    }
}

impl TrainingHorizon {
    pub fn log_summary(&self) {
        info!(
            source = %self.source,
            num_iterations = self.num_iterations,
            total_tokens = self.total_tokens,
            tokens_per_param = self.tokens_per_param,
            total_flops = self.total_flops,
            "training horizon"
        );
    }
}

impl fmt::Display for TrainingHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "horizon ({})", self.source)?;
        writeln!(f, "  iterations                   {}", self.num_iterations)?;
        writeln!(f, "  tokens                       {}", self.total_tokens)?;
        writeln!(f, "  tokens per parameter         {:.2}", self.tokens_per_param)?;
        write!(f, "  total flops                  {:e}", self.total_flops)
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), TopologyError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TopologyError::InvalidHorizon { name, value })
    }
}

fn whole_steps(
    steps: f64,
    target: impl FnOnce() -> String,
    total_batch_size: u64,
) -> Result<u64, TopologyError> {
    if steps < 1.0 {
        return Err(TopologyError::EmptyHorizon {
            target: target(),
            total_batch_size,
        });
    }
    if steps >= u64::MAX as f64 {
        return Err(TopologyError::Overflow {
            what: "iteration count",
        });
    }
    Ok(steps as u64)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::DEFAULT_VOCAB_SIZE;

    fn d20() -> (ModelShape, BatchSchedule) {
        (
            ModelShape::from_depth(20, DEFAULT_VOCAB_SIZE, 2048).unwrap(),
            BatchSchedule::new(32, 2048, 8, 524288).unwrap(),
        )
    }

    #[test]
    fn ratio_is_the_default() {
        let (shape, schedule) = d20();
        let h = TrainingHorizon::resolve(&HorizonRequest::default(), &shape, &schedule).unwrap();
        assert_eq!(h.source, HorizonSource::ParamDataRatio);
        // 20 * 560_988_160 / 524_288 happens to divide exactly
        assert_eq!(h.num_iterations, 21400);
        assert_eq!(h.total_tokens, 21400 * 524288);
        assert_eq!(h.tokens_per_param, 20.0);
    }

    #[test]
    fn explicit_iterations_win() {
        let (shape, schedule) = d20();
        let request = HorizonRequest {
            num_iterations: Some(10),
            target_flops: Some(1e18),
            target_param_data_ratio: 20.0,
        };
        let h = TrainingHorizon::resolve(&request, &shape, &schedule).unwrap();
        assert_eq!(h.source, HorizonSource::Iterations);
        assert_eq!(h.num_iterations, 10);
        assert_eq!(h.total_tokens, 5_242_880);
    }

    #[test]
    fn flop_budget_beats_ratio() {
        let (shape, schedule) = d20();
        let flops_per_step = shape.flops_per_token() as f64 * 524288.0;
        let request = HorizonRequest {
            target_flops: Some(flops_per_step * 100.4),
            ..Default::default()
        };
        let h = TrainingHorizon::resolve(&request, &shape, &schedule).unwrap();
        assert_eq!(h.source, HorizonSource::TargetFlops);
        assert_eq!(h.num_iterations, 100);
    }

    #[test]
    fn degenerate_horizons_are_rejected() {
        let (shape, schedule) = d20();
        let reject = |request: HorizonRequest| {
            TrainingHorizon::resolve(&request, &shape, &schedule).unwrap_err()
        };
        assert!(matches!(
            reject(HorizonRequest {
                num_iterations: Some(0),
                ..Default::default()
            }),
            TopologyError::NonPositive {
                name: "num_iterations"
            }
        ));
        assert!(matches!(
            reject(HorizonRequest {
                target_flops: Some(f64::NAN),
                ..Default::default()
            }),
            TopologyError::InvalidHorizon {
                name: "target_flops",
                ..
            }
        ));
        assert!(matches!(
            reject(HorizonRequest {
                target_param_data_ratio: -1.0,
                ..Default::default()
            }),
            TopologyError::InvalidHorizon {
                name: "target_param_data_ratio",
                ..
            }
        ));
        assert!(matches!(
            reject(HorizonRequest {
                target_param_data_ratio: 1e-9,
                ..Default::default()
            }),
            TopologyError::EmptyHorizon { .. }
        ));
    }

    #[test]
    fn tiny_models_with_huge_batches_have_no_ratio_horizon() {
        let shape = ModelShape::from_depth(4, DEFAULT_VOCAB_SIZE, 2048).unwrap();
        let schedule = BatchSchedule::new(1, 2048, 1, 1 << 30).unwrap();
        let err = TrainingHorizon::resolve(&HorizonRequest::default(), &shape, &schedule)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "a horizon of 20 tokens per parameter rounds to zero optimizer steps at total_batch_size 1073741824"
        );

        let request = HorizonRequest {
            num_iterations: Some(3),
            ..Default::default()
        };
        let h = TrainingHorizon::resolve(&request, &shape, &schedule).unwrap();
        assert_eq!(h.total_tokens, 3 << 30);
    }
}
