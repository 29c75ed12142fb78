//! Turns the depth knob and batch sizes into a model shape and a per-rank
//! micro-batch schedule, rejecting any configuration that would leave ranks
//! with different views of the run.
//!
//! ```
//! let plan = nanorun_topology::resolve(38, 48, 786432, 2048, 8)?;
//! assert_eq!(plan.shape.model_width, 2432);
//! assert_eq!(plan.schedule.grad_accum_steps, 1);
//! # Ok::<(), nanorun_topology::TopologyError>(())
//! ```

mod error;
mod horizon;
mod plan;
mod preset;
mod schedule;
mod shape;

pub use error::TopologyError;
pub use horizon::{HorizonRequest, HorizonSource, TrainingHorizon, DEFAULT_PARAM_DATA_RATIO};
pub use plan::{resolve, PlanDigest, PlanRequest, TrainingPlan, DEFAULT_SEQUENCE_LENGTH};
pub use preset::Preset;
pub use schedule::BatchSchedule;
pub use shape::{ModelShape, DEFAULT_VOCAB_SIZE, HEAD_WIDTH, WIDTH_PER_LAYER};
