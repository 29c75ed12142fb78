use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{
    shape::DEFAULT_VOCAB_SIZE, BatchSchedule, HorizonRequest, ModelShape, TopologyError,
    TrainingHorizon,
};

pub const DEFAULT_SEQUENCE_LENGTH: u32 = 2048;

/// The user-facing knobs a plan is resolved from. Everything except the
/// world size, which comes from the compute context.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanRequest {
    pub depth: u32,
    pub device_batch_size: u32,
    pub total_batch_size: u64,
    pub sequence_length: u32,
    pub vocab_size: u32,
    pub horizon: HorizonRequest,
}

impl PlanRequest {
    pub(crate) fn base() -> Self {
        Self {
            depth: 20,
            device_batch_size: 32,
            total_batch_size: 524288,
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
            vocab_size: DEFAULT_VOCAB_SIZE,
            horizon: HorizonRequest::default(),
        }
    }

    /// Derives the shape and schedule for `world_size` ranks, or names the
    /// first invariant the request violates. Pure: every rank that resolves
    /// the same request gets a bit-identical plan. The horizon knobs are not
    /// consulted here, see [`TrainingPlan::horizon`].
    pub fn resolve(&self, world_size: usize) -> Result<TrainingPlan, TopologyError> {
        let shape = ModelShape::from_depth(self.depth, self.vocab_size, self.sequence_length)?;
        let schedule = BatchSchedule::new(
            self.device_batch_size,
            self.sequence_length,
            world_size as u64,
            self.total_batch_size,
        )?;
        Ok(TrainingPlan { shape, schedule })
    }
}

impl Default for PlanRequest {
    fn default() -> Self {
        Self::base()
    }
}

/// Resolves a plan with the default vocabulary.
pub fn resolve(
    depth: u32,
    device_batch_size: u32,
    total_batch_size: u64,
    sequence_length: u32,
    world_size: usize,
) -> Result<TrainingPlan, TopologyError> {
    PlanRequest {
        depth,
        device_batch_size,
        total_batch_size,
        sequence_length,
        ..PlanRequest::default()
    }
    .resolve(world_size)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPlan {
    pub shape: ModelShape,
    pub schedule: BatchSchedule,
}

impl TrainingPlan {
    pub fn num_params(&self) -> u128 {
        self.shape.num_params()
    }

    pub fn flops_per_token(&self) -> u128 {
        self.shape.flops_per_token()
    }

    /// How many optimizer steps to run. Unlike [`PlanRequest::resolve`] this
    /// can reject a request whose knobs are all positive, e.g. a ratio that
    /// rounds to zero steps.
    pub fn horizon(&self, request: &HorizonRequest) -> Result<TrainingHorizon, TopologyError> {
        TrainingHorizon::resolve(request, &self.shape, &self.schedule)
    }

    pub fn digest(&self) -> Result<PlanDigest, TopologyError> {
        PlanDigest::of(self)
    }

    pub fn log_summary(&self) {
        let TrainingPlan { shape, schedule } = self;
        info!(
            depth = shape.depth,
            model_width = shape.model_width,
            head_count = shape.head_count,
            kv_head_count = shape.kv_head_count,
            head_dim = shape.head_dim,
            num_params = %self.num_params(),
            "model shape"
        );
        info!(
            world_size = schedule.world_size,
            device_batch_size = schedule.device_batch_size,
            sequence_length = schedule.sequence_length,
            tokens_per_world_microbatch = schedule.tokens_per_world_microbatch,
            total_batch_size = schedule.total_batch_size,
            grad_accum_steps = schedule.grad_accum_steps,
            "batch schedule"
        );
    }
}

impl fmt::Display for TrainingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let TrainingPlan { shape, schedule } = self;
        writeln!(f, "model")?;
        writeln!(f, "  depth                        {}", shape.depth)?;
        writeln!(f, "  model_width                  {}", shape.model_width)?;
        writeln!(
            f,
            "  heads (q/kv) x head_dim      {}/{} x {}",
            shape.head_count, shape.kv_head_count, shape.head_dim
        )?;
        writeln!(f, "  vocab_size                   {}", shape.vocab_size)?;
        writeln!(f, "  parameters                   {}", self.num_params())?;
        writeln!(
            f,
            "  flops per token              {:e}",
            self.flops_per_token() as f64
        )?;
        writeln!(f, "schedule")?;
        writeln!(f, "  world_size                   {}", schedule.world_size)?;
        writeln!(
            f,
            "  device_batch_size x seq      {} x {}",
            schedule.device_batch_size, schedule.sequence_length
        )?;
        writeln!(
            f,
            "  tokens_per_world_microbatch  {}",
            schedule.tokens_per_world_microbatch
        )?;
        writeln!(f, "  total_batch_size             {}", schedule.total_batch_size)?;
        write!(f, "  grad_accum_steps             {}", schedule.grad_accum_steps)
    }
}

/// SHA-256 over the plan's wire encoding. Ranks compare these to prove they
/// resolved the same plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanDigest([u8; 32]);

impl PlanDigest {
    /// Hashes anything with a stable wire encoding, e.g. a plan together with
    /// its horizon.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, TopologyError> {
        let encoded = postcard::to_stdvec(value)?;
        Ok(Self(Sha256::digest(&encoded).into()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for PlanDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
