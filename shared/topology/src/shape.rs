use serde::{Deserialize, Serialize};

use crate::TopologyError;

/// Model width per unit of depth. Fixed aspect ratio, not a tunable.
pub const WIDTH_PER_LAYER: u64 = 64;
/// Target width of a single attention head.
pub const HEAD_WIDTH: u64 = 128;
pub const DEFAULT_VOCAB_SIZE: u32 = 65536;

/// Transformer dimensions derived from the depth knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    pub depth: u32,
    pub model_width: u64,
    pub head_count: u64,
    pub kv_head_count: u64,
    pub head_dim: u64,
    pub vocab_size: u32,
    pub sequence_length: u32,
}

impl ModelShape {
    pub fn from_depth(depth: u32, vocab_size: u32, sequence_length: u32) -> Result<Self, TopologyError> {
        for (name, value) in [
            ("depth", depth),
            ("vocab_size", vocab_size),
            ("sequence_length", sequence_length),
        ] {
            if value == 0 {
                return Err(TopologyError::NonPositive { name });
            }
        }

        let model_width = WIDTH_PER_LAYER * depth as u64;
        let head_count = model_width.div_ceil(HEAD_WIDTH);
        if model_width % head_count != 0 {
            return Err(TopologyError::Parity {
                depth,
                model_width,
                head_count,
            });
        }

        Ok(Self {
            depth,
            model_width,
            head_count,
            kv_head_count: head_count,
            head_dim: model_width / head_count,
            vocab_size,
            sequence_length,
        })
    }

    /// Untied embedding and unembedding, q/k/v/o projections and a 4x MLP per layer.
    ///
    /// Exact for every representable depth: even `u32::MAX` layers stay far
    /// below `u128::MAX`.
    pub fn num_params(&self) -> u128 {
        let d = self.model_width as u128;
        let attention = 2 * d * (self.head_count * self.head_dim) as u128
            + 2 * d * (self.kv_head_count * self.head_dim) as u128;
        let mlp = 8 * d * d;
        2 * self.vocab_size as u128 * d + self.depth as u128 * (attention + mlp)
    }

    /// Forward plus backward FLOPs per token: matmuls over the non-embedding
    /// parameters, plus attention over the full sequence.
    pub fn flops_per_token(&self) -> u128 {
        let embedding = self.vocab_size as u128 * self.model_width as u128;
        let attention = 12
            * self.depth as u128
            * self.head_count as u128
            * self.head_dim as u128
            * self.sequence_length as u128;
        6 * (self.num_params() - embedding) + attention
    }
}
