use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Args;
use nanorun_compute::{DeviceRequest, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT, WORLD_SIZE_VAR};
use nanorun_topology::{PlanRequest, Preset};

/// The knobs a training plan is resolved from.
///
/// Precedence, lowest first: the `--config` file, then `--preset`, then
/// individual flags.
#[derive(Args, Debug, Clone, Default)]
pub struct PlanArgs {
    /// TOML file holding any subset of the plan knobs
    #[clap(long, env = "NANORUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Named scale point: d20, 3b or 7b
    #[clap(long, env = "NANORUN_PRESET")]
    pub preset: Option<Preset>,

    /// Transformer depth. Sets width (64 per layer) and head count (128 wide heads)
    #[clap(long)]
    pub depth: Option<u32>,

    /// Sequences per rank per micro-step
    #[clap(long, alias = "device_batch_size")]
    pub device_batch_size: Option<u32>,

    /// Tokens per optimizer step across all ranks
    #[clap(long, alias = "total_batch_size")]
    pub total_batch_size: Option<u64>,

    #[clap(long, alias = "max_seq_len", alias = "sequence_length")]
    pub sequence_length: Option<u32>,

    #[clap(long, alias = "vocab_size")]
    pub vocab_size: Option<u32>,

    /// Train for exactly this many optimizer steps
    #[clap(long, alias = "num_iterations")]
    pub num_iterations: Option<u64>,

    /// Train until this many FLOPs are spent, unless --num-iterations is given
    #[clap(long, alias = "target_flops")]
    pub target_flops: Option<f64>,

    /// Train on this many tokens per parameter, unless an iteration count or FLOP budget is given
    #[clap(long, alias = "target_param_data_ratio")]
    pub target_param_data_ratio: Option<f64>,
}

impl PlanArgs {
    pub fn request(&self) -> Result<PlanRequest> {
        let mut request = match &self.config {
            Some(path) => load_config(path)?,
            None => PlanRequest::default(),
        };

        if let Some(preset) = self.preset {
            let knobs = preset.request();
            request.depth = knobs.depth;
            request.device_batch_size = knobs.device_batch_size;
            request.total_batch_size = knobs.total_batch_size;
            request.sequence_length = knobs.sequence_length;
        }

        if let Some(depth) = self.depth {
            request.depth = depth;
        }
        if let Some(device_batch_size) = self.device_batch_size {
            request.device_batch_size = device_batch_size;
        }
        if let Some(total_batch_size) = self.total_batch_size {
            request.total_batch_size = total_batch_size;
        }
        if let Some(sequence_length) = self.sequence_length {
            request.sequence_length = sequence_length;
        }
        if let Some(vocab_size) = self.vocab_size {
            request.vocab_size = vocab_size;
        }
        if let Some(num_iterations) = self.num_iterations {
            request.horizon.num_iterations = Some(num_iterations);
        }
        if let Some(target_flops) = self.target_flops {
            request.horizon.target_flops = Some(target_flops);
        }
        if let Some(ratio) = self.target_param_data_ratio {
            request.horizon.target_param_data_ratio = ratio;
        }
        Ok(request)
    }
}

fn load_config(path: &Path) -> Result<PlanRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse config file {}", path.display()))
}

#[derive(Args, Debug, Clone)]
pub struct PlanCommandArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Number of ranks to plan for
    #[clap(long, env = WORLD_SIZE_VAR, default_value_t = 1)]
    pub world_size: usize,

    /// Print the plan as JSON
    #[clap(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct InitArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// auto, cuda or cpu. `auto` uses an accelerator when one is visible
    #[clap(long, alias = "device_type", env = "NANORUN_DEVICE_TYPE", default_value_t = DeviceRequest::Auto)]
    pub device_type: DeviceRequest,

    /// Seconds to keep retrying the rendezvous store before giving up
    #[clap(long, env = "NANORUN_CONNECT_TIMEOUT_SECS", default_value_t = 300)]
    pub connect_timeout_secs: u64,
}

impl InitArgs {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SpawnArgs {
    /// Processes to start on this host, one per accelerator
    #[clap(long, alias = "nproc_per_node", value_parser = clap::value_parser!(u16).range(1..))]
    pub nproc_per_node: u16,

    #[clap(long, default_value = DEFAULT_MASTER_ADDR)]
    pub master_addr: String,

    #[clap(long, default_value_t = DEFAULT_MASTER_PORT)]
    pub master_port: u16,

    /// Arguments passed through to every `nanorun init`
    #[clap(last = true)]
    pub init_args: Vec<OsString>,
}
