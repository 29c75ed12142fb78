//! Per-process compute bootstrap for multi-process training runs.
//!
//! A run is distributed when the launcher exported `RANK`, `LOCAL_RANK` and
//! `WORLD_SIZE`, no matter what hardware the process finds. The device kind
//! only picks the collective backend.
//!
//! ```no_run
//! use nanorun_compute::{initialize, ComputeGuard, DeviceRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = ComputeGuard::new(initialize(DeviceRequest::Auto)?);
//! if ctx.is_master() {
//!     println!("{} ranks on {}", ctx.world_size(), ctx.backend());
//! }
//! ctx.barrier()?;
//! // the group is torn down when `ctx` drops
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod collective;
mod device;
mod launch_env;
mod local;
mod tcp_store;

pub use bootstrap::{finalize, initialize, BootstrapError, Bootstrapper, ComputeContext, ComputeGuard};
pub use collective::{Backend, Collective, CollectiveError, GroupSpec};
pub use device::{
    device_for_local_rank, resolve_device_kind, AcceleratorProbe, Device, DeviceError, DeviceKind,
    DeviceParseError, DeviceRequest, FixedProbe, SystemProbe,
};
pub use launch_env::{
    LaunchEnv, LaunchEnvError, LaunchSignals, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT,
    LOCAL_RANK_VAR, MASTER_ADDR_VAR, MASTER_PORT_VAR, RANK_VAR, WORLD_SIZE_VAR,
};
pub use local::{LocalCollective, LocalHub};
pub use tcp_store::{TcpStoreCollective, DEFAULT_CONNECT_TIMEOUT};
