use std::{ops::Deref, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    collective::{Backend, Collective, CollectiveError, GroupSpec},
    device::{
        device_for_local_rank, resolve_device_kind, AcceleratorProbe, Device, DeviceError,
        DeviceKind, DeviceRequest, SystemProbe,
    },
    launch_env::{LaunchEnv, LaunchEnvError},
    tcp_store::{TcpStoreCollective, DEFAULT_CONNECT_TIMEOUT},
};

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("could not read the launcher environment: {0}")]
    LaunchEnv(#[from] LaunchEnvError),

    #[error("could not resolve the compute device ({launch}): {source}")]
    Device {
        launch: LaunchEnv,
        #[source]
        source: DeviceError,
    },

    #[error("could not assign a {device_kind} device to this process ({launch}): {source}")]
    DeviceForRank {
        launch: LaunchEnv,
        device_kind: DeviceKind,
        #[source]
        source: DeviceError,
    },

    #[error(
        "failed to form the {backend} process group ({launch}, device kind {device_kind}): {source}"
    )]
    GroupFormation {
        launch: LaunchEnv,
        device_kind: DeviceKind,
        backend: Backend,
        #[source]
        source: CollectiveError,
    },

    #[error(
        "initial barrier failed on the {backend} process group ({launch}, device kind {device_kind}): {source}"
    )]
    Barrier {
        launch: LaunchEnv,
        device_kind: DeviceKind,
        backend: Backend,
        #[source]
        source: CollectiveError,
    },
}

/// Where this process sits in the run and what it computes on.
///
/// Built once by [`Bootstrapper::initialize`]. A distributed context owns the
/// process group; hand it to [`finalize`] (or wrap it in a [`ComputeGuard`])
/// before the process exits.
#[derive(Debug)]
pub struct ComputeContext {
    is_distributed: bool,
    rank: usize,
    local_rank: usize,
    world_size: usize,
    device_kind: DeviceKind,
    device: Device,
    backend: Backend,
    group: Option<Arc<dyn Collective>>,
}

impl ComputeContext {
    pub fn is_distributed(&self) -> bool {
        self.is_distributed
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn device_kind(&self) -> DeviceKind {
        self.device_kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Whether this context still holds a live process group.
    pub fn has_active_group(&self) -> bool {
        self.group.as_ref().is_some_and(|group| group.is_active())
    }

    pub fn barrier(&self) -> Result<(), CollectiveError> {
        match &self.group {
            Some(group) => group.barrier(),
            None => Ok(()),
        }
    }

    /// Payloads from every rank, indexed by rank. A single process just gets its own back.
    pub fn all_gather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError> {
        match &self.group {
            Some(group) => group.all_gather(payload),
            None => Ok(vec![payload.to_vec()]),
        }
    }
}

pub struct Bootstrapper {
    launch: LaunchEnv,
    request: DeviceRequest,
    probe: Box<dyn AcceleratorProbe>,
    collective: Option<Arc<dyn Collective>>,
    connect_timeout: Duration,
}

impl Bootstrapper {
    /// Captures the launcher variables from the process environment.
    pub fn from_env(request: DeviceRequest) -> Result<Self, BootstrapError> {
        Ok(Self::new(LaunchEnv::from_process_env()?, request))
    }

    pub fn new(launch: LaunchEnv, request: DeviceRequest) -> Self {
        Self {
            launch,
            request,
            probe: Box::new(SystemProbe),
            collective: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_probe(mut self, probe: impl AcceleratorProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Forms the group on `collective` instead of a TCP store at the launcher's rendezvous address.
    pub fn with_collective(mut self, collective: Arc<dyn Collective>) -> Self {
        self.collective = Some(collective);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn initialize(self) -> Result<ComputeContext, BootstrapError> {
        let Bootstrapper {
            launch,
            request,
            probe,
            collective,
            connect_timeout,
        } = self;

        let device_kind = match resolve_device_kind(request, probe.as_ref()) {
            Ok(kind) => kind,
            Err(source) => return Err(BootstrapError::Device { launch, source }),
        };
        let backend = Backend::for_device(device_kind);

        let Some(signals) = launch.signals().cloned() else {
            let device = match device_for_local_rank(device_kind, 0, probe.as_ref()) {
                Ok(device) => device,
                Err(source) => {
                    return Err(BootstrapError::DeviceForRank {
                        launch,
                        device_kind,
                        source,
                    })
                }
            };
            info!(%device, "single-process run");
            return Ok(ComputeContext {
                is_distributed: false,
                rank: 0,
                local_rank: 0,
                world_size: 1,
                device_kind,
                device,
                backend,
                group: None,
            });
        };

        if device_kind == DeviceKind::Cpu && request == DeviceRequest::Auto {
            warn!(
                rank = signals.rank,
                world_size = signals.world_size,
                "launched distributed but no accelerator was detected, forming the group on the {backend} backend"
            );
        }

        let device = match device_for_local_rank(device_kind, signals.local_rank, probe.as_ref()) {
            Ok(device) => device,
            Err(source) => {
                return Err(BootstrapError::DeviceForRank {
                    launch,
                    device_kind,
                    source,
                })
            }
        };

        let collective: Arc<dyn Collective> = match collective {
            Some(collective) => collective,
            None => match TcpStoreCollective::new(signals.rendezvous_addr(), connect_timeout) {
                Ok(store) => Arc::new(store),
                Err(source) => {
                    return Err(BootstrapError::GroupFormation {
                        launch,
                        device_kind,
                        backend,
                        source,
                    })
                }
            },
        };

        let spec = GroupSpec {
            rank: signals.rank,
            world_size: signals.world_size,
            backend,
        };
        debug!(rank = spec.rank, world_size = spec.world_size, %backend, ?collective, "forming process group");

        if let Err(source) = collective.form_group(spec) {
            tear_down_partial(collective.as_ref());
            return Err(BootstrapError::GroupFormation {
                launch,
                device_kind,
                backend,
                source,
            });
        }
        if let Err(source) = collective.barrier() {
            tear_down_partial(collective.as_ref());
            return Err(BootstrapError::Barrier {
                launch,
                device_kind,
                backend,
                source,
            });
        }

        info!(
            rank = signals.rank,
            local_rank = signals.local_rank,
            world_size = signals.world_size,
            %device,
            %backend,
            "process group ready"
        );
        Ok(ComputeContext {
            is_distributed: true,
            rank: signals.rank,
            local_rank: signals.local_rank,
            world_size: signals.world_size,
            device_kind,
            device,
            backend,
            group: Some(collective),
        })
    }
}

/// Bootstraps from the process environment with the default accelerator probe.
pub fn initialize(request: DeviceRequest) -> Result<ComputeContext, BootstrapError> {
    Bootstrapper::from_env(request)?.initialize()
}

fn tear_down_partial(collective: &dyn Collective) {
    if collective.is_active() {
        if let Err(err) = collective.destroy() {
            warn!("failed to tear down partially formed group: {err}");
        }
    }
}

/// Tears down the process group if one is still live. Safe to call any number
/// of times, on any context; failures are logged, never returned.
pub fn finalize(context: &ComputeContext) {
    let Some(group) = &context.group else {
        return;
    };
    if !group.is_active() {
        debug!(rank = context.rank(), "process group already torn down");
        return;
    }
    match group.destroy() {
        Ok(()) => info!(rank = context.rank(), "process group destroyed"),
        Err(err) => warn!(rank = context.rank(), "failed to destroy process group: {err}"),
    }
}

/// Owns a [`ComputeContext`] and finalizes it when dropped.
#[derive(Debug)]
pub struct ComputeGuard(ComputeContext);

impl ComputeGuard {
    pub fn new(context: ComputeContext) -> Self {
        Self(context)
    }
}

impl From<ComputeContext> for ComputeGuard {
    fn from(context: ComputeContext) -> Self {
        Self::new(context)
    }
}

impl Deref for ComputeGuard {
    type Target = ComputeContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for ComputeGuard {
    fn drop(&mut self) {
        finalize(&self.0);
    }
}
