use std::{fmt, io, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::DeviceKind;

/// Which collective backend a group is formed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// collective-gpu
    Nccl,
    /// collective-generic, works for any device kind
    Gloo,
}

impl Backend {
    pub fn for_device(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Accelerator => Backend::Nccl,
            DeviceKind::Cpu => Backend::Gloo,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Nccl => write!(f, "nccl"),
            Backend::Gloo => write!(f, "gloo"),
        }
    }
}

/// What a process claims about itself when it joins a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub rank: usize,
    pub world_size: usize,
    pub backend: Backend,
}

#[derive(Error, Debug)]
pub enum CollectiveError {
    #[error("could not reach rendezvous store at {addr} within {timeout:?}: {source}")]
    Unreachable {
        addr: String,
        timeout: Duration,
        #[source]
        source: io::Error,
    },

    #[error("could not host rendezvous store at {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("group rejected: {0}")]
    Rejected(String),

    #[error("lost connection to the group: {0}")]
    Disconnected(String),

    #[error("unexpected message from the group: {0}")]
    Protocol(String),

    #[error("no group is active")]
    NotActive,

    #[error("a group is already active on this process")]
    AlreadyActive,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("wire format error: {0}")]
    Codec(#[from] postcard::Error),
}

/// The group layer a [`ComputeContext`](crate::ComputeContext) is built on.
///
/// Every member must issue the same sequence of collective calls. All calls
/// block the calling thread.
pub trait Collective: Send + Sync + fmt::Debug {
    fn form_group(&self, spec: GroupSpec) -> Result<(), CollectiveError>;

    fn barrier(&self) -> Result<(), CollectiveError>;

    /// Every member contributes `payload`, every member gets all payloads back indexed by rank.
    fn all_gather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError>;

    /// Live state of the group as this process sees it right now.
    fn is_active(&self) -> bool;

    fn destroy(&self) -> Result<(), CollectiveError>;
}

/// Checks that a complete join set describes one consistent group.
pub(crate) fn validate_members(members: &[GroupSpec], world_size: usize) -> Result<(), String> {
    if members.len() != world_size {
        return Err(format!(
            "expected {world_size} members, {} joined",
            members.len()
        ));
    }
    if let Some(spec) = members.iter().find(|spec| spec.world_size != world_size) {
        return Err(format!(
            "rank {} claims world size {}, the group has {world_size}",
            spec.rank, spec.world_size
        ));
    }
    let backends: Vec<Backend> = members.iter().map(|spec| spec.backend).unique().collect();
    if backends.len() > 1 {
        return Err(format!(
            "members disagree on the backend: {}",
            members
                .iter()
                .sorted_by_key(|spec| spec.rank)
                .map(|spec| format!("rank {}={}", spec.rank, spec.backend))
                .join(", ")
        ));
    }
    let ranks: Vec<usize> = members.iter().map(|spec| spec.rank).sorted().collect();
    if let Some((a, _)) = ranks.iter().tuple_windows().find(|(a, b)| a == b) {
        return Err(format!("rank {a} joined more than once"));
    }
    if let Some(rank) = ranks.iter().find(|rank| **rank >= world_size) {
        return Err(format!("rank {rank} is outside world size {world_size}"));
    }
    Ok(())
}
