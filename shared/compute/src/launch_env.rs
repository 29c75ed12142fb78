use std::fmt;

use itertools::Itertools;
use thiserror::Error;

pub const RANK_VAR: &str = "RANK";
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";
pub const MASTER_ADDR_VAR: &str = "MASTER_ADDR";
pub const MASTER_PORT_VAR: &str = "MASTER_PORT";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

const IDENTITY_VARS: [&str; 3] = [RANK_VAR, LOCAL_RANK_VAR, WORLD_SIZE_VAR];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchEnvError {
    #[error(
        "incomplete launcher environment: {} set but {} missing",
        present.iter().join(", "),
        missing.iter().join(", ")
    )]
    Incomplete {
        present: Vec<&'static str>,
        missing: Vec<&'static str>,
    },

    #[error("launcher variable {var}={value:?} is not a valid {expected}")]
    Malformed {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("launcher reported WORLD_SIZE=0, a distributed run needs at least one process")]
    EmptyWorld,

    #[error("{var}={value} is out of range for WORLD_SIZE={world_size}")]
    RankOutOfRange {
        var: &'static str,
        value: usize,
        world_size: usize,
    },
}

/// Identity of this process as handed out by a multi-process launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSignals {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl LaunchSignals {
    pub fn rendezvous_addr(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

/// The launch-time environment, captured once at startup.
///
/// Whether a run is distributed is decided here and nowhere else, from the
/// launcher's identity variables alone. Accelerator detection never feeds into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchEnv {
    Single,
    Distributed(LaunchSignals),
}

impl LaunchEnv {
    pub fn from_process_env() -> Result<Self, LaunchEnvError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, LaunchEnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let values = IDENTITY_VARS.map(|var| (var, lookup(var)));
        let (present, missing): (Vec<_>, Vec<_>) =
            values.iter().partition(|(_, value)| value.is_some());

        if present.is_empty() {
            return Ok(LaunchEnv::Single);
        }
        if !missing.is_empty() {
            return Err(LaunchEnvError::Incomplete {
                present: present.iter().map(|(var, _)| *var).collect(),
                missing: missing.iter().map(|(var, _)| *var).collect(),
            });
        }

        let [rank, local_rank, world_size] =
            values.map(|(var, value)| parse_index(var, value.as_deref().unwrap_or_default()));
        let (rank, local_rank, world_size) = (rank?, local_rank?, world_size?);

        if world_size == 0 {
            return Err(LaunchEnvError::EmptyWorld);
        }
        for (var, value) in [(RANK_VAR, rank), (LOCAL_RANK_VAR, local_rank)] {
            if value >= world_size {
                return Err(LaunchEnvError::RankOutOfRange {
                    var,
                    value,
                    world_size,
                });
            }
        }

        let master_addr = lookup(MASTER_ADDR_VAR)
            .map(|addr| addr.trim().to_owned())
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_owned());
        let master_port = match lookup(MASTER_PORT_VAR) {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| LaunchEnvError::Malformed {
                    var: MASTER_PORT_VAR,
                    value: port.clone(),
                    expected: "TCP port",
                })?,
            None => DEFAULT_MASTER_PORT,
        };

        Ok(LaunchEnv::Distributed(LaunchSignals {
            rank,
            local_rank,
            world_size,
            master_addr,
            master_port,
        }))
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, LaunchEnv::Distributed(_))
    }

    pub fn signals(&self) -> Option<&LaunchSignals> {
        match self {
            LaunchEnv::Single => None,
            LaunchEnv::Distributed(signals) => Some(signals),
        }
    }
}

impl fmt::Display for LaunchEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchEnv::Single => write!(f, "single process (no launcher variables set)"),
            LaunchEnv::Distributed(s) => write!(
                f,
                "{RANK_VAR}={} {LOCAL_RANK_VAR}={} {WORLD_SIZE_VAR}={} rendezvous={}",
                s.rank,
                s.local_rank,
                s.world_size,
                s.rendezvous_addr()
            ),
        }
    }
}

fn parse_index(var: &'static str, value: &str) -> Result<usize, LaunchEnvError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| LaunchEnvError::Malformed {
            var,
            value: value.to_owned(),
            expected: "non-negative integer",
        })
}
