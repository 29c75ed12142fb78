use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{PlanRequest, TopologyError};

/// Known-good scale points. Each total is one microbatch across 8 ranks, so
/// an 8-rank run takes a single micro-step per optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    D20,
    #[serde(rename = "3b")]
    ThreeB,
    #[serde(rename = "7b")]
    SevenB,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::D20, Preset::ThreeB, Preset::SevenB];
    pub const NAMES: [&'static str; 3] = ["d20", "3b", "7b"];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::D20 => Self::NAMES[0],
            Preset::ThreeB => Self::NAMES[1],
            Preset::SevenB => Self::NAMES[2],
        }
    }

    pub fn request(&self) -> PlanRequest {
        let (depth, device_batch_size, total_batch_size) = match self {
            Preset::D20 => (20, 32, 524288),
            Preset::ThreeB => (38, 48, 786432),
            Preset::SevenB => (52, 16, 262144),
        };
        PlanRequest {
            depth,
            device_batch_size,
            total_batch_size,
            ..PlanRequest::base()
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Preset {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Preset::ALL
            .into_iter()
            .find(|preset| preset.name() == wanted)
            .ok_or_else(|| TopologyError::UnknownPreset(s.to_owned()))
    }
}
