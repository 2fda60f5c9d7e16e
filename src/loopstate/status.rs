//! Subsystem loop status

use crate::Error;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Status of one subsystem loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Completed,
}

impl LoopStatus {
    /// Whether a caller-requested start is accepted from this status
    pub fn can_start(&self) -> bool {
        matches!(self, LoopStatus::Stopped | LoopStatus::Completed)
    }

    /// Whether a caller-requested stop is accepted from this status
    pub fn can_stop(&self) -> bool {
        matches!(self, LoopStatus::Running)
    }
}

impl Default for LoopStatus {
    fn default() -> Self {
        LoopStatus::Stopped
    }
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::Stopped => write!(f, "Stopped"),
            LoopStatus::Starting => write!(f, "Starting"),
            LoopStatus::Running => write!(f, "Running"),
            LoopStatus::Stopping => write!(f, "Stopping"),
            LoopStatus::Crashed => write!(f, "Crashed"),
            LoopStatus::Completed => write!(f, "Completed"),
        }
    }
}

impl FromStr for LoopStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stopped" => Ok(LoopStatus::Stopped),
            "starting" => Ok(LoopStatus::Starting),
            "running" => Ok(LoopStatus::Running),
            "stopping" => Ok(LoopStatus::Stopping),
            "crashed" => Ok(LoopStatus::Crashed),
            "completed" => Ok(LoopStatus::Completed),
            _ => Err(Error::invalid_status(s)),
        }
    }
}
