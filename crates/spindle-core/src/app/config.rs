//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How cycles between candidates are detected before ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleDetection {
    /// Only `a <-> b` pairs among the pass candidates. Longer cycles surface
    /// when ordering fails.
    Direct,
    /// Full traversal of every declared dependency in the registry.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Window in which trigger signals collapse into one pass.
    pub batch_window_ms: u64,

    pub cycle_detection: CycleDetection,

    /// Upper bound on consecutive passes without new information.
    pub max_passes_per_round: u32,

    /// Parameter name that resolves to the consuming unit itself.
    pub self_reference: String,
}

impl SchedulerConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 2,
            cycle_detection: CycleDetection::Full,
            max_passes_per_round: 64,
            self_reference: "component".to_string(),
        }
    }
}
