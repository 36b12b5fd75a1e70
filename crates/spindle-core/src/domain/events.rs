//! Events - スケジューラのドメインイベント
//!
//! ログ（tracing）とは独立に、ライフサイクルの遷移を `EventSink` へ流す。

use serde::{Deserialize, Serialize};

use super::ids::UnitId;

/// Something that happened inside the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A record was created in the registry.
    UnitDeclared { unit: UnitId },
    /// A record received its logic (INIT -> PREPARE).
    UnitQueued { unit: UnitId },
    LoadRequested { unit: UnitId },
    UnitLoaded { unit: UnitId },
    LoadFailed { unit: UnitId, reason: String },
    PassStarted { pass: u64, candidates: usize },
    BuildStarted { unit: UnitId, pass: u64 },
    UnitBuilt { unit: UnitId, pass: u64 },
    BuildFailed { unit: UnitId, pass: u64, reason: String },
    PassFinished { pass: u64, built: usize, remaining: usize },
    /// A pass ended with a fatal error (circular dependency or exhaustion).
    SchedulerFailed { reason: String },
}

impl SchedulerEvent {
    pub fn unit(&self) -> Option<&UnitId> {
        match self {
            SchedulerEvent::UnitDeclared { unit }
            | SchedulerEvent::UnitQueued { unit }
            | SchedulerEvent::LoadRequested { unit }
            | SchedulerEvent::UnitLoaded { unit }
            | SchedulerEvent::LoadFailed { unit, .. }
            | SchedulerEvent::BuildStarted { unit, .. }
            | SchedulerEvent::UnitBuilt { unit, .. }
            | SchedulerEvent::BuildFailed { unit, .. } => Some(unit),
            SchedulerEvent::PassStarted { .. }
            | SchedulerEvent::PassFinished { .. }
            | SchedulerEvent::SchedulerFailed { .. } => None,
        }
    }
}
