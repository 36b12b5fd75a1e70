//! Errors - エラー型と分類
//!
//! すべての操作は `SpindleError` を返す。`ErrorKind` は運用上の分類で、
//! スケジューラを止めるべきかどうかの判断に使う。

use thiserror::Error;

use super::ids::UnitId;
use super::phase::Phase;

/// Operational classification of a `SpindleError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Declaration method called outside the phase that permits it.
    State,
    /// Declaration requested without a live unit context.
    Context,
    /// `build` requested by someone other than the current build pass.
    Permission,
    /// Zero or multiple matches for a required export name, or a dependency not BUILT yet.
    Resolution,
    /// Dependency cycle between units.
    Circular,
    /// A pass made no progress while candidates remain.
    Exhaustion,
    /// The unit loader failed for an id.
    Loader,
    /// Malformed input (bad id, self-dependency, logic failure, unknown unit, config).
    Input,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpindleError {
    #[error("cannot {operation} on {unit}: component is in the {phase} phase")]
    State {
        unit: UnitId,
        operation: &'static str,
        phase: Phase,
    },

    #[error("invalid phase transition for {unit}: {from} -> {to}")]
    Transition { unit: UnitId, from: Phase, to: Phase },

    #[error("no active declaration context{}", .0.as_ref().map(|u| format!(" for {u}")).unwrap_or_default())]
    Context(Option<UnitId>),

    #[error("manually building {0} is not allowed")]
    Permission(UnitId),

    #[error("unresolved dependency: no export named '{name}' for {unit}")]
    Unresolved { unit: UnitId, name: String },

    #[error("export '{name}' required by {unit} is provided by several dependencies: {providers:?}")]
    Collision {
        unit: UnitId,
        name: String,
        providers: Vec<UnitId>,
    },

    #[error("{unit} cannot be built before its dependency {dependency}")]
    DependencyNotBuilt { unit: UnitId, dependency: UnitId },

    #[error("circular dependency detected: {}", format_cycle(.0))]
    CircularDependency(Vec<UnitId>),

    #[error("unresolved dependencies: no progress possible for {0:?}")]
    Exhausted(Vec<UnitId>),

    #[error("failed to load {unit}: {reason}")]
    Loader { unit: UnitId, reason: String },

    #[error("unit id of incorrect format: '{0}'")]
    InvalidId(String),

    #[error("{0} cannot depend on itself")]
    SelfDependency(UnitId),

    #[error("logic of {unit} failed: {message}")]
    Logic { unit: UnitId, message: String },

    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scheduler runtime is not running")]
    RuntimeClosed,

    #[error("{0} reached PREPARE without logic")]
    NoLogic(UnitId),

    #[error("{unit} has no handler for event '{event}'")]
    NoHandler { unit: UnitId, event: String },
}

impl SpindleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpindleError::State { .. }
            | SpindleError::Transition { .. }
            | SpindleError::NoLogic(_) => ErrorKind::State,
            SpindleError::Context(_) => ErrorKind::Context,
            SpindleError::Permission(_) => ErrorKind::Permission,
            SpindleError::Unresolved { .. }
            | SpindleError::Collision { .. }
            | SpindleError::DependencyNotBuilt { .. } => ErrorKind::Resolution,
            SpindleError::CircularDependency(_) => ErrorKind::Circular,
            SpindleError::Exhausted(_) => ErrorKind::Exhaustion,
            SpindleError::Loader { .. } => ErrorKind::Loader,
            SpindleError::InvalidId(_)
            | SpindleError::SelfDependency(_)
            | SpindleError::Logic { .. }
            | SpindleError::UnknownUnit(_)
            | SpindleError::Config(_)
            | SpindleError::RuntimeClosed
            | SpindleError::NoHandler { .. } => ErrorKind::Input,
        }
    }

    /// Circular dependencies cannot resolve themselves, so building stops for good.
    pub fn is_fatal_to_scheduler(&self) -> bool {
        self.kind() == ErrorKind::Circular
    }
}

fn format_cycle(cycle: &[UnitId]) -> String {
    cycle
        .iter()
        .map(UnitId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
