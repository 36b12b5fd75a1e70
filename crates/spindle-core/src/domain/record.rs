//! Component record: declarations + phase + build results.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::errors::SpindleError;
use super::exports::Exports;
use super::ids::UnitId;
use super::logic::{EventHandler, Logic, LogicError};
use super::phase::Phase;

/// Per-unit state.
///
/// Design:
/// - This is the "single source of truth" for a unit. The registry holds records by id.
/// - Declaration methods (`import`, `hook`, `emit`, `require`, `run`) are only valid in INIT.
/// - Every phase change goes through `transition`, which checks `Phase::can_transition_to`.
/// - Once BUILT, only `dispatch` (event handlers) remains usable.
pub struct ComponentRecord {
    id: UnitId,
    phase: Phase,

    /// Declared dependencies, in declaration order (append-only, deduplicated).
    dependencies: Vec<UnitId>,

    /// dependency id -> export names preferred from that dependency.
    overrides: BTreeMap<UnitId, Vec<String>>,

    hooked_events: Vec<String>,
    emitted_events: Vec<String>,

    /// Parameter names the logic consumes (the manifest).
    requires: Vec<String>,

    logic: Option<Arc<dyn Logic>>,

    exports: Exports,
    handlers: BTreeMap<String, Arc<dyn EventHandler>>,

    /// Number of build attempts so far.
    attempts: u32,
    last_error: Option<String>,
}

impl ComponentRecord {
    pub(crate) fn new(id: UnitId) -> Self {
        Self {
            id,
            phase: Phase::Init,
            dependencies: Vec::new(),
            overrides: BTreeMap::new(),
            hooked_events: Vec::new(),
            emitted_events: Vec::new(),
            requires: Vec::new(),
            logic: None,
            exports: Exports::new(),
            handlers: BTreeMap::new(),
            attempts: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Defensive copy of the declared dependencies.
    pub fn dependencies(&self) -> Vec<UnitId> {
        self.dependencies.clone()
    }

    pub(crate) fn dependency_slice(&self) -> &[UnitId] {
        &self.dependencies
    }

    pub fn overrides(&self) -> &BTreeMap<UnitId, Vec<String>> {
        &self.overrides
    }

    pub fn hooked_events(&self) -> &[String] {
        &self.hooked_events
    }

    pub fn emitted_events(&self) -> &[String] {
        &self.emitted_events
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// Empty until the unit is BUILT.
    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn ensure_init(&self, operation: &'static str) -> Result<(), SpindleError> {
        if self.phase.accepts_declarations() {
            Ok(())
        } else {
            Err(SpindleError::State {
                unit: self.id.clone(),
                operation,
                phase: self.phase,
            })
        }
    }

    fn transition(&mut self, next: Phase) -> Result<(), SpindleError> {
        if !self.phase.can_transition_to(next) {
            return Err(SpindleError::Transition {
                unit: self.id.clone(),
                from: self.phase,
                to: next,
            });
        }
        debug!(unit = %self.id, from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        Ok(())
    }

    /// Declare a dependency, optionally narrowing which of its exports to prefer.
    ///
    /// Importing the same id again is a no-op except that new override names are merged in.
    pub fn import(&mut self, id: &str, overrides: &[&str]) -> Result<&mut Self, SpindleError> {
        self.ensure_init("import")?;
        let dependency = UnitId::parse(id)?;
        if dependency == self.id {
            return Err(SpindleError::SelfDependency(self.id.clone()));
        }

        if !self.dependencies.contains(&dependency) {
            info!(unit = %self.id, dependency = %dependency, "importing");
            self.dependencies.push(dependency.clone());
        }

        if !overrides.is_empty() {
            let names = self.overrides.entry(dependency).or_default();
            for name in overrides {
                if !names.iter().any(|n| n == name) {
                    names.push((*name).to_string());
                }
            }
        }
        Ok(self)
    }

    /// Declare that this unit handles `event`.
    pub fn hook(&mut self, event: &str) -> Result<&mut Self, SpindleError> {
        self.ensure_init("hook")?;
        if !self.hooked_events.iter().any(|e| e == event) {
            debug!(unit = %self.id, event, "hooking event");
            self.hooked_events.push(event.to_string());
        }
        Ok(self)
    }

    /// Declare that this unit produces `event`.
    pub fn emit(&mut self, event: &str) -> Result<&mut Self, SpindleError> {
        self.ensure_init("emit")?;
        if !self.emitted_events.iter().any(|e| e == event) {
            debug!(unit = %self.id, event, "event emitter");
            self.emitted_events.push(event.to_string());
        }
        Ok(self)
    }

    /// Declare a parameter name the logic consumes.
    pub fn require(&mut self, name: &str) -> Result<&mut Self, SpindleError> {
        self.ensure_init("require")?;
        if !self.requires.iter().any(|n| n == name) {
            self.requires.push(name.to_string());
        }
        Ok(self)
    }

    /// Hand off the logic body. INIT -> PREPARE, exactly once.
    pub fn run(&mut self, logic: Arc<dyn Logic>) -> Result<&mut Self, SpindleError> {
        self.ensure_init("run")?;
        self.transition(Phase::Prepare)?;
        self.logic = Some(logic);
        Ok(self)
    }

    /// PREPARE -> BUILDING. The caller must already hold the build slot for this unit.
    pub(crate) fn start_build(&mut self) -> Result<Arc<dyn Logic>, SpindleError> {
        if self.phase != Phase::Prepare {
            return Err(SpindleError::State {
                unit: self.id.clone(),
                operation: "build",
                phase: self.phase,
            });
        }
        let logic = self
            .logic
            .clone()
            .ok_or_else(|| SpindleError::NoLogic(self.id.clone()))?;
        self.transition(Phase::Building)?;
        self.attempts += 1;
        Ok(logic)
    }

    /// BUILDING -> BUILT. Hooked events without a handler are dropped with a warning.
    pub(crate) fn mark_built(
        &mut self,
        exports: Exports,
        handlers: BTreeMap<String, Arc<dyn EventHandler>>,
    ) -> Result<(), SpindleError> {
        self.transition(Phase::Built)?;
        let (handled, unhandled): (Vec<String>, Vec<String>) = self
            .hooked_events
            .drain(..)
            .partition(|event| handlers.contains_key(event));
        for event in &unhandled {
            warn!(unit = %self.id, event = %event, "hooked event has no handler, unhooking");
        }
        self.hooked_events = handled;
        self.exports = exports;
        self.handlers = handlers;
        self.last_error = None;
        Ok(())
    }

    /// BUILDING -> PREPARE. The unit stays eligible for a later pass.
    pub(crate) fn revert_build(&mut self, error: &SpindleError) -> Result<(), SpindleError> {
        self.transition(Phase::Prepare)?;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Invoke the handler registered for `event`. Only valid once BUILT.
    pub fn dispatch(&self, event: &str, payload: &serde_json::Value) -> Result<(), SpindleError> {
        if self.phase != Phase::Built {
            return Err(SpindleError::State {
                unit: self.id.clone(),
                operation: "dispatch",
                phase: self.phase,
            });
        }
        let handler = self
            .handlers
            .get(event)
            .ok_or_else(|| SpindleError::NoHandler {
                unit: self.id.clone(),
                event: event.to_string(),
            })?;
        handler.handle(payload).map_err(|e: LogicError| SpindleError::Logic {
            unit: self.id.clone(),
            message: e.to_string(),
        })
    }

    pub fn status(&self) -> UnitStatus {
        UnitStatus {
            id: self.id.clone(),
            phase: self.phase,
            dependencies: self.dependencies.clone(),
            exports: self.exports.names().map(str::to_string).collect(),
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for ComponentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRecord")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("dependencies", &self.dependencies)
            .field("overrides", &self.overrides)
            .field("hooked_events", &self.hooked_events)
            .field("emitted_events", &self.emitted_events)
            .field("requires", &self.requires)
            .field("has_logic", &self.logic.is_some())
            .field("exports", &self.exports)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Serializable view of a record for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub id: UnitId,
    pub phase: Phase,
    pub dependencies: Vec<UnitId>,
    pub exports: Vec<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}
