//! Logic - ユニットの本体（build 時に一度だけ実行される）
//!
//! # 二層構造
//! - **Logic trait**: async, object-safe。`Arc<dyn Logic>` として record に保持する
//! - **FnLogic**: 同期クロージャを `Logic` に包むアダプタ（`logic_fn`）
//!
//! Logic は `BuildContext` を通して import を読み、export を書き、
//! hook したイベントの handler を登録する。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::exports::{Exports, Injection};
use super::ids::UnitId;

/// Failure reported by a logic body or an event handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct LogicError(String);

impl LogicError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<serde_json::Error> for LogicError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("json: {e}"))
    }
}

/// The body of a unit.
#[async_trait]
pub trait Logic: Send + Sync {
    async fn run(&self, cx: &mut BuildContext) -> Result<(), LogicError>;
}

/// Adapter turning a synchronous closure into `Logic`.
pub struct FnLogic<F> {
    f: F,
}

#[async_trait]
impl<F> Logic for FnLogic<F>
where
    F: Fn(&mut BuildContext) -> Result<(), LogicError> + Send + Sync,
{
    async fn run(&self, cx: &mut BuildContext) -> Result<(), LogicError> {
        (self.f)(cx)
    }
}

pub fn logic_fn<F>(f: F) -> Arc<dyn Logic>
where
    F: Fn(&mut BuildContext) -> Result<(), LogicError> + Send + Sync + 'static,
{
    Arc::new(FnLogic { f })
}

/// Handler for an event hooked by a unit. Invokable after the unit is BUILT.
pub trait EventHandler: Send + Sync {
    fn handle(&self, payload: &serde_json::Value) -> Result<(), LogicError>;
}

impl<F> EventHandler for F
where
    F: Fn(&serde_json::Value) -> Result<(), LogicError> + Send + Sync,
{
    fn handle(&self, payload: &serde_json::Value) -> Result<(), LogicError> {
        self(payload)
    }
}

/// Everything a logic body can see and touch while its unit is BUILDING.
///
/// Exports and handlers only become visible to others if the logic succeeds.
pub struct BuildContext {
    unit: UnitId,
    hooked: Vec<String>,
    injections: BTreeMap<String, Injection>,
    exports: Exports,
    handlers: BTreeMap<String, Arc<dyn EventHandler>>,
}

impl BuildContext {
    pub(crate) fn new(
        unit: UnitId,
        hooked: Vec<String>,
        injections: BTreeMap<String, Injection>,
    ) -> Self {
        Self {
            unit,
            hooked,
            injections,
            exports: Exports::new(),
            handlers: BTreeMap::new(),
        }
    }

    /// The unit being built.
    pub fn unit(&self) -> &UnitId {
        &self.unit
    }

    pub fn injection(&self, name: &str) -> Option<&Injection> {
        self.injections.get(name)
    }

    /// Raw value of an injected export.
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.injections.get(name).and_then(Injection::value)
    }

    /// Decode an injected export into `T`.
    pub fn import<T: DeserializeOwned>(&self, name: &str) -> Result<T, LogicError> {
        match self.injections.get(name) {
            Some(Injection::Export { value, .. }) => Ok(serde_json::from_value(value.clone())?),
            Some(Injection::Component(_)) => Err(LogicError::msg(format!(
                "'{name}' refers to the component itself, not an export"
            ))),
            None => Err(LogicError::msg(format!("'{name}' was not declared as required"))),
        }
    }

    pub fn export<T: Serialize>(&mut self, name: impl Into<String>, value: T) -> Result<(), LogicError> {
        let value = serde_json::to_value(value)?;
        self.exports.insert(name, value);
        Ok(())
    }

    /// Register the handler for a hooked event.
    pub fn on<H>(&mut self, event: &str, handler: H) -> Result<(), LogicError>
    where
        H: EventHandler + 'static,
    {
        if !self.hooked.iter().any(|e| e == event) {
            return Err(LogicError::msg(format!(
                "event '{event}' was not hooked by {}",
                self.unit
            )));
        }
        self.handlers.insert(event.to_string(), Arc::new(handler));
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Exports, BTreeMap<String, Arc<dyn EventHandler>>) {
        (self.exports, self.handlers)
    }
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("unit", &self.unit)
            .field("injections", &self.injections)
            .field("exports", &self.exports)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
