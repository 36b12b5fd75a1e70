//! Exports and injections: the values that flow between built units.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::UnitId;

/// Named values a built unit makes available to its dependents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Exports(BTreeMap<String, serde_json::Value>);

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Last write wins.
    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.0.insert(name.into(), value);
    }
}

impl FromIterator<(String, serde_json::Value)> for Exports {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a required parameter name resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Injection {
    /// The reserved self-reference: the consuming unit itself.
    Component(UnitId),

    /// An export of exactly one dependency.
    Export {
        provider: UnitId,
        value: serde_json::Value,
    },
}

impl Injection {
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Injection::Component(_) => None,
            Injection::Export { value, .. } => Some(value),
        }
    }

    pub fn provider(&self) -> &UnitId {
        match self {
            Injection::Component(unit) => unit,
            Injection::Export { provider, .. } => provider,
        }
    }
}
