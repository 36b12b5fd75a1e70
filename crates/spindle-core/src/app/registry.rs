//! Registry - unit id -> ComponentRecord
//!
//! # 設計
//! - 宣言は明示的なコンテキスト（`UnitContext`）経由でのみ行う。
//!   コンテキストはスクリプト実行中だけ有効で、保存して後から使うと Context エラーになる。
//! - `build` は「いまビルド中のユニット」スロットを持つスケジューラだけが行える。
//! - レコードはセッション中に削除されない。

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{ComponentRecord, Logic, Phase, SpindleError, UnitId};

/// Token identifying the unit whose declaration code is currently running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitContext {
    unit: UnitId,
    epoch: u64,
}

impl UnitContext {
    pub fn unit(&self) -> &UnitId {
        &self.unit
    }
}

/// Process-wide mapping from unit id to record, owned by one scheduler.
#[derive(Debug, Default)]
pub struct Registry {
    records: BTreeMap<UnitId, ComponentRecord>,

    /// Context of the declaration script being executed, if any.
    active: Option<UnitContext>,
    next_epoch: u64,

    /// Single-slot build token.
    building: Option<UnitId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn open_context(&mut self, unit: UnitId) -> UnitContext {
        self.next_epoch += 1;
        let context = UnitContext {
            unit,
            epoch: self.next_epoch,
        };
        self.active = Some(context.clone());
        context
    }

    pub(crate) fn close_context(&mut self, context: &UnitContext) {
        if self.active.as_ref() == Some(context) {
            self.active = None;
        }
    }

    /// Get or create the record for the unit identified by `context`.
    ///
    /// A second call for the same id returns the existing record unchanged.
    pub fn declare(&mut self, context: &UnitContext) -> Result<&mut ComponentRecord, SpindleError> {
        if self.active.as_ref() != Some(context) {
            return Err(SpindleError::Context(Some(context.unit.clone())));
        }
        let unit = context.unit.clone();
        Ok(self.records.entry(unit).or_insert_with_key(|id| {
            debug!(unit = %id, "component declared");
            ComponentRecord::new(id.clone())
        }))
    }

    pub fn get(&self, id: &UnitId) -> Option<&ComponentRecord> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &UnitId) -> Option<&mut ComponentRecord> {
        self.records.get_mut(id)
    }

    pub fn contains(&self, id: &UnitId) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ComponentRecord> {
        self.records.values()
    }

    /// Ids of records in `phase`, in id order.
    pub fn in_phase(&self, phase: Phase) -> Vec<UnitId> {
        self.records
            .values()
            .filter(|r| r.phase() == phase)
            .map(|r| r.id().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn grant_build(&mut self, id: &UnitId) {
        self.building = Some(id.clone());
    }

    pub(crate) fn revoke_build(&mut self) {
        self.building = None;
    }

    /// PREPARE -> BUILDING for `id`.
    ///
    /// Only the unit currently holding the build slot may be built; any other
    /// request fails with a permission error.
    pub fn begin_build(&mut self, id: &UnitId) -> Result<Arc<dyn Logic>, SpindleError> {
        if self.building.as_ref() != Some(id) {
            return Err(SpindleError::Permission(id.clone()));
        }
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| SpindleError::UnknownUnit(id.clone()))?;
        record.start_build()
    }
}

/// Declaration handle given to a unit's script while it runs.
pub struct Declarer<'a> {
    registry: &'a mut Registry,
    context: UnitContext,
}

impl<'a> Declarer<'a> {
    pub(crate) fn new(registry: &'a mut Registry, context: UnitContext) -> Self {
        Self { registry, context }
    }

    pub fn unit(&self) -> &UnitId {
        &self.context.unit
    }

    /// The explicit context token. Only valid until the script returns.
    pub fn context(&self) -> UnitContext {
        self.context.clone()
    }

    /// The record of the unit being declared.
    pub fn component(&mut self) -> Result<&mut ComponentRecord, SpindleError> {
        self.registry.declare(&self.context)
    }
}
