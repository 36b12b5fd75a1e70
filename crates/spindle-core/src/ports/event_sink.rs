//! EventSink port - スケジューライベントの記録
//!
//! # 実装
//! - NoopEventSink: 何もしない（デフォルト）
//! - RecordingEventSink: メモリに溜める（テスト・ステータス表示用, `impls`）

use crate::domain::SchedulerEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SchedulerEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &SchedulerEvent) {}
}
