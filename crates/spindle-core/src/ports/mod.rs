//! Ports - 抽象化レイヤー
//!
//! スケジューラが外部に依存する箇所（ソースの取得、イベント記録、時刻、ID 生成）を
//! trait として切り出す。実装は `impls` に置く。

pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod unit_loader;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::unit_loader::{LoadError, UnitLoader, UnitScript};
