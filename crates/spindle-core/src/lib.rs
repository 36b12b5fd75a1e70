//! spindle-core
//!
//! Component dependency scheduler: units declare dependencies, events and a
//! logic body; the scheduler loads what is missing, orders what can be built
//! and builds it pass by pass until nothing changes.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, phase, record, exports, logic, attempt, events, errors）
//! - **ports**: 抽象化レイヤー（UnitLoader, EventSink, Clock, IdGenerator）
//! - **app**: registry, resolver, graph, scheduler, debounce, runtime, config
//! - **impls**: ports の実装（InMemoryUnitLoader, FsUnitLoader, RecordingEventSink）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{SchedulerConfig, SchedulerHandle, SchedulerRuntime};
pub use domain::{Phase, SpindleError, UnitId};
