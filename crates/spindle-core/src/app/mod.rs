//! App - アプリケーション層
//!
//! # 主要コンポーネント
//! - **Registry**: unit id -> ComponentRecord（宣言コンテキストとビルド権限つき）
//! - **ExportResolver**: 必要な名前を依存の export に解決
//! - **DependencyGraph**: 循環検出とビルド順序
//! - **Scheduler**: 1 パス = 発見 → ロード要求 → 順序付け → ビルド
//! - **Debouncer**: ロード完了をまとめて 1 ラウンドにする
//! - **SchedulerRuntime**: Scheduler を所有する actor とホスト用ハンドル

pub mod config;
pub mod debounce;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scheduler;

pub use self::config::{CycleDetection, SchedulerConfig};
pub use self::debounce::Debouncer;
pub use self::graph::DependencyGraph;
pub use self::registry::{Declarer, Registry, UnitContext};
pub use self::resolver::ExportResolver;
pub use self::runtime::{RuntimeBuilder, RuntimeStatus, SchedulerHandle, SchedulerRuntime};
pub use self::scheduler::{LoadRequest, LoadState, PassOutcome, PassReport, Scheduler};
