//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryUnitLoader**: テスト・組み込み用（宣言コードをクロージャで登録）
//! - **FsUnitLoader**: `<root>/<id>.json` のマニフェストを読む
//! - **RecordingEventSink**: イベントをメモリに記録
//!
//! `NoopEventSink` は既定値なので `ports` 側に置いている。

pub mod fs_loader;
pub mod inmem_loader;
pub mod recording_sink;

pub use self::fs_loader::{FsUnitLoader, ImportSpec, UnitManifest};
pub use self::inmem_loader::InMemoryUnitLoader;
pub use self::recording_sink::RecordingEventSink;
