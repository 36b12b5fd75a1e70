//! UnitLoader port - ユニットのソースを取得・実行する外部能力
//!
//! # 設計原則
//! - `load` は非同期で、ID ごとに一度だけ呼ばれる（重複排除はスケジューラ側）
//! - 取得したソースは `UnitScript` として返し、宣言コードの実行は
//!   スケジューラ自身のコンテキストで行う（registry への再入を防ぐ）

use async_trait::async_trait;
use thiserror::Error;

use crate::app::registry::Declarer;
use crate::domain::{SpindleError, UnitId};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no source for unit {0}")]
    NotFound(UnitId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// The top-level declaration code of a unit.
///
/// Executed exactly once, with a `Declarer` bound to the unit being loaded.
pub trait UnitScript: Send {
    fn declare(self: Box<Self>, declarer: &mut Declarer<'_>) -> Result<(), SpindleError>;
}

impl<F> UnitScript for F
where
    F: FnOnce(&mut Declarer<'_>) -> Result<(), SpindleError> + Send,
{
    fn declare(self: Box<Self>, declarer: &mut Declarer<'_>) -> Result<(), SpindleError> {
        (*self)(declarer)
    }
}

/// Fetches the source associated with a unit id.
#[async_trait]
pub trait UnitLoader: Send + Sync {
    async fn load(&self, id: &UnitId) -> Result<Box<dyn UnitScript>, LoadError>;
}
