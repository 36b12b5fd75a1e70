//! InMemoryUnitLoader - テスト・組み込み用のローダー
//!
//! # 学習ポイント
//! - ID ごとに「宣言コードのファクトリ」を登録しておき、load のたびに新しい
//!   `UnitScript` を作る
//! - 失敗・遅延・永久に終わらないロードを差し込める（スケジューラのテスト用）
//! - load 回数を数えて、重複ロードがないことを確認できる

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::app::registry::Declarer;
use crate::domain::{SpindleError, UnitId};
use crate::ports::{LoadError, UnitLoader, UnitScript};

type ScriptFactory = Arc<dyn Fn(&mut Declarer<'_>) -> Result<(), SpindleError> + Send + Sync>;

#[derive(Clone)]
enum Source {
    Script(ScriptFactory),
    Fail(String),
    /// Never completes.
    Hang,
}

#[derive(Default)]
struct State {
    sources: HashMap<UnitId, Source>,
    delays: HashMap<UnitId, Duration>,
    loads: HashMap<UnitId, usize>,
}

#[derive(Default)]
pub struct InMemoryUnitLoader {
    state: Mutex<State>,
}

impl InMemoryUnitLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the declaration code of `id`.
    ///
    /// # Panics
    /// If `id` is not a valid unit id.
    pub fn insert<F>(&self, id: &str, script: F)
    where
        F: Fn(&mut Declarer<'_>) -> Result<(), SpindleError> + Send + Sync + 'static,
    {
        self.set(id, Source::Script(Arc::new(script)));
    }

    /// Make loading `id` fail with `reason`.
    pub fn fail(&self, id: &str, reason: &str) {
        self.set(id, Source::Fail(reason.to_string()));
    }

    /// Make loading `id` never complete.
    pub fn hang(&self, id: &str) {
        self.set(id, Source::Hang);
    }

    /// Delay the completion of `id`'s load.
    pub fn delay(&self, id: &str, delay: Duration) {
        let unit = parse_or_panic(id);
        self.state().delays.insert(unit, delay);
    }

    /// Number of times `id` was loaded.
    pub fn load_count(&self, id: &UnitId) -> usize {
        self.state().loads.get(id).copied().unwrap_or(0)
    }

    fn set(&self, id: &str, source: Source) {
        let unit = parse_or_panic(id);
        self.state().sources.insert(unit, source);
    }
}

fn parse_or_panic(id: &str) -> UnitId {
    match UnitId::parse(id) {
        Ok(unit) => unit,
        Err(e) => panic!("InMemoryUnitLoader: {e}"),
    }
}

#[async_trait]
impl UnitLoader for InMemoryUnitLoader {
    async fn load(&self, id: &UnitId) -> Result<Box<dyn UnitScript>, LoadError> {
        let (source, delay) = {
            let mut state = self.state();
            *state.loads.entry(id.clone()).or_default() += 1;
            (state.sources.get(id).cloned(), state.delays.get(id).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match source {
            Some(Source::Script(factory)) => {
                let script: Box<dyn UnitScript> =
                    Box::new(move |declarer: &mut Declarer<'_>| factory(declarer));
                Ok(script)
            }
            Some(Source::Fail(reason)) => Err(LoadError::Failed(reason)),
            Some(Source::Hang) => std::future::pending().await,
            None => Err(LoadError::NotFound(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::registry::Registry;

    fn unit(id: &str) -> UnitId {
        UnitId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let loader = InMemoryUnitLoader::new();
        let err = loader.load(&unit("missing")).await.err().unwrap();
        assert!(matches!(err, LoadError::NotFound(_)));
        assert_eq!(loader.load_count(&unit("missing")), 1);
    }

    #[tokio::test]
    async fn scripts_declare_into_the_registry() {
        let loader = InMemoryUnitLoader::new();
        loader.insert("lib", |d| {
            d.component()?.hook("reset")?;
            Ok(())
        });

        let script = loader.load(&unit("lib")).await.ok().unwrap();
        let mut registry = Registry::new();
        let cx = registry.open_context(unit("lib"));
        script.declare(&mut Declarer::new(&mut registry, cx)).unwrap();

        let record = registry.get(&unit("lib")).unwrap();
        assert_eq!(record.hooked_events(), ["reset".to_string()]);
    }

    #[tokio::test]
    async fn failures_are_reported() {
        let loader = InMemoryUnitLoader::new();
        loader.fail("broken", "network down");
        let err = loader.load(&unit("broken")).await.err().unwrap();
        assert_eq!(err.to_string(), "network down");
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_loads_never_complete() {
        let loader = InMemoryUnitLoader::new();
        loader.hang("stuck");
        let waited =
            tokio::time::timeout(Duration::from_secs(60), loader.load(&unit("stuck"))).await;
        assert!(waited.is_err());
    }
}
