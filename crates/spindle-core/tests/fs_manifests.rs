use std::path::Path;
use std::sync::Arc;

use rstest::rstest;
use serde_json::json;
use spindle_core::app::{CycleDetection, SchedulerConfig, SchedulerRuntime};
use spindle_core::domain::{Phase, SpindleError, UnitId};
use spindle_core::impls::FsUnitLoader;
use tempfile::TempDir;

fn write_manifest(root: &Path, id: &str, manifest: serde_json::Value) {
    let path = root.join(format!("{id}.json"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, serde_json::to_string_pretty(&manifest).unwrap()).unwrap();
}

#[tokio::test]
async fn manifests_load_and_build_end_to_end() {
    let dir = TempDir::new().unwrap();
    write_manifest(
        dir.path(),
        "app/main",
        json!({
            "imports": [
                "lib/legacy",
                { "id": "lib/parser", "overrides": ["Parser"] }
            ],
            "hooks": ["reset"],
            "requires": ["component", "Lexer"],
            "exports": { "name": "main" },
            "reexports": ["Parser"]
        }),
    );
    write_manifest(
        dir.path(),
        "lib/parser",
        json!({ "imports": ["lib/lexer"], "exports": { "Parser": "new" } }),
    );
    write_manifest(
        dir.path(),
        "lib/legacy",
        json!({ "exports": { "Parser": "old", "Lexer": "legacy" } }),
    );
    write_manifest(dir.path(), "lib/lexer", json!({ "exports": { "Tokens": 3 } }));

    let runtime = SchedulerRuntime::builder(Arc::new(FsUnitLoader::new(dir.path())))
        .spawn()
        .unwrap();
    let handle = runtime.handle();
    handle
        .bootstrap(&UnitId::parse_list("App/Main").unwrap())
        .await
        .unwrap();
    handle.wait_idle().await.unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 4);
    assert!(snapshot.iter().all(|s| s.phase == Phase::Built));

    let main = snapshot
        .iter()
        .find(|s| s.id.as_str() == "app/main")
        .unwrap();
    assert_eq!(main.exports, vec!["Parser".to_string(), "name".to_string()]);
    assert_eq!(main.attempts, 1);

    handle.dispatch("app/main", "reset", json!({})).await.unwrap();
    runtime.shutdown_and_join().await;
}

#[rstest]
#[case::direct(CycleDetection::Direct)]
#[case::full(CycleDetection::Full)]
#[tokio::test]
async fn manifest_cycle_halts_the_runtime(#[case] cycle_detection: CycleDetection) {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "a", json!({ "imports": ["b"] }));
    write_manifest(dir.path(), "b", json!({ "imports": ["a"] }));

    let config = SchedulerConfig {
        cycle_detection,
        ..SchedulerConfig::default()
    };
    let runtime = SchedulerRuntime::builder(Arc::new(FsUnitLoader::new(dir.path())))
        .config(config)
        .spawn()
        .unwrap();
    let handle = runtime.handle();
    handle.request_load("a").await.unwrap();

    let err = handle.wait_idle().await.unwrap_err();
    assert!(matches!(err, SpindleError::CircularDependency(_)));
    assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn broken_manifest_fails_the_load_only() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), "app", json!({ "imports": ["broken"] }));
    write_manifest(dir.path(), "solo", json!({}));
    std::fs::write(dir.path().join("broken.json"), "{ \"imports\": 42 }").unwrap();

    let runtime = SchedulerRuntime::builder(Arc::new(FsUnitLoader::new(dir.path())))
        .spawn()
        .unwrap();
    let handle = runtime.handle();
    handle
        .bootstrap(&UnitId::parse_list("app;solo").unwrap())
        .await
        .unwrap();
    handle.wait_idle().await.unwrap();

    let err = handle.request_load("broken").await.unwrap_err();
    assert!(matches!(err, SpindleError::Loader { .. }));

    let snapshot = handle.snapshot().await.unwrap();
    let phase = |id: &str| snapshot.iter().find(|s| s.id.as_str() == id).map(|s| s.phase);
    assert_eq!(phase("solo"), Some(Phase::Built));
    assert_eq!(phase("app"), Some(Phase::Prepare));
    assert_eq!(phase("broken"), None);
    runtime.shutdown_and_join().await;
}
