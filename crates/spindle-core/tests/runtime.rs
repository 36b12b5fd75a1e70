use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use spindle_core::app::{SchedulerConfig, SchedulerHandle, SchedulerRuntime};
use spindle_core::domain::{LogicError, Phase, SchedulerEvent, SpindleError, UnitId, logic_fn};
use spindle_core::impls::{InMemoryUnitLoader, RecordingEventSink};
use spindle_core::ports::FixedClock;

fn unit(id: &str) -> UnitId {
    UnitId::parse(id).unwrap()
}

/// Register `id` importing `deps`, exporting a flag named after itself.
fn leaf(loader: &InMemoryUnitLoader, id: &'static str, deps: &'static [&'static str]) {
    loader.insert(id, move |d| {
        let component = d.component()?;
        for dep in deps {
            component.import(dep, &[])?;
        }
        component.run(logic_fn(move |cx| cx.export(id, true)))?;
        Ok(())
    });
}

async fn phase_of(handle: &SchedulerHandle, id: &str) -> Option<Phase> {
    let id = unit(id);
    handle
        .snapshot()
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.id == id)
        .map(|s| s.phase)
}

#[tokio::test]
async fn units_without_dependencies_are_built() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "a", &[]);
    leaf(&loader, "b", &[]);

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    handle.bootstrap(&[unit("a"), unit("b")]).await.unwrap();
    handle.wait_idle().await.unwrap();

    assert_eq!(phase_of(&handle, "a").await, Some(Phase::Built));
    assert_eq!(phase_of(&handle, "b").await, Some(Phase::Built));
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn chain_is_built_from_the_leaves() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "a", &["b"]);
    leaf(&loader, "b", &["c"]);
    leaf(&loader, "c", &[]);
    let sink = Arc::new(RecordingEventSink::new());

    let runtime = SchedulerRuntime::builder(loader)
        .event_sink(sink.clone())
        .spawn()
        .unwrap();
    let handle = runtime.handle();
    handle.request_load("a").await.unwrap();
    handle.wait_idle().await.unwrap();

    let built: Vec<UnitId> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::UnitBuilt { unit, .. } => Some(unit),
            _ => None,
        })
        .collect();
    assert_eq!(built, vec![unit("c"), unit("b"), unit("a")]);
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn redeclaring_returns_the_same_record() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    loader.insert("app", |d| {
        d.component()?.import("lib", &[])?.run(logic_fn(|_| Ok(())))?;
        let again = d.component()?;
        assert_eq!(again.phase(), Phase::Prepare);
        assert_eq!(again.dependencies(), vec![UnitId::parse("lib").unwrap()]);
        Ok(())
    });
    leaf(&loader, "lib", &[]);

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    handle.request_load("app").await.unwrap();
    handle.wait_idle().await.unwrap();

    assert_eq!(phase_of(&handle, "app").await, Some(Phase::Built));
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn collision_leaves_unit_in_prepare_and_override_fixes_it() {
    let cases: [(&'static [&'static str], bool); 2] = [(&[], false), (&["Parser"], true)];
    for (overrides, resolves) in cases {
        let loader = Arc::new(InMemoryUnitLoader::new());
        for (id, value) in [("lib-a", "a"), ("lib-b", "b")] {
            loader.insert(id, move |d| {
                d.component()?
                    .run(logic_fn(move |cx| cx.export("Parser", value)))?;
                Ok(())
            });
        }
        loader.insert("x", move |d| {
            d.component()?
                .import("lib-a", &[])?
                .import("lib-b", overrides)?
                .require("Parser")?
                .run(logic_fn(|cx| {
                    let parser: String = cx.import("Parser")?;
                    cx.export("chosen", parser)
                }))?;
            Ok(())
        });

        let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
        let handle = runtime.handle();
        handle.request_load("x").await.unwrap();
        let settled = handle.wait_idle().await;

        if resolves {
            settled.unwrap();
            assert_eq!(phase_of(&handle, "x").await, Some(Phase::Built));
        } else {
            assert_eq!(settled.unwrap_err(), SpindleError::Exhausted(vec![unit("x")]));
            let status = handle.snapshot().await.unwrap();
            let x = status.iter().find(|s| s.id == unit("x")).unwrap();
            assert_eq!(x.phase, Phase::Prepare);
            assert!(x.last_error.as_deref().unwrap().contains("several dependencies"));
        }
        runtime.shutdown_and_join().await;
    }
}

#[tokio::test]
async fn failed_logic_is_retried_when_new_units_arrive() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    let failures = Arc::new(AtomicU32::new(1));
    let remaining = failures.clone();
    loader.insert("flaky", move |d| {
        let remaining = remaining.clone();
        d.component()?.run(logic_fn(move |_| {
            if remaining.load(Ordering::Relaxed) > 0 {
                remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(LogicError::msg("intentional failure"));
            }
            Ok(())
        }))?;
        Ok(())
    });
    leaf(&loader, "other", &[]);

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    handle.request_load("flaky").await.unwrap();
    assert!(matches!(
        handle.wait_idle().await,
        Err(SpindleError::Exhausted(_))
    ));
    assert_eq!(phase_of(&handle, "flaky").await, Some(Phase::Prepare));

    // A new load is new information: the next round retries.
    handle.request_load("other").await.unwrap();
    handle.wait_idle().await.unwrap();
    assert_eq!(phase_of(&handle, "flaky").await, Some(Phase::Built));

    let attempts = handle.attempts().await.unwrap();
    let flaky: Vec<_> = attempts.iter().filter(|a| a.unit == unit("flaky")).collect();
    assert_eq!(flaky.len(), 2);
    assert!(!flaky[0].outcome.is_success());
    assert!(flaky[1].outcome.is_success());
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn loads_requested_in_an_exhausted_round_still_run() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "l", &[]);
    let config = SchedulerConfig {
        batch_window_ms: 200,
        ..SchedulerConfig::default()
    };

    let runtime = SchedulerRuntime::builder(loader.clone())
        .config(config)
        .spawn()
        .unwrap();
    let handle = runtime.handle();
    handle
        .define("y", |d| {
            d.component()?
                .run(logic_fn(|_| Err(LogicError::msg("always fails"))))?;
            Ok(())
        })
        .await
        .unwrap();
    handle
        .define("x", |d| {
            d.component()?.import("l", &[])?.run(logic_fn(|_| Ok(())))?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(
        handle.wait_idle().await.unwrap_err(),
        SpindleError::Exhausted(vec![unit("y")])
    );
    assert_eq!(loader.load_count(&unit("l")), 1);
    assert_eq!(phase_of(&handle, "x").await, Some(Phase::Built));
    tokio::time::timeout(Duration::from_secs(2), handle.request_load("l"))
        .await
        .expect("load of l should have completed")
        .unwrap();
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn failing_dependency_keeps_dependent_unbuilt() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    loader.insert("b", |d| {
        d.component()?
            .run(logic_fn(|_| Err(LogicError::msg("boom"))))?;
        Ok(())
    });
    leaf(&loader, "a", &["b"]);
    leaf(&loader, "c", &[]);

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    handle.bootstrap(&[unit("a"), unit("c")]).await.unwrap();

    assert!(matches!(
        handle.wait_idle().await,
        Err(SpindleError::Exhausted(_))
    ));
    assert_eq!(phase_of(&handle, "a").await, Some(Phase::Prepare));
    assert_eq!(phase_of(&handle, "b").await, Some(Phase::Prepare));
    assert_eq!(phase_of(&handle, "c").await, Some(Phase::Built));
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn stuck_load_only_stalls_its_dependents() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "app", &["slow"]);
    leaf(&loader, "solo", &[]);
    loader.hang("slow");

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    handle.bootstrap(&[unit("app"), unit("solo")]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while phase_of(&handle, "solo").await != Some(Phase::Built) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("independent unit should be built");

    assert_eq!(phase_of(&handle, "app").await, Some(Phase::Prepare));
    assert_eq!(handle.status().loads_in_flight, 1);
    assert!(!handle.status().idle);
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn failed_load_is_reported_and_not_retried() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "app", &["ghost"]);

    let runtime = SchedulerRuntime::builder(loader.clone()).spawn().unwrap();
    let handle = runtime.handle();
    handle.request_load("app").await.unwrap();
    handle.wait_idle().await.unwrap();

    assert_eq!(phase_of(&handle, "app").await, Some(Phase::Prepare));
    let err = handle.request_load("ghost").await.unwrap_err();
    assert!(matches!(err, SpindleError::Loader { .. }));
    assert_eq!(loader.load_count(&unit("ghost")), 1);
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn delayed_loads_are_coalesced() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "app", &["x", "y"]);
    leaf(&loader, "x", &[]);
    leaf(&loader, "y", &[]);
    loader.delay("y", Duration::from_millis(20));

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    handle.request_load("app").await.unwrap();
    handle.wait_idle().await.unwrap();

    for id in ["app", "x", "y"] {
        assert_eq!(phase_of(&handle, id).await, Some(Phase::Built));
    }
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn host_defined_units_and_dispatch() {
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "lib", &[]);
    let resets = Arc::new(AtomicU32::new(0));

    let runtime = SchedulerRuntime::builder(loader).spawn().unwrap();
    let handle = runtime.handle();
    let counter = resets.clone();
    handle
        .define("app", move |d| {
            d.component()?
                .import("lib", &[])?
                .hook("reset")?
                .require("component")?
                .run(logic_fn(move |cx| {
                    let counter = counter.clone();
                    cx.on("reset", move |payload: &serde_json::Value| {
                        if payload["hard"] == json!(true) {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok::<(), LogicError>(())
                    })
                }))?;
            Ok(())
        })
        .await
        .unwrap();
    handle.wait_idle().await.unwrap();

    handle
        .dispatch("app", "reset", json!({ "hard": true }))
        .await
        .unwrap();
    assert_eq!(resets.load(Ordering::Relaxed), 1);
    assert!(handle.dispatch("app", "compile", json!({})).await.is_err());
    assert!(matches!(
        handle.dispatch("nobody", "reset", json!({})).await,
        Err(SpindleError::UnknownUnit(_))
    ));
    runtime.shutdown_and_join().await;
}

#[tokio::test]
async fn attempts_use_the_injected_clock() {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let loader = Arc::new(InMemoryUnitLoader::new());
    leaf(&loader, "a", &[]);

    let runtime = SchedulerRuntime::builder(loader)
        .clock(Arc::new(FixedClock::new(at)))
        .spawn()
        .unwrap();
    let handle = runtime.handle();
    handle.request_load("a").await.unwrap();
    handle.wait_idle().await.unwrap();

    let attempts = handle.attempts().await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].started_at, at);
    assert_eq!(attempts[0].finished_at, at);
    assert_eq!(attempts[0].pass, handle.status().passes);
    runtime.shutdown_and_join().await;
}
