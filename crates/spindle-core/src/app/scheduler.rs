//! Scheduler - 1 パス = 発見 → ロード要求 → 順序付け → ビルド
//!
//! # フロー（1 パス）
//! 1. PREPARE のレコードを候補として集める（なければ終了）
//! 2. 候補の依存のうち未ロードのものを調べ、まだ要求していないものがあれば
//!    ロードを要求してこのパスは何もビルドせずに終わる
//! 3. ロード中・ロード失敗の依存を待つ候補（とそれに依存する候補）は除外
//! 4. 循環依存を検出したら致命的エラー（再試行しない）
//! 5. 依存が先に来る順序でビルドし、失敗したら PREPARE に戻す
//! 6. 1 つも進まなければ Exhausted、一部だけ進めばもう一度パスを回す
//!
//! I/O は持たない。ロードの実行は呼び出し側（`runtime`）の責務で、
//! 結果は `complete_load` で戻してもらう。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::app::config::{CycleDetection, SchedulerConfig};
use crate::app::graph::DependencyGraph;
use crate::app::registry::{Declarer, Registry};
use crate::app::resolver::ExportResolver;
use crate::domain::{
    BuildAttempt, BuildContext, Outcome, Phase, SchedulerEvent, SpindleError, UnitId, UnitStatus,
};
use crate::ports::{
    Clock, EventSink, IdGenerator, LoadError, NoopEventSink, SystemClock, UlidGenerator,
    UnitScript,
};

/// Load status of a unit id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Requested, completion not observed yet.
    Requested,
    /// Declaration code has run.
    Loaded,
    /// The loader reported a failure. Not retried.
    Failed(String),
}

/// Answer to a load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    /// First request for this id: the caller must start the load.
    Start,
    InFlight,
    Loaded,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// No unit in PREPARE.
    Quiescent,
    /// New loads were requested; nothing was built.
    AwaitingLoads,
    /// Every buildable candidate reached BUILT.
    Complete,
    /// Some candidates progressed, others remain. Run another pass.
    Partial,
    /// Every candidate waits on a load that is in flight or failed.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub pass: u64,
    pub outcome: PassOutcome,
    /// Ids the caller must start loading.
    pub load_requests: Vec<UnitId>,
    /// Build order computed for this pass.
    pub order: Vec<UnitId>,
    pub built: Vec<UnitId>,
    pub failed: Vec<(UnitId, SpindleError)>,
    /// Candidates left out because they wait on a pending or failed load.
    pub blocked: Vec<UnitId>,
}

impl PassReport {
    fn new(pass: u64, outcome: PassOutcome) -> Self {
        Self {
            pass,
            outcome,
            load_requests: Vec::new(),
            order: Vec::new(),
            built: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
        }
    }
}

pub struct Scheduler {
    registry: Registry,
    loads: BTreeMap<UnitId, LoadState>,
    /// Requested by a pass, not handed to the caller yet.
    unstarted: Vec<UnitId>,
    config: SchedulerConfig,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    attempts: Vec<BuildAttempt>,
    passes: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            registry: Registry::new(),
            loads: BTreeMap::new(),
            unstarted: Vec::new(),
            config,
            sink: Arc::new(NoopEventSink),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            attempts: Vec::new(),
            passes: 0,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn load_state(&self, id: &UnitId) -> Option<&LoadState> {
        self.loads.get(id)
    }

    /// Number of passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn attempts(&self) -> &[BuildAttempt] {
        &self.attempts
    }

    pub fn attempts_for(&self, id: &UnitId) -> Vec<&BuildAttempt> {
        self.attempts.iter().filter(|a| &a.unit == id).collect()
    }

    pub fn snapshot(&self) -> Vec<UnitStatus> {
        self.registry.records().map(|r| r.status()).collect()
    }

    fn emit(&self, event: SchedulerEvent) {
        self.sink.emit(&event);
    }

    /// Register a load request for `id`. Loads happen at most once per id.
    pub fn request(&mut self, id: &UnitId) -> LoadRequest {
        match self.loads.get(id) {
            Some(LoadState::Requested) => LoadRequest::InFlight,
            Some(LoadState::Loaded) => LoadRequest::Loaded,
            Some(LoadState::Failed(reason)) => LoadRequest::Failed(reason.clone()),
            None => {
                info!(unit = %id, "importing component");
                self.loads.insert(id.clone(), LoadState::Requested);
                self.emit(SchedulerEvent::LoadRequested { unit: id.clone() });
                LoadRequest::Start
            }
        }
    }

    /// Loads requested by passes since the last call. The caller must start each of them.
    ///
    /// Drain this after every `settle` or `run_pass`, including failed ones: a pass
    /// that requested loads can be followed by one that fails in the same round.
    pub fn take_load_requests(&mut self) -> Vec<UnitId> {
        std::mem::take(&mut self.unstarted)
    }

    /// Observe the completion of a load started after `request` returned `Start`.
    ///
    /// On success the unit's declaration code runs here, on the scheduler's own context.
    pub fn complete_load(
        &mut self,
        id: &UnitId,
        result: Result<Box<dyn UnitScript>, LoadError>,
    ) -> Result<(), SpindleError> {
        match result {
            Ok(_) if self.loads.get(id) == Some(&LoadState::Loaded) => {
                debug!(unit = %id, "already loaded, ignoring second source");
                Ok(())
            }
            Ok(script) => self.execute_script(id, |declarer| script.declare(declarer)),
            Err(e) => {
                let reason = e.to_string();
                warn!(unit = %id, reason = %reason, "load failed");
                self.loads
                    .insert(id.clone(), LoadState::Failed(reason.clone()));
                self.emit(SchedulerEvent::LoadFailed {
                    unit: id.clone(),
                    reason: reason.clone(),
                });
                Err(SpindleError::Loader {
                    unit: id.clone(),
                    reason,
                })
            }
        }
    }

    /// Declare a unit directly from the host, without a loader.
    ///
    /// Counts as loaded. Defining an id that is already loaded does nothing.
    pub fn define<F>(&mut self, id: &str, script: F) -> Result<(), SpindleError>
    where
        F: FnOnce(&mut Declarer<'_>) -> Result<(), SpindleError>,
    {
        let id = UnitId::parse(id)?;
        if self.loads.get(&id) == Some(&LoadState::Loaded) {
            debug!(unit = %id, "already loaded, skipping definition");
            return Ok(());
        }
        self.execute_script(&id, script)
    }

    fn execute_script<F>(&mut self, id: &UnitId, script: F) -> Result<(), SpindleError>
    where
        F: FnOnce(&mut Declarer<'_>) -> Result<(), SpindleError>,
    {
        let existed = self.registry.contains(id);
        let context = self.registry.open_context(id.clone());
        let result = script(&mut Declarer::new(&mut self.registry, context.clone()));
        self.registry.close_context(&context);
        self.loads.insert(id.clone(), LoadState::Loaded);

        if !existed && self.registry.contains(id) {
            self.emit(SchedulerEvent::UnitDeclared { unit: id.clone() });
        }
        if self.registry.get(id).is_some_and(|r| r.phase() == Phase::Prepare) {
            self.emit(SchedulerEvent::UnitQueued { unit: id.clone() });
        }
        self.emit(SchedulerEvent::UnitLoaded { unit: id.clone() });

        match &result {
            Ok(()) => info!(unit = %id, "component loaded"),
            Err(e) => warn!(unit = %id, error = %e, "declaration code failed"),
        }
        result
    }

    /// Invoke a BUILT unit's handler for `event`.
    pub fn dispatch(
        &self,
        id: &UnitId,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SpindleError> {
        self.registry
            .get(id)
            .ok_or_else(|| SpindleError::UnknownUnit(id.clone()))?
            .dispatch(event, payload)
    }

    /// Run passes until the round is done: quiescent, complete or stalled.
    /// Returns the reports of every pass.
    ///
    /// A pass that requests loads is followed by another one, so candidates that
    /// do not wait on those loads are still built in this round. The loads to start
    /// come from `take_load_requests`, whether the round succeeded or not.
    pub async fn settle(&mut self) -> Result<Vec<PassReport>, SpindleError> {
        let mut reports = Vec::new();
        for _ in 0..self.config.max_passes_per_round.max(1) {
            let report = self.run_pass().await?;
            let outcome = report.outcome;
            reports.push(report);
            if !matches!(outcome, PassOutcome::Partial | PassOutcome::AwaitingLoads) {
                return Ok(reports);
            }
        }
        let remaining = self.registry.in_phase(Phase::Prepare);
        let error = SpindleError::Exhausted(remaining);
        error!(error = %error, "pass limit reached");
        self.emit(SchedulerEvent::SchedulerFailed {
            reason: error.to_string(),
        });
        Err(error)
    }

    /// One discover / order / build pass.
    pub async fn run_pass(&mut self) -> Result<PassReport, SpindleError> {
        self.passes += 1;
        let pass = self.passes;
        let result = self
            .run_pass_inner(pass)
            .instrument(info_span!("pass", pass))
            .await;
        if let Err(e) = &result {
            error!(pass, error = %e, "build pass aborted");
            self.emit(SchedulerEvent::SchedulerFailed {
                reason: e.to_string(),
            });
        }
        result
    }

    async fn run_pass_inner(&mut self, pass: u64) -> Result<PassReport, SpindleError> {
        info!("starting component load pass");
        let candidates = self.registry.in_phase(Phase::Prepare);
        if candidates.is_empty() {
            debug!("nothing to build");
            return Ok(PassReport::new(pass, PassOutcome::Quiescent));
        }
        self.emit(SchedulerEvent::PassStarted {
            pass,
            candidates: candidates.len(),
        });

        // Dependencies not loaded yet, per candidate.
        let missing: BTreeMap<UnitId, Vec<UnitId>> = candidates
            .iter()
            .map(|unit| {
                let deps = self
                    .registry
                    .get(unit)
                    .map(|r| r.dependencies())
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|dep| self.loads.get(dep) != Some(&LoadState::Loaded))
                    .collect();
                (unit.clone(), deps)
            })
            .collect();

        let unrequested: BTreeSet<UnitId> = missing
            .values()
            .flatten()
            .filter(|dep| !self.loads.contains_key(*dep))
            .cloned()
            .collect();
        if !unrequested.is_empty() {
            info!(count = unrequested.len(), "there are unloaded components");
            let mut report = PassReport::new(pass, PassOutcome::AwaitingLoads);
            for dep in unrequested {
                if self.request(&dep) == LoadRequest::Start {
                    self.unstarted.push(dep.clone());
                    report.load_requests.push(dep);
                }
            }
            self.finish_pass(&report, candidates.len());
            return Ok(report);
        }

        let blocked = blocked_candidates(&candidates, &missing, &self.registry);
        let buildable: Vec<UnitId> = candidates
            .iter()
            .filter(|c| !blocked.contains(*c))
            .cloned()
            .collect();
        if buildable.is_empty() {
            info!(blocked = blocked.len(), "all candidates wait on pending or failed loads");
            let mut report = PassReport::new(pass, PassOutcome::Stalled);
            report.blocked = blocked.into_iter().collect();
            self.finish_pass(&report, candidates.len());
            return Ok(report);
        }
        info!("all component dependencies imported");

        let order = self.build_order(&buildable)?;

        let mut report = PassReport::new(pass, PassOutcome::Complete);
        report.blocked = blocked.into_iter().collect();
        report.order = order.clone();
        for unit in &order {
            match self.build_unit(unit, pass).await {
                Ok(()) => report.built.push(unit.clone()),
                Err(e) => report.failed.push((unit.clone(), e)),
            }
        }

        if report.built.is_empty() {
            self.finish_pass(&report, candidates.len());
            let remaining: Vec<UnitId> = report.failed.iter().map(|(u, _)| u.clone()).collect();
            return Err(SpindleError::Exhausted(remaining));
        }
        if report.built.len() < order.len() {
            report.outcome = PassOutcome::Partial;
        }
        self.finish_pass(&report, candidates.len());
        Ok(report)
    }

    fn finish_pass(&self, report: &PassReport, candidates: usize) {
        info!(
            outcome = ?report.outcome,
            built = report.built.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            "pass finished"
        );
        self.emit(SchedulerEvent::PassFinished {
            pass: report.pass,
            built: report.built.len(),
            remaining: candidates - report.built.len(),
        });
    }

    /// Cycle check + ordering of the units to build in this pass.
    pub fn build_order(&self, buildable: &[UnitId]) -> Result<Vec<UnitId>, SpindleError> {
        let graph = DependencyGraph::from_registry(&self.registry);
        match self.config.cycle_detection {
            CycleDetection::Direct => {
                if let Some((a, b)) = graph.find_mutual_dependency(buildable) {
                    return Err(SpindleError::CircularDependency(vec![a.clone(), b, a]));
                }
            }
            CycleDetection::Full => {
                if let Some(cycle) = graph.detect_cycle() {
                    return Err(SpindleError::CircularDependency(cycle));
                }
            }
        }
        graph
            .build_order(buildable)
            .map_err(SpindleError::CircularDependency)
    }

    /// Build one unit while holding the build slot for it.
    async fn build_unit(&mut self, id: &UnitId, pass: u64) -> Result<(), SpindleError> {
        info!(unit = %id, "building");
        let started_at = self.clock.now();
        self.emit(SchedulerEvent::BuildStarted {
            unit: id.clone(),
            pass,
        });

        self.registry.grant_build(id);
        let result = self.execute_build(id).await;
        self.registry.revoke_build();

        let outcome = match &result {
            Ok(()) => {
                info!(unit = %id, "component built");
                self.emit(SchedulerEvent::UnitBuilt {
                    unit: id.clone(),
                    pass,
                });
                Outcome::success()
            }
            Err(e) => {
                warn!(unit = %id, error = %e, "build failed, back to PREPARE");
                self.emit(SchedulerEvent::BuildFailed {
                    unit: id.clone(),
                    pass,
                    reason: e.to_string(),
                });
                Outcome::failure(e.to_string())
            }
        };
        self.attempts.push(BuildAttempt {
            attempt_id: self.ids.generate_attempt_id(),
            unit: id.clone(),
            pass,
            outcome,
            started_at,
            finished_at: self.clock.now(),
        });
        result
    }

    async fn execute_build(&mut self, id: &UnitId) -> Result<(), SpindleError> {
        let logic = self.registry.begin_build(id)?;

        let prepared = {
            let record = self
                .registry
                .get(id)
                .ok_or_else(|| SpindleError::UnknownUnit(id.clone()))?;
            let unbuilt = record.dependency_slice().iter().find(|dep| {
                self.registry
                    .get(dep)
                    .is_none_or(|r| r.phase() != Phase::Built)
            });
            match unbuilt {
                Some(dep) => Err(SpindleError::DependencyNotBuilt {
                    unit: id.clone(),
                    dependency: dep.clone(),
                }),
                None => ExportResolver::new(&self.registry, &self.config.self_reference)
                    .resolve_all(record)
                    .map(|injections| {
                        BuildContext::new(id.clone(), record.hooked_events().to_vec(), injections)
                    }),
            }
        };
        let mut cx = match prepared {
            Ok(cx) => cx,
            Err(e) => return self.revert(id, e),
        };

        if let Err(e) = logic.run(&mut cx).await {
            let error = SpindleError::Logic {
                unit: id.clone(),
                message: e.to_string(),
            };
            return self.revert(id, error);
        }

        let (exports, handlers) = cx.into_parts();
        self.registry
            .get_mut(id)
            .ok_or_else(|| SpindleError::UnknownUnit(id.clone()))?
            .mark_built(exports, handlers)
    }

    fn revert(&mut self, id: &UnitId, error: SpindleError) -> Result<(), SpindleError> {
        if let Some(record) = self.registry.get_mut(id) {
            record.revert_build(&error)?;
        }
        Err(error)
    }
}

/// Candidates that wait on a pending or failed load, directly or through
/// another blocked candidate.
fn blocked_candidates(
    candidates: &[UnitId],
    missing: &BTreeMap<UnitId, Vec<UnitId>>,
    registry: &Registry,
) -> BTreeSet<UnitId> {
    let mut blocked: BTreeSet<UnitId> = missing
        .iter()
        .filter(|(_, deps)| !deps.is_empty())
        .map(|(unit, _)| unit.clone())
        .collect();

    loop {
        let newly: Vec<UnitId> = candidates
            .iter()
            .filter(|c| !blocked.contains(*c))
            .filter(|c| {
                registry
                    .get(c)
                    .is_some_and(|r| r.dependency_slice().iter().any(|d| blocked.contains(d)))
            })
            .cloned()
            .collect();
        if newly.is_empty() {
            return blocked;
        }
        blocked.extend(newly);
    }
}
