//! Runtime - スケジューラを 1 つの tokio タスク（単一コンテキスト）で動かす
//!
//! # 構成
//! - **Actor**: `Scheduler` を所有する唯一のタスク。registry の変更はすべてここで行う
//! - **SchedulerHandle**: ホスト側の入口（clone 可）。コマンドを mpsc で送る
//! - **ロード**: `UnitLoader::load` は別タスクで実行し、結果だけを actor に戻す。
//!   宣言コードの実行は actor 上で行う
//! - **Debouncer**: ロード完了をまとめて 1 ラウンドのパスにする
//!
//! # 停止
//! - `shutdown_and_join` で watch に true を送り、actor の終了を待つ
//! - 実行中のロードは中断しない（結果は捨てられる）

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::config::SchedulerConfig;
use crate::app::debounce::Debouncer;
use crate::app::registry::Declarer;
use crate::app::scheduler::{LoadRequest, Scheduler};
use crate::domain::{BuildAttempt, SpindleError, UnitId, UnitStatus};
use crate::ports::{Clock, EventSink, IdGenerator, LoadError, UnitLoader, UnitScript};

const COMMAND_BUFFER: usize = 64;

type LoadCompletion = (UnitId, Result<Box<dyn UnitScript>, LoadError>);
type Reply<T> = oneshot::Sender<T>;

enum Command {
    RequestLoad {
        unit: UnitId,
        reply: Reply<Result<(), SpindleError>>,
    },
    Define {
        unit: UnitId,
        script: Box<dyn UnitScript>,
        reply: Reply<Result<(), SpindleError>>,
    },
    Dispatch {
        unit: UnitId,
        event: String,
        payload: serde_json::Value,
        reply: Reply<Result<(), SpindleError>>,
    },
    Snapshot {
        reply: Reply<Vec<UnitStatus>>,
    },
    Attempts {
        reply: Reply<Vec<BuildAttempt>>,
    },
    WaitIdle {
        reply: Reply<Result<(), SpindleError>>,
    },
}

/// Observable state of the runtime, published through a watch channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub passes: u64,
    pub loads_in_flight: usize,
    pub idle: bool,
    /// Fatal error that stopped building for good.
    pub halted: Option<String>,
}

/// Wires a `Scheduler` to a loader and spawns it.
///
/// # 使用例
/// ```ignore
/// let runtime = RuntimeBuilder::new(Arc::new(FsUnitLoader::new("units")))
///     .config(config)
///     .spawn()?;
/// runtime.handle().bootstrap(&ids).await?;
/// runtime.handle().wait_idle().await?;
/// ```
pub struct RuntimeBuilder {
    loader: Arc<dyn UnitLoader>,
    config: SchedulerConfig,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl RuntimeBuilder {
    pub fn new(loader: Arc<dyn UnitLoader>) -> Self {
        Self {
            loader,
            config: SchedulerConfig::default(),
            sink: None,
            clock: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Validate the configuration and spawn the actor on the current tokio runtime.
    pub fn spawn(self) -> Result<SchedulerRuntime, SpindleError> {
        if self.config.max_passes_per_round == 0 {
            return Err(SpindleError::Config(
                "max_passes_per_round must be at least 1".to_string(),
            ));
        }
        if self.config.self_reference.trim().is_empty() {
            return Err(SpindleError::Config(
                "self_reference must not be empty".to_string(),
            ));
        }

        let window = self.config.batch_window();
        let mut scheduler = Scheduler::new(self.config);
        if let Some(sink) = self.sink {
            scheduler = scheduler.with_event_sink(sink);
        }
        if let Some(clock) = self.clock {
            scheduler = scheduler.with_clock(clock);
        }
        if let Some(ids) = self.ids {
            scheduler = scheduler.with_id_generator(ids);
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RuntimeStatus {
            idle: true,
            ..RuntimeStatus::default()
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor = Actor {
            scheduler,
            loader: self.loader,
            commands: commands_rx,
            completions_tx,
            completions: completions_rx,
            debouncer: Debouncer::new(window),
            load_waiters: BTreeMap::new(),
            idle_waiters: Vec::new(),
            in_flight: 0,
            halted: None,
            last_error: None,
            status: status_tx,
        };
        let join = tokio::spawn(actor.run(shutdown_rx));

        Ok(SchedulerRuntime {
            handle: SchedulerHandle {
                commands: commands_tx,
                status: status_rx,
            },
            shutdown_tx,
            join,
        })
    }
}

/// A running scheduler actor.
/// - `shutdown_tx` を drop すると actor も止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct SchedulerRuntime {
    handle: SchedulerHandle,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerRuntime {
    pub fn builder(loader: Arc<dyn UnitLoader>) -> RuntimeBuilder {
        RuntimeBuilder::new(loader)
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "scheduler runtime task failed");
        }
    }
}

/// Host-side entry point to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<RuntimeStatus>,
}

impl SchedulerHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, SpindleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SpindleError::RuntimeClosed)?;
        rx.await.map_err(|_| SpindleError::RuntimeClosed)
    }

    /// Request the load of `id`. Resolves once that unit's load has completed
    /// (not its build). Requesting an already loaded id resolves immediately.
    pub async fn request_load(&self, id: &str) -> Result<(), SpindleError> {
        let unit = UnitId::parse(id)?;
        self.call(|reply| Command::RequestLoad { unit, reply }).await?
    }

    /// Request several ids at once and wait for all of their loads.
    ///
    /// Every load is attempted; the first failure is returned.
    pub async fn bootstrap(&self, ids: &[UnitId]) -> Result<(), SpindleError> {
        let mut pending = Vec::with_capacity(ids.len());
        for unit in ids {
            let (reply, rx) = oneshot::channel();
            self.commands
                .send(Command::RequestLoad {
                    unit: unit.clone(),
                    reply,
                })
                .await
                .map_err(|_| SpindleError::RuntimeClosed)?;
            pending.push(rx);
        }

        let mut first_error = None;
        for rx in pending {
            let result = rx.await.map_err(|_| SpindleError::RuntimeClosed)?;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Declare a unit from the host without going through the loader.
    pub async fn define<F>(&self, id: &str, script: F) -> Result<(), SpindleError>
    where
        F: FnOnce(&mut Declarer<'_>) -> Result<(), SpindleError>
            + Send
            + 'static,
    {
        let unit = UnitId::parse(id)?;
        let script: Box<dyn UnitScript> = Box::new(script);
        self.call(|reply| Command::Define {
            unit,
            script,
            reply,
        })
        .await?
    }

    /// Invoke the handler a BUILT unit registered for `event`.
    pub async fn dispatch(
        &self,
        id: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), SpindleError> {
        let unit = UnitId::parse(id)?;
        let event = event.to_string();
        self.call(|reply| Command::Dispatch {
            unit,
            event,
            payload,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<Vec<UnitStatus>, SpindleError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn attempts(&self) -> Result<Vec<BuildAttempt>, SpindleError> {
        self.call(|reply| Command::Attempts { reply }).await
    }

    /// Wait until no load is in flight and no pass is pending.
    ///
    /// Returns the fatal error if building was halted, or the error of the
    /// last round if it ended without progress.
    pub async fn wait_idle(&self) -> Result<(), SpindleError> {
        self.call(|reply| Command::WaitIdle { reply }).await?
    }

    /// Latest published status.
    pub fn status(&self) -> RuntimeStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.clone()
    }
}

struct Actor {
    scheduler: Scheduler,
    loader: Arc<dyn UnitLoader>,
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<LoadCompletion>,
    completions: mpsc::UnboundedReceiver<LoadCompletion>,
    debouncer: Debouncer,
    load_waiters: BTreeMap<UnitId, Vec<Reply<Result<(), SpindleError>>>>,
    idle_waiters: Vec<Reply<Result<(), SpindleError>>>,
    in_flight: usize,
    /// Set by a circular dependency. Building never resumes.
    halted: Option<SpindleError>,
    /// Error of the last round, cleared by the next successful one.
    last_error: Option<SpindleError>,
    status: watch::Sender<RuntimeStatus>,
}

impl Actor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler runtime started");
        loop {
            self.publish_status();
            if self.is_idle() {
                self.notify_idle();
            }
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // sender dropped: nobody can stop us any more, so stop now
                    if changed.is_err() {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((unit, result)) = self.completions.recv() => {
                    self.handle_completion(unit, result);
                }
                _ = self.debouncer.fired() => {
                    self.run_round().await;
                }
            }
        }
        info!("scheduler runtime stopped");
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && !self.debouncer.is_armed()
    }

    fn notify_idle(&mut self) {
        let result = match self.halted.as_ref().or(self.last_error.as_ref()) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn publish_status(&self) {
        let status = RuntimeStatus {
            passes: self.scheduler.passes(),
            loads_in_flight: self.in_flight,
            idle: self.is_idle(),
            halted: self.halted.as_ref().map(ToString::to_string),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestLoad { unit, reply } => self.request_load(unit, reply),
            Command::Define {
                unit,
                script,
                reply,
            } => {
                let result = self
                    .scheduler
                    .define(unit.as_str(), |declarer| script.declare(declarer));
                self.debouncer.trigger();
                let _ = reply.send(result);
            }
            Command::Dispatch {
                unit,
                event,
                payload,
                reply,
            } => {
                let _ = reply.send(self.scheduler.dispatch(&unit, &event, &payload));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.scheduler.snapshot());
            }
            Command::Attempts { reply } => {
                let _ = reply.send(self.scheduler.attempts().to_vec());
            }
            Command::WaitIdle { reply } => self.idle_waiters.push(reply),
        }
    }

    fn request_load(&mut self, unit: UnitId, reply: Reply<Result<(), SpindleError>>) {
        match self.scheduler.request(&unit) {
            LoadRequest::Start => {
                self.spawn_load(unit.clone());
                self.load_waiters.entry(unit).or_default().push(reply);
            }
            LoadRequest::InFlight => {
                self.load_waiters.entry(unit).or_default().push(reply);
            }
            LoadRequest::Loaded => {
                debug!(unit = %unit, "already loaded");
                let _ = reply.send(Ok(()));
            }
            LoadRequest::Failed(reason) => {
                let _ = reply.send(Err(SpindleError::Loader { unit, reason }));
            }
        }
    }

    fn spawn_load(&mut self, unit: UnitId) {
        self.in_flight += 1;
        let loader = Arc::clone(&self.loader);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = loader.load(&unit).await;
            // actor gone: nobody is interested in the result
            let _ = completions.send((unit, result));
        });
    }

    fn handle_completion(&mut self, unit: UnitId, result: Result<Box<dyn UnitScript>, LoadError>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let outcome = self.scheduler.complete_load(&unit, result);
        for waiter in self.load_waiters.remove(&unit).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
        self.debouncer.trigger();
    }

    async fn run_round(&mut self) {
        if let Some(e) = &self.halted {
            debug!(error = %e, "building halted, skipping pass");
            return;
        }
        let settled = self.scheduler.settle().await;
        for unit in self.scheduler.take_load_requests() {
            self.spawn_load(unit);
        }
        match settled {
            Ok(_) => self.last_error = None,
            Err(e) if e.is_fatal_to_scheduler() => {
                error!(error = %e, "building halted");
                self.halted = Some(e);
            }
            Err(e) => {
                warn!(error = %e, "round ended without progress, waiting for new loads");
                self.last_error = Some(e);
            }
        }
    }
}
