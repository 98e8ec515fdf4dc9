//! Pipeline engine: walks a run's stages and owns every write to the run
//! while it is active.
//!
//! Each mutation follows the same order: apply to the in-memory record,
//! persist through the run store, then publish to the broadcaster. A stage
//! only starts after the previous one's outcome has been persisted, and a
//! failed write stops the run rather than letting memory drift from disk.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::broadcast::{EventBroadcaster, RunEvent, StatusChange};
use super::clients::{ClientDirectory, StaticClientDirectory};
use super::executors::export::{HELD_FOR_REVIEW, write_export};
use super::executors::{
    ExecutorMap, ExecutorSettings, StageContext, StageExecutor, StageOutcome, StageReport,
    default_executors,
};
use super::models::{
    Artifact, LogEntry, LogLevel, ReviewState, ReviewStatus, RunId, RunInputs, RunMode, RunRecord,
    RunStatus, SYSTEM_STAGE, StageId, StageStatus,
};
use super::process::{LogSink, ProcessRunner};
use super::registry;
use super::store::RunStore;
use crate::config::{PipelineSection, StudioToml};
use crate::errors::OrchestratorError;

/// Engine tuning, usually taken from the `[pipeline]` config section.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub log_limit: usize,
    pub stage_timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub cancel_wait: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&PipelineSection::default())
    }
}

impl From<&PipelineSection> for EngineSettings {
    fn from(section: &PipelineSection) -> Self {
        Self {
            log_limit: section.log_limit,
            stage_timeout: section.stage_timeout(),
            kill_grace: section.kill_grace(),
            cancel_wait: section.cancel_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was live and has been told to stop.
    Signaled,
    /// Nothing to cancel: the run already finished or never started here.
    NotActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub interrupted: Vec<RunId>,
    pub restarted: Vec<RunId>,
}

// ── Live run state ───────────────────────────────────────────────────

/// The single writer's view of one active run.
pub struct LiveRun {
    run_id: RunId,
    record: tokio::sync::Mutex<RunRecord>,
    persist_error: std::sync::Mutex<Option<String>>,
    store: Arc<dyn RunStore>,
    broadcaster: Arc<EventBroadcaster>,
    log_limit: usize,
}

impl LiveRun {
    fn new(
        run: RunRecord,
        store: Arc<dyn RunStore>,
        broadcaster: Arc<EventBroadcaster>,
        log_limit: usize,
    ) -> Self {
        Self {
            run_id: run.run_id,
            record: tokio::sync::Mutex::new(run),
            persist_error: std::sync::Mutex::new(None),
            store,
            broadcaster,
            log_limit,
        }
    }

    pub async fn snapshot(&self) -> RunRecord {
        self.record.lock().await.clone()
    }

    pub fn persistence_failure(&self) -> Option<String> {
        self.persist_error.lock().ok().and_then(|slot| slot.clone())
    }

    /// Apply `f`, persist, then publish the events it returned.
    ///
    /// Once a write has failed every later update is refused with the same
    /// message.
    async fn update<F>(&self, f: F) -> Result<RunRecord, String>
    where
        F: FnOnce(&mut RunRecord, usize) -> Vec<RunEvent> + Send,
    {
        let mut run = self.record.lock().await;
        if let Some(message) = self.persistence_failure() {
            return Err(message);
        }
        let events = f(&mut *run, self.log_limit);
        run.touch();
        if let Err(e) = self.store.upsert(run.clone()).await {
            let message = format!("Persistence failure: {}", e);
            error!(run_id = %self.run_id, error = %e, "failed to persist run");
            if let Ok(mut slot) = self.persist_error.lock() {
                slot.get_or_insert_with(|| message.clone());
            }
            return Err(message);
        }
        for event in events {
            self.broadcaster.publish(&run, event);
        }
        Ok(run.clone())
    }

    async fn log(&self, stage: &str, level: LogLevel, message: String) -> Result<(), String> {
        let stage = stage.to_string();
        self.update(move |run, limit| {
            let mut events = Vec::with_capacity(1);
            push_log(run, limit, &stage, level, message, &mut events);
            events
        })
        .await
        .map(|_| ())
    }
}

fn push_log(
    run: &mut RunRecord,
    limit: usize,
    stage: &str,
    level: LogLevel,
    message: impl Into<String>,
    events: &mut Vec<RunEvent>,
) {
    let entry = LogEntry::new(stage, level, message);
    run.push_log(entry.clone(), limit);
    events.push(RunEvent::Log(entry));
}

fn set_status(run: &mut RunRecord, to: RunStatus, events: &mut Vec<RunEvent>) {
    match run.transition(to) {
        Ok(()) => events.push(RunEvent::Status(StatusChange::of(run))),
        Err(e) => error!(run_id = %run.run_id, error = %e, "rejected status transition"),
    }
}

fn apply_review(run: &mut RunRecord, required: bool, events: &mut Vec<RunEvent>) {
    match run.review_state.as_mut() {
        Some(review) if required && !review.required => {
            review.required = true;
            review.updated_at = Utc::now();
            events.push(RunEvent::Review(review.clone()));
        }
        Some(_) => {}
        None => {
            let review = ReviewState::new(required);
            events.push(RunEvent::Review(review.clone()));
            run.review_state = Some(review);
        }
    }
}

fn push_artifact(run: &mut RunRecord, artifact: Artifact, events: &mut Vec<RunEvent>) {
    run.artifacts.push(artifact.clone());
    events.push(RunEvent::Artifact(artifact));
}

/// Routes executor and process output into the run's log.
///
/// A failed write cancels the stage, so its process is terminated and the
/// engine can surface the persistence failure without waiting for it.
struct StageLogger {
    live: Arc<LiveRun>,
    stage: &'static str,
    cancel: CancellationToken,
}

#[async_trait]
impl LogSink for StageLogger {
    async fn emit(&self, level: LogLevel, message: String) {
        if self.live.log(self.stage, level, message).await.is_err() {
            self.cancel.cancel();
        }
    }
}

// ── Active run registry ──────────────────────────────────────────────

#[derive(Clone)]
struct ActiveRun {
    token: CancellationToken,
    live: Arc<LiveRun>,
}

/// Runs that have a live pipeline task in this process.
#[derive(Default)]
pub struct ActiveRuns {
    runs: DashMap<RunId, ActiveRun>,
}

impl ActiveRuns {
    fn insert(&self, run_id: RunId, active: ActiveRun) {
        self.runs.insert(run_id, active);
    }

    fn get(&self, run_id: RunId) -> Option<ActiveRun> {
        self.runs.get(&run_id).map(|entry| entry.value().clone())
    }

    fn remove(&self, run_id: RunId) {
        self.runs.remove(&run_id);
    }

    pub fn cancel(&self, run_id: RunId) -> CancelOutcome {
        match self.runs.get(&run_id) {
            Some(entry) => {
                entry.token.cancel();
                CancelOutcome::Signaled
            }
            None => CancelOutcome::NotActive,
        }
    }

    /// Cancel everything. Returns how many runs were signaled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.runs.iter() {
            entry.token.cancel();
            count += 1;
        }
        count
    }

    pub fn contains(&self, run_id: RunId) -> bool {
        self.runs.contains_key(&run_id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

// ── Engine ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PipelineEngine {
    store: Arc<dyn RunStore>,
    broadcaster: Arc<EventBroadcaster>,
    clients: Arc<dyn ClientDirectory>,
    executors: Arc<ExecutorMap>,
    executor_settings: Arc<ExecutorSettings>,
    active: Arc<ActiveRuns>,
    decisions: Arc<tokio::sync::Mutex<()>>,
    settings: EngineSettings,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        broadcaster: Arc<EventBroadcaster>,
        clients: Arc<dyn ClientDirectory>,
        executor_settings: ExecutorSettings,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            broadcaster,
            clients,
            executors: Arc::new(default_executors()),
            executor_settings: Arc::new(executor_settings),
            active: Arc::new(ActiveRuns::default()),
            decisions: Arc::new(tokio::sync::Mutex::new(())),
            settings,
        }
    }

    /// Build an engine from resolved configuration.
    pub fn from_config(toml: &StudioToml, store: Arc<dyn RunStore>) -> Self {
        let settings = EngineSettings::from(&toml.pipeline);
        let executor_settings = ExecutorSettings {
            tools: toml.tools.clone(),
            paths: toml.paths.clone(),
            fallback: toml.pipeline.fallback,
            runner: ProcessRunner::new(settings.kill_grace),
        };
        Self::new(
            store,
            Arc::new(EventBroadcaster::new()),
            Arc::new(StaticClientDirectory::new(toml.clients.clone())),
            executor_settings,
            settings,
        )
    }

    /// Replace the executor set.
    pub fn with_executors(mut self, executors: ExecutorMap) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn clients(&self) -> &Arc<dyn ClientDirectory> {
        &self.clients
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.active
    }

    /// Create a run and start its pipeline in the background.
    pub async fn create_run(
        &self,
        client_id: &str,
        mode: &str,
        inputs: RunInputs,
    ) -> Result<RunRecord, OrchestratorError> {
        let run = self.prepare_run(client_id, mode, inputs).await?;
        self.start(run.run_id);
        Ok(run)
    }

    /// Validate, persist and register a `ready` run without starting it.
    pub async fn prepare_run(
        &self,
        client_id: &str,
        mode: &str,
        inputs: RunInputs,
    ) -> Result<RunRecord, OrchestratorError> {
        let mode: RunMode = mode.parse()?;
        registry::validate_inputs(&inputs).map_err(OrchestratorError::InvalidInputs)?;
        if self.clients.get(client_id).await?.is_none() {
            return Err(OrchestratorError::ClientNotFound {
                id: client_id.to_string(),
            });
        }

        let run = RunRecord::new(client_id, mode, registry::stages_for(mode), inputs);
        let run = self.store.upsert(run).await?;
        self.register(run.clone());
        info!(run_id = %run.run_id, client_id, mode = %mode, "run created");
        Ok(run)
    }

    fn register(&self, run: RunRecord) {
        let run_id = run.run_id;
        self.broadcaster.seed(&run);
        let live = Arc::new(LiveRun::new(
            run,
            Arc::clone(&self.store),
            Arc::clone(&self.broadcaster),
            self.settings.log_limit,
        ));
        self.active.insert(
            run_id,
            ActiveRun {
                token: CancellationToken::new(),
                live,
            },
        );
    }

    /// Spawn the pipeline task for a registered run.
    pub fn start(&self, run_id: RunId) -> Option<JoinHandle<()>> {
        let active = self.active.get(run_id)?;
        let engine = self.clone();
        Some(tokio::spawn(async move {
            engine.drive(active.live, active.token).await;
        }))
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        self.store
            .get(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: run_id })
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, OrchestratorError> {
        Ok(self.store.list().await?)
    }

    /// Signal cancellation. Returns immediately.
    pub fn cancel(&self, run_id: RunId) -> CancelOutcome {
        let outcome = self.active.cancel(run_id);
        info!(run_id = %run_id, ?outcome, "cancel requested");
        outcome
    }

    /// Cancel and wait (up to the configured bound) for the run to settle.
    /// Returns the run as stored afterwards.
    ///
    /// A run that finishes its last stage before noticing the cancel parks in
    /// `needs_review`, which also ends the wait.
    pub async fn cancel_and_wait(&self, run_id: RunId) -> Result<RunRecord, OrchestratorError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let settled = |status: RunStatus| status.is_terminal() || status == RunStatus::NeedsReview;
        let mut subscription = self.broadcaster.subscribe(run_id, run);
        if self.cancel(run_id) == CancelOutcome::Signaled && !settled(subscription.snapshot.status) {
            let wait = async {
                while let Some(event) = subscription.receiver.recv().await {
                    if matches!(&event, RunEvent::Status(change) if settled(change.status)) {
                        break;
                    }
                }
            };
            if tokio::time::timeout(self.settings.cancel_wait, wait).await.is_err() {
                warn!(run_id = %run_id, "run did not settle within the cancel wait");
            }
        }
        self.get_run(run_id).await
    }

    /// Resolve a run parked in `needs_review`.
    pub async fn decide_review(
        &self,
        run_id: RunId,
        decision: ReviewDecision,
        notes: Option<String>,
    ) -> Result<RunRecord, OrchestratorError> {
        let _guard = self.decisions.lock().await;
        let mut run = self.get_run(run_id).await?;
        let target = match decision {
            ReviewDecision::Approve => RunStatus::Complete,
            ReviewDecision::Reject => RunStatus::Blocked,
        };
        if run.status != RunStatus::NeedsReview {
            return Err(OrchestratorError::InvalidTransition {
                id: run_id,
                from: run.status,
                to: target,
            });
        }

        let limit = self.settings.log_limit;
        let mut events = Vec::new();
        let review = run.review_state.get_or_insert_with(|| ReviewState::new(true));
        review.status = match decision {
            ReviewDecision::Approve => ReviewStatus::Approved,
            ReviewDecision::Reject => ReviewStatus::Rejected,
        };
        review.notes = notes.clone();
        review.updated_at = Utc::now();
        events.push(RunEvent::Review(review.clone()));

        match decision {
            ReviewDecision::Approve => {
                push_log(&mut run, limit, SYSTEM_STAGE, LogLevel::Info, "Review approved", &mut events);
                self.export_after_approval(&mut run, &mut events).await;
            }
            ReviewDecision::Reject => {
                let reason = match notes.as_deref() {
                    Some(n) if !n.trim().is_empty() => format!("Rejected in review: {}", n.trim()),
                    _ => "Rejected in review".to_string(),
                };
                push_log(&mut run, limit, SYSTEM_STAGE, LogLevel::Warn, reason.clone(), &mut events);
                run.error = Some(reason);
            }
        }
        set_status(&mut run, target, &mut events);
        run.touch();

        let run = self.store.upsert(run).await?;
        for event in events {
            self.broadcaster.publish(&run, event);
        }
        info!(run_id = %run_id, ?decision, "review decided");
        Ok(run)
    }

    /// Write the export held back by the review gate, if there is one.
    /// An export deselected with `skipStages` stays skipped.
    async fn export_after_approval(&self, run: &mut RunRecord, events: &mut Vec<RunEvent>) {
        if !registry::is_selected(StageId::Export, &run.inputs) {
            return;
        }
        let Some(index) = run.stages.iter().position(|s| {
            s.id == StageId::Export
                && s.status == StageStatus::Skipped
                && s.message.as_deref() == Some(HELD_FOR_REVIEW)
        }) else {
            return;
        };

        // The package describes the run as it is about to be stored.
        let mut settled = run.clone();
        settled.status = RunStatus::Complete;
        settled.stages[index].status = StageStatus::Completed;
        let limit = self.settings.log_limit;
        match write_export(&settled, &self.executor_settings.paths.output_root).await {
            Ok(artifact) => {
                push_log(
                    run,
                    limit,
                    registry::EXPORT.label,
                    LogLevel::Info,
                    format!("Exported run summary to {}", artifact.path),
                    events,
                );
                push_artifact(run, artifact, events);
                run.stages[index].status = StageStatus::Completed;
                run.stages[index].message = Some("Export package written after approval".to_string());
                run.stages[index].ended_at = Some(Utc::now());
                events.push(RunEvent::Stage(run.stages[index].clone()));
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "export after approval failed");
                push_log(
                    run,
                    limit,
                    registry::EXPORT.label,
                    LogLevel::Warn,
                    format!("Export after approval failed: {:#}", e),
                    events,
                );
            }
        }
    }

    /// Write an export package out of band. The run's status is unchanged.
    pub async fn force_export(&self, run_id: RunId) -> Result<Artifact, OrchestratorError> {
        let _guard = self.decisions.lock().await;
        let output_root = &self.executor_settings.paths.output_root;

        if let Some(active) = self.active.get(run_id) {
            let snapshot = active.live.snapshot().await;
            let artifact = write_export(&snapshot, output_root).await?;
            let recorded = artifact.clone();
            active
                .live
                .update(move |run, limit| {
                    let mut events = Vec::new();
                    push_log(run, limit, SYSTEM_STAGE, LogLevel::Info, "Forced export written", &mut events);
                    push_artifact(run, recorded, &mut events);
                    events
                })
                .await
                .map_err(|message| OrchestratorError::Other(anyhow::anyhow!(message)))?;
            return Ok(artifact);
        }

        let mut run = self.get_run(run_id).await?;
        let artifact = write_export(&run, output_root).await?;
        let mut events = Vec::new();
        push_log(
            &mut run,
            self.settings.log_limit,
            SYSTEM_STAGE,
            LogLevel::Info,
            "Forced export written",
            &mut events,
        );
        push_artifact(&mut run, artifact.clone(), &mut events);
        run.touch();
        let run = self.store.upsert(run).await?;
        for event in events {
            self.broadcaster.publish(&run, event);
        }
        Ok(artifact)
    }

    /// Reconcile persisted state after a restart.
    ///
    /// Runs left `running` lost their processes with the previous
    /// orchestrator and are blocked; runs still `ready` are started.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();
        let limit = self.settings.log_limit;

        for mut run in self.store.list_by_status(&[RunStatus::Running]).await? {
            if self.active.contains(run.run_id) {
                continue;
            }
            let message = "Interrupted: orchestrator restarted";
            let mut events = Vec::new();
            for stage in run.stages.iter_mut().filter(|s| s.status == StageStatus::Running) {
                stage.finish(StageStatus::Blocked, Some(message.to_string()));
            }
            push_log(&mut run, limit, SYSTEM_STAGE, LogLevel::Warn, message, &mut events);
            run.error = Some(message.to_string());
            set_status(&mut run, RunStatus::Blocked, &mut events);
            run.touch();
            let run = self.store.upsert(run).await?;
            warn!(run_id = %run.run_id, "marked interrupted run as blocked");
            report.interrupted.push(run.run_id);
        }

        let mut ready = self.store.list_by_status(&[RunStatus::Ready]).await?;
        // Oldest first, so restarted runs keep their creation order.
        ready.reverse();
        for run in ready {
            let run_id = run.run_id;
            if self.active.contains(run_id) {
                continue;
            }
            self.register(run);
            self.start(run_id);
            info!(run_id = %run_id, "restarted ready run");
            report.restarted.push(run_id);
        }

        Ok(report)
    }

    /// Cancel every active run and wait briefly for them to settle.
    pub async fn shutdown(&self) {
        let count = self.active.cancel_all();
        if count == 0 {
            return;
        }
        info!(count, "canceling active runs for shutdown");
        let deadline = tokio::time::Instant::now() + self.settings.kill_grace + Duration::from_secs(2);
        while !self.active.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.active.is_empty() {
            warn!(remaining = self.active.len(), "runs still active at shutdown");
        }
    }

    // ── Pipeline task ────────────────────────────────────────────────

    async fn drive(&self, live: Arc<LiveRun>, token: CancellationToken) {
        let run_id = live.run_id;
        if let Err(message) = self.walk(&live, &token).await {
            self.fail_persistence(&live, &message).await;
        }
        self.active.remove(run_id);
    }

    async fn walk(&self, live: &Arc<LiveRun>, token: &CancellationToken) -> Result<(), String> {
        let snapshot = live.snapshot().await;
        let run_id = snapshot.run_id;

        if token.is_cancelled() {
            live.update(|run, limit| {
                let mut events = Vec::new();
                push_log(run, limit, SYSTEM_STAGE, LogLevel::Warn, "Run canceled before start", &mut events);
                run.error = Some("Canceled".to_string());
                set_status(run, RunStatus::Canceled, &mut events);
                events
            })
            .await?;
            info!(run_id = %run_id, "run canceled before start");
            return Ok(());
        }

        let client = match self.clients.get(&snapshot.client_id).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                let reason = format!("Client {} not found", snapshot.client_id);
                return self.block_before_start(live, reason).await;
            }
            Err(e) => {
                let reason = format!("Client directory unavailable: {:#}", e);
                return self.block_before_start(live, reason).await;
            }
        };

        let mode = snapshot.mode;
        live.update(move |run, limit| {
            let mut events = Vec::new();
            set_status(run, RunStatus::Running, &mut events);
            push_log(
                run,
                limit,
                SYSTEM_STAGE,
                LogLevel::Info,
                format!("Run started in {} mode", mode),
                &mut events,
            );
            events
        })
        .await?;
        info!(run_id = %run_id, mode = %mode, "run started");

        for index in 0..snapshot.stages.len() {
            if token.is_cancelled() {
                live.update(|run, limit| {
                    let mut events = Vec::new();
                    push_log(run, limit, SYSTEM_STAGE, LogLevel::Warn, "Run canceled", &mut events);
                    run.error = Some("Canceled".to_string());
                    set_status(run, RunStatus::Canceled, &mut events);
                    events
                })
                .await?;
                info!(run_id = %run_id, "run canceled between stages");
                return Ok(());
            }

            let def = registry::definition(snapshot.stages[index].id);
            if !registry::is_selected(def.id, &snapshot.inputs) {
                live.update(move |run, limit| {
                    let mut events = Vec::new();
                    run.stages[index].finish(StageStatus::Skipped, Some("Not selected for this run".to_string()));
                    events.push(RunEvent::Stage(run.stages[index].clone()));
                    push_log(run, limit, def.label, LogLevel::Info, format!("{} skipped", def.label), &mut events);
                    events
                })
                .await?;
                continue;
            }

            let Some(executor) = self.executors.get(&def.id).cloned() else {
                let report = StageReport::failed(format!("No executor registered for {}", def.label));
                self.finish_stage(live, index, report, token).await?;
                return Ok(());
            };

            let current = live
                .update(move |run, limit| {
                    let mut events = Vec::new();
                    run.stages[index].start();
                    events.push(RunEvent::Stage(run.stages[index].clone()));
                    push_log(run, limit, def.label, LogLevel::Info, format!("{} started", def.label), &mut events);
                    events
                })
                .await?;

            let cancel = token.child_token();
            let ctx = StageContext {
                run: current,
                client: client.clone(),
                stage: def,
                logger: Arc::new(StageLogger {
                    live: Arc::clone(live),
                    stage: def.label,
                    cancel: cancel.clone(),
                }),
                cancel,
                settings: Arc::clone(&self.executor_settings),
            };
            let report = self.run_stage(executor.as_ref(), &ctx).await;
            if let Some(message) = live.persistence_failure() {
                return Err(message);
            }

            let outcome = report.outcome;
            self.finish_stage(live, index, report, token).await?;
            if matches!(outcome, StageOutcome::Failed | StageOutcome::Canceled) {
                return Ok(());
            }
        }

        let finished = live
            .update(|run, limit| {
                let mut events = Vec::new();
                if run.review_blocking() {
                    push_log(run, limit, SYSTEM_STAGE, LogLevel::Info, "Awaiting human review", &mut events);
                    set_status(run, RunStatus::NeedsReview, &mut events);
                } else {
                    push_log(run, limit, SYSTEM_STAGE, LogLevel::Info, "Run complete", &mut events);
                    set_status(run, RunStatus::Complete, &mut events);
                }
                events
            })
            .await?;
        info!(run_id = %run_id, status = %finished.status, "run finished");
        Ok(())
    }

    async fn block_before_start(&self, live: &LiveRun, reason: String) -> Result<(), String> {
        warn!(run_id = %live.run_id, %reason, "run blocked before start");
        live.update(move |run, limit| {
            let mut events = Vec::new();
            push_log(run, limit, SYSTEM_STAGE, LogLevel::Error, reason.clone(), &mut events);
            run.error = Some(reason);
            set_status(run, RunStatus::Blocked, &mut events);
            events
        })
        .await
        .map(|_| ())
    }

    /// Invoke the executor, enforcing the stage timeout when one is set.
    async fn run_stage(&self, executor: &dyn StageExecutor, ctx: &StageContext) -> StageReport {
        let execution = executor.execute(ctx);
        let result = match self.settings.stage_timeout {
            None => execution.await,
            Some(limit) => {
                tokio::pin!(execution);
                tokio::select! {
                    result = &mut execution => result,
                    _ = tokio::time::sleep(limit) => {
                        let message = format!("Timed out after {}", format_duration(limit));
                        ctx.log(LogLevel::Error, message.clone()).await;
                        ctx.cancel.cancel();
                        // Let the executor reap its process before moving on.
                        let _ = execution.await;
                        return StageReport::failed(message);
                    }
                }
            }
        };
        result.unwrap_or_else(|e| {
            warn!(run_id = %ctx.run.run_id, stage = ctx.stage.label, error = %e, "executor error");
            StageReport::failed(format!("{:#}", e))
        })
    }

    async fn finish_stage(
        &self,
        live: &LiveRun,
        index: usize,
        report: StageReport,
        token: &CancellationToken,
    ) -> Result<(), String> {
        let run_id = live.run_id;
        // A failure produced by cancellation is a cancellation.
        let outcome = match report.outcome {
            StageOutcome::Failed if token.is_cancelled() => StageOutcome::Canceled,
            other => other,
        };

        live.update(move |run, limit| {
            let mut events = Vec::new();
            let label = run.stages[index].label.clone();
            for artifact in report.artifacts {
                push_artifact(run, artifact, &mut events);
            }
            if let Some(required) = report.review_required {
                apply_review(run, required, &mut events);
            }

            match outcome {
                StageOutcome::Completed => {
                    run.stages[index].finish(StageStatus::Completed, report.message);
                    events.push(RunEvent::Stage(run.stages[index].clone()));
                    push_log(run, limit, &label, LogLevel::Info, format!("{} completed", label), &mut events);
                }
                StageOutcome::Skipped => {
                    let note = report.message.clone().unwrap_or_else(|| "skipped".to_string());
                    run.stages[index].finish(StageStatus::Skipped, report.message);
                    events.push(RunEvent::Stage(run.stages[index].clone()));
                    push_log(run, limit, &label, LogLevel::Info, format!("{} skipped: {}", label, note), &mut events);
                }
                StageOutcome::Failed => {
                    let message = report.message.unwrap_or_else(|| format!("{} failed", label));
                    run.stages[index].finish(StageStatus::Blocked, Some(message.clone()));
                    events.push(RunEvent::Stage(run.stages[index].clone()));
                    push_log(run, limit, &label, LogLevel::Error, format!("{} failed: {}", label, message), &mut events);
                    run.error = Some(message);
                    set_status(run, RunStatus::Blocked, &mut events);
                }
                StageOutcome::Canceled => {
                    run.stages[index].finish(StageStatus::Blocked, Some("Canceled".to_string()));
                    events.push(RunEvent::Stage(run.stages[index].clone()));
                    push_log(run, limit, SYSTEM_STAGE, LogLevel::Warn, "Run canceled", &mut events);
                    run.error = Some("Canceled".to_string());
                    set_status(run, RunStatus::Canceled, &mut events);
                }
            }
            events
        })
        .await?;

        match outcome {
            StageOutcome::Failed => warn!(run_id = %run_id, index, "stage failed, run blocked"),
            StageOutcome::Canceled => info!(run_id = %run_id, index, "run canceled during stage"),
            _ => {}
        }
        Ok(())
    }

    /// Surface a persistence failure: block the current stage and the run,
    /// publish that, and make one last attempt to record it.
    async fn fail_persistence(&self, live: &LiveRun, message: &str) {
        error!(run_id = %live.run_id, %message, "run halted on persistence failure");
        let mut run = live.record.lock().await;
        let mut events = Vec::new();

        if let Some(stage) = run.stages.iter_mut().find(|s| s.status == StageStatus::Running) {
            stage.finish(StageStatus::Blocked, Some(message.to_string()));
            events.push(RunEvent::Stage(stage.clone()));
        }
        push_log(
            &mut run,
            self.settings.log_limit,
            SYSTEM_STAGE,
            LogLevel::Error,
            message.to_string(),
            &mut events,
        );
        run.error = Some(message.to_string());
        if run.status.can_transition_to(RunStatus::Blocked) {
            set_status(&mut run, RunStatus::Blocked, &mut events);
        } else {
            // The in-memory status was never persisted or published.
            run.status = RunStatus::Blocked;
            run.ended_at.get_or_insert_with(Utc::now);
            run.touch();
            events.push(RunEvent::Status(StatusChange::of(&run)));
        }

        for event in events {
            self.broadcaster.publish(&run, event);
        }
        if let Err(e) = self.store.upsert(run.clone()).await {
            error!(run_id = %live.run_id, error = %e, "could not record persistence failure");
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}
