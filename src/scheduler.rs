//! Cron scheduler for persisted tasks.
//!
//! The scheduler mirrors every active [`ScheduledTask`] row as an in-memory
//! job: one tokio task per job that sleeps until the next cron tick, then
//! spawns a dispatch and goes back to sleep. Each dispatch runs on its own
//! task, so a slow or failing handler never delays the job's next tick or
//! any other job. Runs of the same task may overlap.
//!
//! ```text
//!  init() / reload() / notify_change()
//!        │  (serialized by the job-map lock)
//!        ├── store.list_tasks(active_only) ── error? ── keep current jobs
//!        ├── abort every job
//!        └── register(task) ── cron invalid? ── warn, skip
//!                 │
//!                 ▼
//!        job loop: sleep → spawn(dispatch) → sleep → ...
//!                              │
//!                              ├─ panic? ── logged with task id
//!                              └─ HandlerRegistry::find(task_type)
//!                                     └─ handler.run(task, ctx)
//! ```
//!
//! # Handlers
//!
//! | Task type | Handler |
//! |-----------|---------|
//! | `REPORT_GENERATION` | runs the target report and records a [`ReportRun`] |
//! | `ALERT_CHECK` | logs the check; no alert rules are evaluated yet |
//! | `TEST_TASK` | heartbeat log |
//!
//! Additional task types are added with [`HandlerRegistry::register`].

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cron::CronExpression;
use crate::models::{ReportRun, RunStatus, ScheduledTask};
use crate::pipeline::ReportPipeline;
use crate::store::{now_millis, Store};

// ═══════════════════════════════════════════════════════════════════════
// Handler trait
// ═══════════════════════════════════════════════════════════════════════

/// Everything a handler may touch while running.
pub struct TaskContext {
    pipeline: Arc<ReportPipeline>,
}

impl TaskContext {
    pub fn new(pipeline: Arc<ReportPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<ReportPipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.pipeline.store()
    }
}

/// Work performed when a task of a given type fires.
///
/// Errors are logged by the scheduler with the task id and never stop the
/// job from firing again.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The `task_type` string this handler serves (e.g. `"ALERT_CHECK"`).
    fn task_type(&self) -> &str;

    async fn run(&self, task: &ScheduledTask, ctx: &TaskContext) -> Result<()>;
}

/// Runs the report named by `target_id` and records the outcome.
pub struct ReportGenerationHandler;

#[async_trait]
impl TaskHandler for ReportGenerationHandler {
    fn task_type(&self) -> &str {
        "REPORT_GENERATION"
    }

    async fn run(&self, task: &ScheduledTask, ctx: &TaskContext) -> Result<()> {
        let report_id = match task.target_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => bail!("task {} has no target report", task.id),
        };

        let started_at = now_millis();
        let outcome = ctx.pipeline().run_report(report_id).await;
        let finished_at = now_millis();

        let run = ReportRun {
            id: uuid::Uuid::new_v4().to_string(),
            report_id: report_id.to_string(),
            task_id: Some(task.id.clone()),
            started_at,
            finished_at,
            status: if outcome.is_ok() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            row_count: outcome.as_ref().ok().map(|r| r.rows.len() as i64),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        };
        ctx.store().record_report_run(&run).await?;

        match outcome {
            Ok(result) => {
                tracing::info!(
                    task_id = %task.id,
                    report_id = %report_id,
                    rows = result.rows.len(),
                    "scheduled report generated"
                );
                Ok(())
            }
            Err(e) => Err(anyhow!(e).context(format!("report {} failed", report_id))),
        }
    }
}

pub struct AlertCheckHandler;

#[async_trait]
impl TaskHandler for AlertCheckHandler {
    fn task_type(&self) -> &str {
        "ALERT_CHECK"
    }

    async fn run(&self, task: &ScheduledTask, _ctx: &TaskContext) -> Result<()> {
        tracing::info!(task_id = %task.id, target = ?task.target_id, "alert check");
        Ok(())
    }
}

pub struct TestTaskHandler;

#[async_trait]
impl TaskHandler for TestTaskHandler {
    fn task_type(&self) -> &str {
        "TEST_TASK"
    }

    async fn run(&self, task: &ScheduledTask, _ctx: &TaskContext) -> Result<()> {
        tracing::info!(task_id = %task.id, name = %task.name, "heartbeat");
        Ok(())
    }
}

/// Handlers keyed by task type.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Registry pre-loaded with the report generation, alert check, and
    /// test task handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ReportGenerationHandler));
        registry.register(Box::new(AlertCheckHandler));
        registry.register(Box::new(TestTaskHandler));
        registry
    }

    /// Register a handler. A later handler for the same type shadows earlier ones.
    pub fn register(&mut self, handler: Box<dyn TaskHandler>) {
        self.handlers.push(handler);
    }

    pub fn find(&self, task_type: &str) -> Option<&dyn TaskHandler> {
        self.handlers
            .iter()
            .rev()
            .find(|h| h.task_type() == task_type)
            .map(|h| h.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════

/// Result of one dispatch, for callers that run tasks by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Failed(String),
    /// No handler is registered for the task type.
    Unhandled,
}

/// Public view of a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub task_id: String,
    pub name: String,
    pub task_type: String,
    pub cron_expression: String,
    pub next_fire: Option<DateTime<Utc>>,
}

struct Dispatcher {
    handlers: HandlerRegistry,
    ctx: TaskContext,
}

impl Dispatcher {
    /// Runs the handler on its own task so a panic is reported against
    /// the task id instead of unwinding into the caller.
    async fn dispatch(self: Arc<Self>, task: ScheduledTask) -> DispatchOutcome {
        let task_id = task.id.clone();
        let runner = tokio::spawn(async move { self.run_handler(&task).await });
        match runner.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::error!(task_id = %task_id, panic = %message, "task handler panicked");
                DispatchOutcome::Failed(format!("handler panicked: {}", message))
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "task dispatch cancelled");
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    async fn run_handler(&self, task: &ScheduledTask) -> DispatchOutcome {
        let handler = match self.handlers.find(task.task_type.as_str()) {
            Some(h) => h,
            None => {
                tracing::warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    "no handler for task type, skipping"
                );
                return DispatchOutcome::Unhandled;
            }
        };

        let started = Instant::now();
        match handler.run(task, &self.ctx).await {
            Ok(()) => {
                tracing::debug!(
                    task_id = %task.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                );
                DispatchOutcome::Completed
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!(task_id = %task.id, error = %message, "task failed");
                DispatchOutcome::Failed(message)
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct JobEntry {
    task: ScheduledTask,
    cron: CronExpression,
    handle: JoinHandle<()>,
}

/// Owns the active job set. Create one per process and call
/// [`init`](Scheduler::init) at startup.
pub struct Scheduler {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
    jobs: Mutex<BTreeMap<String, JobEntry>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<ReportPipeline>, handlers: HandlerRegistry) -> Self {
        Self {
            store: pipeline.store().clone(),
            dispatcher: Arc::new(Dispatcher {
                handlers,
                ctx: TaskContext::new(pipeline),
            }),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load and register every active task. Returns the active job count.
    pub async fn init(&self) -> usize {
        let count = self.reload().await;
        tracing::info!(jobs = count, "scheduler initialized");
        count
    }

    /// Rebuild the job set from the store.
    ///
    /// The store is read before any job is stopped. If the read fails the
    /// current jobs keep running and their count is returned.
    pub async fn reload(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let tasks = match self.store.list_tasks(true).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(
                    error = %format!("{:#}", e),
                    kept = jobs.len(),
                    "failed to load scheduled tasks, keeping current jobs"
                );
                return jobs.len();
            }
        };

        for (_, job) in std::mem::take(&mut *jobs) {
            job.handle.abort();
        }
        for task in tasks {
            self.register_locked(&mut jobs, task);
        }
        tracing::debug!(jobs = jobs.len(), "scheduler reloaded");
        jobs.len()
    }

    /// Call after any schedule create, update, or delete.
    pub async fn notify_change(&self) -> usize {
        self.reload().await
    }

    /// Register one task, replacing any job with the same id.
    ///
    /// Returns `false` (and logs) when the cron expression does not parse.
    pub async fn register(&self, task: ScheduledTask) -> bool {
        let mut jobs = self.jobs.lock().await;
        self.register_locked(&mut jobs, task)
    }

    fn register_locked(&self, jobs: &mut BTreeMap<String, JobEntry>, task: ScheduledTask) -> bool {
        let cron = match CronExpression::parse(&task.cron_expression) {
            Ok(cron) => cron,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "skipping task with invalid schedule");
                return false;
            }
        };

        let handle = tokio::spawn(run_job(
            self.dispatcher.clone(),
            task.clone(),
            cron.clone(),
        ));
        tracing::debug!(task_id = %task.id, cron = %cron, "task registered");
        if let Some(previous) = jobs.insert(task.id.clone(), JobEntry { task, cron, handle }) {
            previous.handle.abort();
        }
        true
    }

    /// Ids of registered jobs, sorted.
    pub async fn active_jobs(&self) -> Vec<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    pub async fn active_job_details(&self) -> Vec<ActiveJob> {
        let now = Utc::now();
        self.jobs
            .lock()
            .await
            .values()
            .map(|job| ActiveJob {
                task_id: job.task.id.clone(),
                name: job.task.name.clone(),
                task_type: job.task.task_type.to_string(),
                cron_expression: job.cron.to_string(),
                next_fire: job.cron.next_after(now),
            })
            .collect()
    }

    /// Run a task's handler once, right now.
    pub async fn dispatch(&self, task: &ScheduledTask) -> DispatchOutcome {
        self.dispatcher.clone().dispatch(task.clone()).await
    }

    /// Stop every job. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        let mut jobs = self.jobs.lock().await;
        let count = jobs.len();
        for (_, job) in std::mem::take(&mut *jobs) {
            job.handle.abort();
        }
        tracing::info!(jobs = count, "scheduler stopped");
        count
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for job in self.jobs.get_mut().values() {
            job.handle.abort();
        }
    }
}

async fn run_job(dispatcher: Arc<Dispatcher>, task: ScheduledTask, cron: CronExpression) {
    let mut last_fire = Utc::now();
    loop {
        let from = last_fire.max(Utc::now());
        let next = match cron.next_after(from) {
            Some(next) => next,
            None => {
                tracing::info!(task_id = %task.id, cron = %cron, "schedule has no future fire times");
                return;
            }
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        last_fire = next;

        tokio::spawn(dispatcher.clone().dispatch(task.clone()));
    }
}
