//! Persistent delayed-task executor.
//!
//! Tasks live in the `delayed_tasks` table with caller-chosen ids, so
//! re-scheduling the same id is a no-op and reminders survive restarts.
//! A cron loop polls at `tick_secs` resolution; handlers are looked up in a
//! registry populated at startup. Execution is at-least-once: under the
//! default claim-after-success policy a task is only marked done when its
//! handler returns Ok, so a crash mid-handler retries on the next tick.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use govorun_core::config::{ClaimPolicy, SchedulerConfig};
use govorun_storage::types::DelayedTask;
use govorun_storage::{StorageError, StorageRouter};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No handler registered for '{0}'")]
    UnknownHandler(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// An async task handler. The string error is logged; it never escapes the loop.
pub type TaskHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Named handlers, registered once at startup.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, std::result::Result<(), String>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<TaskHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

pub struct Scheduler {
    router: Arc<StorageRouter>,
    registry: TaskRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(router: Arc<StorageRouter>, registry: TaskRegistry, config: SchedulerConfig) -> Self {
        Self {
            router,
            registry,
            config,
        }
    }

    /// Persist a task. Duplicate ids are an idempotent no-op; the return
    /// value tells whether a new row was created.
    pub fn schedule(
        &self,
        id: &str,
        fire_at: i64,
        function: &str,
        kwargs: serde_json::Value,
    ) -> Result<bool> {
        let created = self.router.schedule_task(
            &DelayedTask {
                id: id.to_string(),
                fire_at,
                function: function.to_string(),
                kwargs,
                is_done: false,
            },
            None,
        )?;
        if created {
            info!(task_id = id, function, fire_at, "delayed task scheduled");
        }
        Ok(created)
    }

    /// Cancel without running: flip `is_done`.
    pub fn cancel(&self, id: &str) -> Result<()> {
        self.router.set_task_done(id, None)?;
        info!(task_id = id, "delayed task canceled");
        Ok(())
    }

    /// One poll pass: run every task whose fire time has arrived.
    /// Errors are contained per task; the pass itself never fails the loop.
    pub async fn tick(&self) {
        let now = chrono::Utc::now().timestamp();
        let due = match self.router.due_tasks(now, None) {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "due-task query failed");
                return;
            }
        };

        for task in due {
            let Some(handler) = self.registry.get(&task.function) else {
                warn!(task_id = %task.id, function = %task.function, "no handler registered; task left undone");
                continue;
            };

            if self.config.claim == ClaimPolicy::BeforeRun {
                if let Err(e) = self.router.set_task_done(&task.id, None) {
                    error!(task_id = %task.id, error = %e, "pre-claim failed; skipping task");
                    continue;
                }
            }

            info!(task_id = %task.id, function = %task.function, "executing delayed task");
            match handler(task.kwargs.clone()).await {
                Ok(()) => {
                    if self.config.claim == ClaimPolicy::AfterSuccess {
                        if let Err(e) = self.router.set_task_done(&task.id, None) {
                            error!(task_id = %task.id, error = %e, "post-success claim failed; task will re-run");
                        }
                    }
                }
                Err(e) => {
                    warn!(task_id = %task.id, function = %task.function, error = %e, "task handler failed");
                }
            }
        }
    }

    /// Cron loop at `tick_secs` resolution until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_secs = self.config.tick_secs, "scheduler started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use govorun_core::config::DatabaseConfig;

    fn open_router(dir: &tempfile::TempDir) -> Arc<StorageRouter> {
        let mut db = DatabaseConfig::default();
        db.sources.get_mut("main").unwrap().path =
            dir.path().join("sched.db").to_string_lossy().into_owned();
        Arc::new(StorageRouter::open(&db).unwrap())
    }

    fn recording_registry(log: Arc<Mutex<Vec<String>>>, fail: bool) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("notify", move |kwargs| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(
                    kwargs
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                );
                if fail {
                    Err("handler exploded".to_string())
                } else {
                    Ok(())
                }
            })
        });
        registry
    }

    #[tokio::test]
    async fn duplicate_schedule_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let router = open_router(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::new(
            Arc::clone(&router),
            recording_registry(Arc::clone(&log), false),
            SchedulerConfig::default(),
        );

        let kwargs = serde_json::json!({ "chat": -100, "text": "hi" });
        assert!(scheduler.schedule("rem-1", 0, "notify", kwargs.clone()).unwrap());
        assert!(!scheduler.schedule("rem-1", 0, "notify", kwargs).unwrap());

        scheduler.tick().await;
        scheduler.tick().await;
        // Exactly one execution despite two schedules and two ticks.
        assert_eq!(log.lock().unwrap().as_slice(), ["hi"]);
        assert!(router.get_task("rem-1", None).unwrap().is_done);
    }

    #[tokio::test]
    async fn future_task_does_not_fire_early() {
        let dir = tempfile::tempdir().unwrap();
        let router = open_router(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::new(
            router,
            recording_registry(Arc::clone(&log), false),
            SchedulerConfig::default(),
        );
        let future = chrono::Utc::now().timestamp() + 3600;
        scheduler
            .schedule("later", future, "notify", serde_json::json!({"text": "x"}))
            .unwrap();
        scheduler.tick().await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_handler_leaves_task_undone_under_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let router = open_router(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::new(
            Arc::clone(&router),
            recording_registry(Arc::clone(&log), true),
            SchedulerConfig::default(),
        );
        scheduler
            .schedule("flaky", 0, "notify", serde_json::json!({"text": "x"}))
            .unwrap();
        scheduler.tick().await;
        assert!(!router.get_task("flaky", None).unwrap().is_done);
        // Next tick retries (at-least-once).
        scheduler.tick().await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn before_run_policy_claims_even_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let router = open_router(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = SchedulerConfig {
            claim: ClaimPolicy::BeforeRun,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(
            Arc::clone(&router),
            recording_registry(Arc::clone(&log), true),
            config,
        );
        scheduler
            .schedule("once", 0, "notify", serde_json::json!({"text": "x"}))
            .unwrap();
        scheduler.tick().await;
        scheduler.tick().await;
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(router.get_task("once", None).unwrap().is_done);
    }

    #[tokio::test]
    async fn unknown_handler_leaves_task_undone() {
        let dir = tempfile::tempdir().unwrap();
        let router = open_router(&dir);
        let scheduler = Scheduler::new(
            Arc::clone(&router),
            TaskRegistry::new(),
            SchedulerConfig::default(),
        );
        scheduler
            .schedule("mystery", 0, "does_not_exist", serde_json::json!({}))
            .unwrap();
        scheduler.tick().await;
        assert!(!router.get_task("mystery", None).unwrap().is_done);
    }

    #[tokio::test]
    async fn cancel_prevents_execution() {
        let dir = tempfile::tempdir().unwrap();
        let router = open_router(&dir);
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::new(
            router,
            recording_registry(Arc::clone(&log), false),
            SchedulerConfig::default(),
        );
        scheduler
            .schedule("nope", 0, "notify", serde_json::json!({"text": "x"}))
            .unwrap();
        scheduler.cancel("nope").unwrap();
        scheduler.tick().await;
        assert!(log.lock().unwrap().is_empty());
    }
}
