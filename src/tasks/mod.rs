//! Background task registry.
//!
//! [`TaskManager::create_task`] spawns a future on the tokio runtime and
//! returns its id at once; the caller polls [`TaskManager::get_status`]
//! instead of awaiting the work. Each status moves through
//! `pending -> running -> completed | failed` exactly once.
//!
//! Terminal statuses are kept for a retention window so late pollers can
//! still read the outcome, then removed by a periodic reaper started with
//! [`TaskManager::start`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::telemetry;

/// Identifier of a submitted task (UUID v4).
pub type TaskId = Uuid;

/// Error recorded for a task stopped by [`TaskManager::cancel`] or
/// [`TaskManager::shutdown`].
pub const CANCELLED_ERROR: &str = "task cancelled";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Whether the task has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Observable state of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus<T> {
    pub id: TaskId,
    pub status: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Percent complete in `[0, 100]`. Set to 100 when the task finishes.
    pub progress: f32,
    pub result: Option<T>,
    pub error: Option<String>,
}

impl<T> TaskStatus<T> {
    fn pending(id: TaskId) -> Self {
        Self {
            id,
            status: TaskState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            result: None,
            error: None,
        }
    }
}

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// How often the reaper sweeps. Default: 5 minutes.
    pub reap_interval: Duration,
    /// How long a terminal status is kept. Default: 1 hour.
    pub retention: Duration,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(300),
            retention: Duration::from_secs(3600),
        }
    }
}

impl TaskManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the reaper sweeps.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// How long a terminal status is kept before the reaper removes it.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

struct Registry<T> {
    config: TaskManagerConfig,
    statuses: DashMap<TaskId, TaskStatus<T>>,
    in_flight: DashMap<TaskId, CancellationToken>,
}

impl<T> Registry<T> {
    fn mark_running(&self, id: TaskId) {
        if let Some(mut status) = self.statuses.get_mut(&id) {
            status.status = TaskState::Running;
            status.started_at = Some(Utc::now());
        }
    }

    fn finish(&self, id: TaskId, outcome: std::result::Result<T, String>) {
        self.in_flight.remove(&id);
        let Some(mut status) = self.statuses.get_mut(&id) else {
            return;
        };
        status.completed_at = Some(Utc::now());
        status.progress = 100.0;
        match outcome {
            Ok(value) => {
                status.status = TaskState::Completed;
                status.result = Some(value);
                debug!(task = %id, "task completed");
            }
            Err(error) => {
                status.status = TaskState::Failed;
                warn!(task = %id, error = %error, "task failed");
                status.error = Some(error);
            }
        }
        let label = if status.status == TaskState::Completed {
            "completed"
        } else {
            "failed"
        };
        metrics::counter!(telemetry::TASKS_TOTAL, "status" => label).increment(1);
    }

    /// Remove terminal statuses that finished more than `retention` before `now`.
    fn reap_at(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::TimeDelta::from_std(self.config.retention).unwrap_or(chrono::TimeDelta::MAX);
        let before = self.statuses.len();
        self.statuses.retain(|_, status| {
            let expired = status.status.is_terminal()
                && status
                    .completed_at
                    .is_some_and(|done| now.signed_duration_since(done) > retention);
            !expired
        });
        let removed = before.saturating_sub(self.statuses.len());
        if removed > 0 {
            metrics::counter!(telemetry::TASKS_REAPED_TOTAL).increment(removed as u64);
        }
        removed
    }
}

struct Reaper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of fire-and-forget tasks producing `T`.
///
/// Every task runs under a child of one manager-wide token, so
/// [`shutdown`](Self::shutdown) reaches tasks created at any point.
pub struct TaskManager<T> {
    registry: Arc<Registry<T>>,
    reaper: Mutex<Option<Reaper>>,
    root: Mutex<CancellationToken>,
}

impl<T> TaskManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: TaskManagerConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                config,
                statuses: DashMap::new(),
                in_flight: DashMap::new(),
            }),
            reaper: Mutex::new(None),
            root: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.registry.config
    }

    /// Register `work` and spawn it. Returns without waiting for it to start.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn create_task<F>(&self, work: F) -> TaskId
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let token = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token();
        self.registry.statuses.insert(id, TaskStatus::pending(id));
        self.registry.in_flight.insert(id, token.clone());

        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            registry.mark_running(id);
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(CANCELLED_ERROR.to_owned()),
                result = work => result.map_err(|e| e.to_string()),
            };
            registry.finish(id, outcome);
        });

        debug!(task = %id, "task created");
        id
    }

    pub fn get_status(&self, id: TaskId) -> Option<TaskStatus<T>> {
        self.registry.statuses.get(&id).map(|s| s.clone())
    }

    pub fn get_all_statuses(&self) -> HashMap<TaskId, TaskStatus<T>> {
        self.registry
            .statuses
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Cancel one in-flight task. Returns `false` if it is unknown or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.registry.in_flight.get(&id) {
            Some(token) => {
                token.cancel();
                info!(task = %id, "task cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Report progress for a task that has not finished yet, clamped to
    /// `[0, 100]`. Returns `false` for unknown or finished tasks and NaN.
    pub fn set_progress(&self, id: TaskId, progress: f32) -> bool {
        if progress.is_nan() {
            return false;
        }
        match self.registry.statuses.get_mut(&id) {
            Some(mut status) if !status.status.is_terminal() => {
                status.progress = progress.clamp(0.0, 100.0);
                true
            }
            _ => false,
        }
    }

    /// Run one reaper sweep now. Returns how many statuses were removed.
    pub fn reap_now(&self) -> usize {
        self.registry.reap_at(Utc::now())
    }

    /// Start the periodic reaper. Calling it again while running does nothing.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn start(&self) {
        let mut slot = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            debug!("task reaper already running");
            return;
        }

        let token = CancellationToken::new();
        let registry = Arc::clone(&self.registry);
        let interval = registry.config.reap_interval;
        let stop = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let removed = registry.reap_at(Utc::now());
                if removed > 0 {
                    info!(removed, remaining = registry.statuses.len(), "reaped finished tasks");
                }
            }
            debug!("task reaper stopped");
        });

        info!(interval_secs = interval.as_secs(), "task reaper started");
        *slot = Some(Reaper { token, handle });
    }

    /// Stop the reaper and wait for it to exit. In-flight tasks keep running.
    pub async fn stop(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Reaper { token, handle }) = reaper {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "task reaper ended abnormally");
            }
        }
    }

    /// Stop the reaper and cancel every in-flight task.
    ///
    /// Tasks created afterwards run under a fresh root token.
    pub async fn shutdown(&self) {
        self.stop().await;
        let cancelled = self.registry.in_flight.len();
        let root = std::mem::replace(
            &mut *self.root.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        root.cancel();
        info!(cancelled, "task manager shut down");
    }
}

impl<T> Drop for TaskManager<T> {
    fn drop(&mut self) {
        let reaper = self
            .reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.token.cancel();
        }
    }
}

impl<T> Default for TaskManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(TaskManagerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry<u32> {
        Registry {
            config: TaskManagerConfig::new().retention(Duration::from_secs(3600)),
            statuses: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    #[test]
    fn finish_sets_terminal_fields() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.statuses.insert(id, TaskStatus::pending(id));
        registry.mark_running(id);
        registry.finish(id, Err("boom".into()));

        let status = registry.statuses.get(&id).unwrap();
        assert_eq!(status.status, TaskState::Failed);
        assert_eq!(status.progress, 100.0);
        assert_eq!(status.error.as_deref(), Some("boom"));
        assert!(status.started_at.is_some());
        assert!(status.completed_at.is_some());
    }

    #[test]
    fn reap_keeps_young_and_unfinished() {
        let registry = registry();
        let (old, young, running) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        for id in [old, young, running] {
            registry.statuses.insert(id, TaskStatus::pending(id));
        }
        registry.finish(old, Ok(1));
        registry.finish(young, Ok(2));
        registry.mark_running(running);
        registry.statuses.get_mut(&old).unwrap().completed_at =
            Some(Utc::now() - chrono::TimeDelta::hours(2));

        assert_eq!(registry.reap_at(Utc::now()), 1);
        assert!(!registry.statuses.contains_key(&old));
        assert!(registry.statuses.contains_key(&young));
        assert!(registry.statuses.contains_key(&running));
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskState::Completed).unwrap(),
            "\"completed\""
        );
    }
}
