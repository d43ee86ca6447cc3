//! Task manager for long-running asynchronous tool calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use shoal_types::{TaskDescriptor, TaskStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::logbuf::sanitize_log_text;

/// Sweep cadence for expired tasks.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Defaults applied when `CreateTask` leaves options out.
const DEFAULT_TTL_MS: u64 = 10 * 60 * 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Options for task creation.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Time-to-live after creation, in milliseconds.
    pub ttl_ms: Option<u64>,
    /// Poll interval hint returned to the caller.
    pub poll_interval_ms: Option<u64>,
    /// Initial status message.
    pub status_message: Option<String>,
}

struct TaskEntry {
    descriptor: Mutex<TaskDescriptor>,
    update_tx: watch::Sender<u64>,
    abort: CancellationToken,
}

impl TaskEntry {
    fn mutate(&self, f: impl FnOnce(&mut TaskDescriptor)) {
        let mut descriptor = self.descriptor.lock().unwrap_or_else(|e| e.into_inner());
        if descriptor.status.is_terminal() {
            return;
        }
        f(&mut descriptor);
        descriptor.last_updated_at = Utc::now();
        drop(descriptor);
        self.update_tx.send_modify(|v| *v += 1);
    }

    fn snapshot(&self) -> TaskDescriptor {
        self.descriptor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// In-memory task store with TTL sweep and owner scoping.
pub struct TaskManager {
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    counter: AtomicU64,
    cancel: CancellationToken,
}

impl TaskManager {
    /// Create a task manager.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            cancel,
        }
    }

    fn next_id(&self) -> String {
        // Monotonic: wall millis plus an in-process counter for same-tick
        // creations.
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{:06}", Utc::now().timestamp_millis(), seq)
    }

    fn get_entry(&self, owner: &str, task_id: &str) -> CoreResult<Arc<TaskEntry>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| CoreError::not_found(format!("task {task_id}")))?;
        // Ownership check doubles as existence hiding.
        if entry.snapshot().owner != owner {
            return Err(CoreError::not_found(format!("task {task_id}")));
        }
        Ok(Arc::clone(entry))
    }

    /// Create a task backed by `runner`. The runner resolves to the result
    /// payload or an error message.
    pub fn create<F>(&self, owner: &str, opts: TaskOptions, runner: F) -> TaskDescriptor
    where
        F: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let task_id = self.next_id();
        let now = Utc::now();
        let descriptor = TaskDescriptor {
            task_id: task_id.clone(),
            owner: owner.to_string(),
            status: TaskStatus::Working,
            status_message: opts.status_message,
            created_at: now,
            last_updated_at: now,
            ttl_ms: opts.ttl_ms.unwrap_or(DEFAULT_TTL_MS),
            poll_interval_ms: opts.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            result: None,
            error: None,
        };
        let (update_tx, _) = watch::channel(0);
        let entry = Arc::new(TaskEntry {
            descriptor: Mutex::new(descriptor.clone()),
            update_tx,
            abort: self.cancel.child_token(),
        });
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.clone(), Arc::clone(&entry));

        let abort = entry.abort.clone();
        let task_entry = Arc::clone(&entry);
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {
                    task_entry.mutate(|d| d.status = TaskStatus::Cancelled);
                }
                outcome = runner => match outcome {
                    Ok(result) => task_entry.mutate(|d| {
                        d.status = TaskStatus::Completed;
                        d.result = Some(result);
                    }),
                    Err(error) => task_entry.mutate(|d| {
                        d.status = TaskStatus::Failed;
                        d.error = Some(sanitize_log_text(&error));
                    }),
                },
            }
        });

        descriptor
    }

    /// Fetch one task, owner-scoped.
    pub fn get(&self, owner: &str, task_id: &str) -> CoreResult<TaskDescriptor> {
        Ok(self.get_entry(owner, task_id)?.snapshot())
    }

    /// Page through the owner's tasks, newest-id order, starting after
    /// `cursor`.
    pub fn list(
        &self,
        owner: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> (Vec<TaskDescriptor>, Option<String>) {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut mine: Vec<TaskDescriptor> = tasks
            .values()
            .map(|e| e.snapshot())
            .filter(|d| d.owner == owner)
            .collect();
        mine.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let start = match cursor {
            Some(cursor) => mine
                .iter()
                .position(|d| d.task_id.as_str() > cursor)
                .unwrap_or(mine.len()),
            None => 0,
        };
        let limit = limit.clamp(1, 500);
        let page: Vec<TaskDescriptor> = mine.into_iter().skip(start).take(limit).collect();
        let next = (page.len() == limit).then(|| page.last().map(|d| d.task_id.clone())).flatten();
        (page, next)
    }

    /// Block until the task reaches a terminal status, or the caller's
    /// context is cancelled.
    pub async fn result(
        &self,
        owner: &str,
        task_id: &str,
        ctx: CancellationToken,
    ) -> CoreResult<TaskDescriptor> {
        let entry = self.get_entry(owner, task_id)?;
        let mut rx = entry.update_tx.subscribe();
        loop {
            let snapshot = entry.snapshot();
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(CoreError::deadline(format!("awaiting task {task_id}")));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(entry.snapshot());
                    }
                }
            }
        }
    }

    /// Cancel a non-terminal task.
    pub fn cancel(&self, owner: &str, task_id: &str) -> CoreResult<TaskDescriptor> {
        let entry = self.get_entry(owner, task_id)?;
        entry.abort.cancel();
        entry.mutate(|d| d.status = TaskStatus::Cancelled);
        Ok(entry.snapshot())
    }

    /// Drop tasks whose TTL elapsed; running ones are cancelled first.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let snapshot = entry.snapshot();
            let expired = now
                .signed_duration_since(snapshot.created_at)
                .num_milliseconds()
                >= snapshot.ttl_ms as i64;
            if expired {
                entry.abort.cancel();
            }
            !expired
        });
        let purged = before - tasks.len();
        if purged > 0 {
            debug!(purged, "purged expired tasks");
        }
        purged
    }

    /// Spawn the TTL sweep.
    pub fn spawn_workers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TaskManager {
        TaskManager::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn create_complete_result() {
        let manager = manager();
        let task = manager.create("cli", TaskOptions::default(), async {
            Ok(serde_json::json!({"answer": 42}))
        });
        let done = manager
            .result("cli", &task.task_id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.unwrap()["answer"], 42);
    }

    #[tokio::test]
    async fn ownership_hides_existence() {
        let manager = manager();
        let task = manager.create("alice", TaskOptions::default(), async {
            Ok(serde_json::Value::Null)
        });
        let err = manager.get("bob", &task.task_id).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_is_absorbing() {
        let manager = manager();
        let task = manager.create("cli", TaskOptions::default(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::Value::Null)
        });
        let cancelled = manager.cancel("cli", &task.task_id).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // A late completion cannot overwrite the terminal status.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let still = manager.get("cli", &task.task_id).unwrap();
        assert_eq!(still.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn ttl_sweep_purges() {
        let manager = manager();
        let task = manager.create(
            "cli",
            TaskOptions {
                ttl_ms: Some(1),
                ..Default::default()
            },
            async { Ok(serde_json::Value::Null) },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.sweep_expired(), 1);
        assert!(manager.get("cli", &task.task_id).is_err());
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let manager = manager();
        let a = manager.create("cli", TaskOptions::default(), async {
            Ok(serde_json::Value::Null)
        });
        let b = manager.create("cli", TaskOptions::default(), async {
            Ok(serde_json::Value::Null)
        });
        assert!(b.task_id > a.task_id);
    }

    #[tokio::test]
    async fn list_pages_by_cursor() {
        let manager = manager();
        for _ in 0..5 {
            manager.create("cli", TaskOptions::default(), async {
                Ok(serde_json::Value::Null)
            });
        }
        let (page1, cursor) = manager.list("cli", None, 2);
        assert_eq!(page1.len(), 2);
        let (page2, _) = manager.list("cli", cursor.as_deref(), 10);
        assert_eq!(page2.len(), 3);
        assert!(page2[0].task_id > page1[1].task_id);
    }
}
