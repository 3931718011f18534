//! Task manager for bounded-concurrency task execution
//!
//! Tasks wait in a priority queue and are admitted while fewer than
//! `max_concurrency` are running. Each admitted task runs through the
//! [`AsyncOperationRunner`] so timeouts and retries behave exactly like any
//! other operation. Running tasks are never preempted.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};

use super::priority_queue::{HasTaskId, PriorityQueue};
use crate::config::TaskManagerConfig;
use crate::operations::{
    work_fn, AsyncOperation, AsyncOperationRunner, ErrorCallback, ExecutionPolicy,
    FinallyCallback, RetryPolicy, SuccessCallback, WorkFn,
};
use crate::types::{OperationError, Payload, Priority, RuntimeError, TaskError, TaskId};

/// Per-task settings
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub name: Option<String>,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    on_finally: Option<FinallyCallback>,
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TaskOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&Payload) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&RuntimeError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_finally(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finally = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Snapshot of a pending or running task
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Result handle for a submitted task
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    receiver: oneshot::Receiver<Result<Payload, RuntimeError>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task's result.
    pub async fn join(self) -> Result<Payload, RuntimeError> {
        let id = self.id;
        self.receiver
            .await
            .unwrap_or_else(|_| Err(TaskError::Dropped { id }.into()))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedTask {
    id: TaskId,
    priority: Priority,
    sequence: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl HasTaskId for QueuedTask {
    fn task_id(&self) -> TaskId {
        self.id
    }
}

struct PendingTask {
    info: TaskInfo,
    operation: AsyncOperation,
    reply: oneshot::Sender<Result<Payload, RuntimeError>>,
}

#[derive(Default)]
struct QueueState {
    queue: PriorityQueue<QueuedTask>,
    pending: HashMap<TaskId, PendingTask>,
    running: HashMap<TaskId, TaskInfo>,
    completed: u64,
    failed: u64,
    next_sequence: u64,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }
}

struct TaskManagerInner {
    state: Mutex<QueueState>,
    max_concurrency: usize,
    default_timeout: Option<Duration>,
    runner: AsyncOperationRunner,
    idle: Notify,
}

/// Bounded-concurrency task queue with priority admission.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<TaskManagerInner>,
}

impl TaskManager {
    pub fn new(config: &TaskManagerConfig, runner: AsyncOperationRunner) -> Self {
        Self {
            inner: Arc::new(TaskManagerInner {
                state: Mutex::new(QueueState::default()),
                max_concurrency: config.max_concurrency.max(1),
                default_timeout: config.default_timeout,
                runner,
                idle: Notify::new(),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Queue a unit of work and return a handle to its result.
    pub fn submit(&self, work: WorkFn, options: TaskOptions) -> TaskHandle {
        let id = TaskId::new();
        let name = options.name.clone().unwrap_or_else(|| format!("task-{id}"));
        let operation = AsyncOperation::new(id.to_string(), work)
            .with_name(name.clone())
            .with_policy(ExecutionPolicy {
                timeout: options.timeout.or(self.inner.default_timeout),
                retry: options.retry,
            })
            .with_callbacks(options.on_success, options.on_error, options.on_finally);

        let (reply, receiver) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.queue.push(QueuedTask {
                id,
                priority: options.priority,
                sequence,
            });
            state.pending.insert(
                id,
                PendingTask {
                    info: TaskInfo {
                        id,
                        name: name.clone(),
                        priority: options.priority,
                        status: TaskStatus::Pending,
                        enqueued_at: Utc::now(),
                        started_at: None,
                    },
                    operation,
                    reply,
                },
            );
        }
        tracing::debug!("Queued task {} ({}) at {} priority", id, name, options.priority);

        self.pump();
        TaskHandle { id, receiver }
    }

    /// Closure form of [`submit`](Self::submit).
    pub fn submit_fn<F, Fut>(&self, f: F, options: TaskOptions) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, RuntimeError>> + Send + 'static,
    {
        self.submit(work_fn(f), options)
    }

    /// Queue a unit of work and wait for its result.
    pub async fn enqueue(
        &self,
        work: WorkFn,
        options: TaskOptions,
    ) -> Result<Payload, RuntimeError> {
        self.submit(work, options).join().await
    }

    /// Drop a task that has not started yet.
    pub fn cancel(&self, id: TaskId) -> bool {
        let cancelled = {
            let mut state = self.inner.state.lock();
            state.queue.remove(&id);
            state.pending.remove(&id)
        };

        match cancelled {
            Some(task) => {
                tracing::info!("Cancelled pending task {} ({})", id, task.info.name);
                let _ = task.reply.send(Err(TaskError::Cancelled { id }.into()));
                self.notify_if_idle();
                true
            }
            None => false,
        }
    }

    pub fn task(&self, id: TaskId) -> Option<TaskInfo> {
        let state = self.inner.state.lock();
        state
            .pending
            .get(&id)
            .map(|task| task.info.clone())
            .or_else(|| state.running.get(&id).cloned())
    }

    pub fn stats(&self) -> TaskStats {
        let state = self.inner.state.lock();
        TaskStats {
            pending: state.pending.len(),
            running: state.running.len(),
            completed: state.completed,
            failed: state.failed,
        }
    }

    /// Resolve once nothing is pending or running.
    pub async fn wait_all(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn pump(&self) {
        loop {
            let task = {
                let mut state = self.inner.state.lock();
                if state.running.len() >= self.inner.max_concurrency {
                    return;
                }
                let Some(queued) = state.queue.pop() else {
                    return;
                };
                let Some(mut task) = state.pending.remove(&queued.id) else {
                    continue;
                };
                task.info.status = TaskStatus::Running;
                task.info.started_at = Some(Utc::now());
                state.running.insert(queued.id, task.info.clone());
                task
            };

            let manager = self.clone();
            tokio::spawn(async move { manager.execute(task).await });
        }
    }

    async fn execute(&self, task: PendingTask) {
        let PendingTask {
            info,
            operation,
            reply,
        } = task;

        // Bookkeeping below must run even if the operation unwinds.
        let runner = self.inner.runner.clone();
        let result = match tokio::spawn(async move { runner.run(&operation).await }).await {
            Ok(result) => result,
            Err(e) => Err(OperationError::Panicked {
                name: info.name.clone(),
                message: e.to_string(),
            }
            .into()),
        };

        {
            let mut state = self.inner.state.lock();
            state.running.remove(&info.id);
            if result.is_ok() {
                state.completed += 1;
            } else {
                state.failed += 1;
            }
        }

        match &result {
            Ok(_) => tracing::debug!("Task {} ({}) completed successfully", info.id, info.name),
            Err(e) => tracing::warn!("Task {} ({}) failed: {}", info.id, info.name, e),
        }

        let _ = reply.send(result);
        self.pump();
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.inner.state.lock().is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn manager(max_concurrency: usize) -> TaskManager {
        let config = TaskManagerConfig {
            max_concurrency,
            ..TaskManagerConfig::default()
        };
        TaskManager::new(&config, AsyncOperationRunner::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let tasks = manager(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let active = active.clone();
            let peak = peak.clone();
            tasks.submit_fn(
                move || {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok(Payload::Null)
                    }
                },
                TaskOptions::default(),
            );
        }

        tasks.wait_all().await;
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
        let stats = tasks.stats();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.pending + stats.running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_admission_order() {
        let tasks = manager(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupies the only slot while the others queue up.
        tasks.submit_fn(
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Payload::Null)
            },
            TaskOptions::named("blocker"),
        );

        for (label, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("critical", Priority::Critical),
            ("normal-2", Priority::Normal),
        ] {
            let order = order.clone();
            tasks.submit_fn(
                move || {
                    let order = order.clone();
                    async move {
                        order.lock().push(label);
                        Ok(Payload::Null)
                    }
                },
                TaskOptions::named(label).with_priority(priority),
            );
        }

        assert_eq!(tasks.stats().pending, 4);
        tasks.wait_all().await;
        assert_eq!(*order.lock(), vec!["critical", "normal", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_enqueue_returns_result_and_counts_failures() {
        let tasks = manager(4);

        let ok = tasks
            .enqueue(work_fn(|| async { Ok(json!(42)) }), TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(ok, json!(42));

        let err = tasks
            .enqueue(
                work_fn(|| async { Err(RuntimeError::handler("bad input")) }),
                TaskOptions::named("failing"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "bad input");

        let stats = tasks.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout() {
        let tasks = manager(1);
        let err = tasks
            .enqueue(
                work_fn(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Payload::Null)
                }),
                TaskOptions::named("sluggish").with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_task() {
        let tasks = manager(1);
        tasks.submit_fn(
            || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Payload::Null)
            },
            TaskOptions::default(),
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let handle = tasks.submit_fn(
            move || {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(Payload::Null)
                }
            },
            TaskOptions::default(),
        );
        let id = handle.id();

        assert_eq!(tasks.task(id).unwrap().status, TaskStatus::Pending);
        assert!(tasks.cancel(id));
        assert!(!tasks.cancel(id));

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Task(TaskError::Cancelled { .. })));

        tasks.wait_all().await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callbacks_run_before_completion_is_visible() {
        let tasks = manager(2);
        let successes = Arc::new(AtomicUsize::new(0));
        let counter = successes.clone();

        tasks.submit_fn(
            || async { Ok(Payload::Null) },
            TaskOptions::default().on_success(move |_| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            }),
        );

        tasks.wait_all().await;
        assert_eq!(successes.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_callback_still_settles_task() {
        let tasks = manager(1);
        let handle = tasks.submit_fn(
            || async { Ok(json!("done")) },
            TaskOptions::named("noisy").on_success(|_| panic!("subscriber broke")),
        );

        assert_eq!(handle.join().await.unwrap(), json!("done"));
        tokio::time::timeout(Duration::from_secs(1), tasks.wait_all())
            .await
            .expect("wait_all should resolve");

        let stats = tasks.stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_wait_all_when_idle() {
        let tasks = manager(1);
        tokio_test::assert_ready!(tokio_test::task::spawn(tasks.wait_all()).poll());
    }
}
