//! Async operation runner
//!
//! Wraps units of work with timeout, fixed-delay retry and completion
//! callbacks, and provides single-flight execution for registered
//! operations. Every attempt is spawned onto the tokio runtime: a timeout
//! abandons the caller's wait, the work itself keeps running.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{OperationError, Payload, RuntimeError};

/// Future produced by one invocation of a unit of work.
pub type WorkFuture<T = Payload> = BoxFuture<'static, Result<T, RuntimeError>>;

/// Re-invocable unit of work. Retries call it once per attempt.
pub type WorkFn<T = Payload> = Arc<dyn Fn() -> WorkFuture<T> + Send + Sync>;

pub type SuccessCallback = Arc<dyn Fn(&Payload) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&RuntimeError) + Send + Sync>;
pub type FinallyCallback = Arc<dyn Fn() + Send + Sync>;

type SharedRun = Shared<BoxFuture<'static, Result<Payload, RuntimeError>>>;

/// Wrap an async closure as a [`WorkFn`].
pub fn work_fn<F, Fut>(f: F) -> WorkFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, RuntimeError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Fixed attempt count with a constant delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Timeout and retry settings applied to a unit of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl ExecutionPolicy {
    fn attempts(&self) -> u32 {
        self.retry.map(|r| r.max_attempts.max(1)).unwrap_or(1)
    }
}

/// A named unit of work plus its execution policy and callbacks.
#[derive(Clone)]
pub struct AsyncOperation {
    pub id: String,
    pub name: String,
    pub policy: ExecutionPolicy,
    work: WorkFn,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    on_finally: Option<FinallyCallback>,
}

impl std::fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AsyncOperation {
    pub fn new(id: impl Into<String>, work: WorkFn) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            policy: ExecutionPolicy::default(),
            work,
            on_success: None,
            on_error: None,
            on_finally: None,
        }
    }

    /// Shorthand for `AsyncOperation::new(id, work_fn(f))`.
    pub fn from_fn<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, RuntimeError>> + Send + 'static,
    {
        Self::new(id, work_fn(f))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.policy.retry = Some(retry);
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
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

    /// Replace all three callbacks at once.
    pub fn with_callbacks(
        mut self,
        on_success: Option<SuccessCallback>,
        on_error: Option<ErrorCallback>,
        on_finally: Option<FinallyCallback>,
    ) -> Self {
        self.on_success = on_success;
        self.on_error = on_error;
        self.on_finally = on_finally;
        self
    }
}

/// A failed entry from [`AsyncOperationRunner::run_with_concurrency_detailed`].
#[derive(Debug, Clone)]
pub struct OperationFailure {
    pub index: usize,
    pub name: String,
    pub error: RuntimeError,
}

/// Outcome of a bounded-concurrency batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Success values in submission order.
    pub values: Vec<Payload>,
    pub failures: Vec<OperationFailure>,
}

/// Executes operations and tracks in-flight registered ones.
#[derive(Clone, Default)]
pub struct AsyncOperationRunner {
    operations: Arc<DashMap<String, AsyncOperation>>,
    in_flight: Arc<Mutex<HashMap<String, SharedRun>>>,
}

impl AsyncOperationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an operation for later [`run_by_id`](Self::run_by_id) calls.
    pub fn register(&self, operation: AsyncOperation) {
        let id = operation.id.clone();
        if self.operations.insert(id.clone(), operation).is_some() {
            tracing::debug!("Replaced registered operation {}", id);
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.operations.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<AsyncOperation> {
        self.operations.get(id).map(|entry| entry.value().clone())
    }

    pub fn operation_ids(&self) -> Vec<String> {
        self.operations.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains_key(id)
    }

    /// Run an operation with its policy and callbacks without registering it.
    pub async fn run(&self, operation: &AsyncOperation) -> Result<Payload, RuntimeError> {
        let result =
            execute_with_policy(&operation.name, &operation.policy, operation.work.as_ref()).await;

        match &result {
            Ok(value) => {
                if let Some(callback) = &operation.on_success {
                    guard_callback(&operation.name, "on_success", || callback(value));
                }
            }
            Err(error) => {
                if let Some(callback) = &operation.on_error {
                    guard_callback(&operation.name, "on_error", || callback(error));
                }
            }
        }
        if let Some(callback) = &operation.on_finally {
            guard_callback(&operation.name, "on_finally", || callback());
        }

        result
    }

    /// Run a registered operation. Callers arriving while it is already
    /// executing join that execution and receive the same result.
    pub async fn run_by_id(&self, id: &str) -> Result<Payload, RuntimeError> {
        let shared = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(id) {
                Some(existing) => {
                    tracing::debug!("Joining in-flight operation {}", id);
                    existing.clone()
                }
                None => {
                    let operation = self.get(id).ok_or_else(|| OperationError::NotFound {
                        id: id.to_string(),
                    })?;
                    let runner = self.clone();
                    let key = id.to_string();
                    let run = async move {
                        let _guard = InFlightGuard {
                            in_flight: runner.in_flight.clone(),
                            key,
                        };
                        runner.run(&operation).await
                    }
                    .boxed()
                    .shared();

                    in_flight.insert(id.to_string(), run.clone());
                    // Completes even if every caller stops waiting.
                    tokio::spawn(run.clone());
                    run
                }
            }
        };

        shared.await
    }

    /// Start every operation at once. The first failure to complete rejects
    /// the call while the rest keep running. Results are in submission order.
    pub async fn run_parallel(
        &self,
        operations: Vec<AsyncOperation>,
    ) -> Result<Vec<Payload>, RuntimeError> {
        let mut pending = FuturesUnordered::new();
        for (index, operation) in operations.into_iter().enumerate() {
            let runner = self.clone();
            let handle = tokio::spawn(async move { runner.run(&operation).await });
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<Payload>> = vec![None; pending.len()];
        while let Some((index, joined)) = pending.next().await {
            let value = joined.map_err(|e| RuntimeError::Internal(e.to_string()))??;
            slots[index] = Some(value);
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Payload::Null))
            .collect())
    }

    /// Run in order, stopping at the first failure.
    pub async fn run_sequence(
        &self,
        operations: Vec<AsyncOperation>,
    ) -> Result<Vec<Payload>, RuntimeError> {
        let mut results = Vec::with_capacity(operations.len());
        for operation in &operations {
            results.push(self.run(operation).await?);
        }
        Ok(results)
    }

    /// Drain the list through `limit` workers and return only the successes.
    pub async fn run_with_concurrency(
        &self,
        operations: Vec<AsyncOperation>,
        limit: usize,
    ) -> Vec<Payload> {
        self.run_with_concurrency_detailed(operations, limit)
            .await
            .values
    }

    /// Like [`run_with_concurrency`](Self::run_with_concurrency) but also
    /// reports the failures.
    pub async fn run_with_concurrency_detailed(
        &self,
        operations: Vec<AsyncOperation>,
        limit: usize,
    ) -> BatchOutcome {
        let outcomes: Vec<(usize, String, Result<Payload, RuntimeError>)> =
            stream::iter(operations.into_iter().enumerate())
                .map(|(index, operation)| {
                    let runner = self.clone();
                    async move {
                        let result = runner.run(&operation).await;
                        (index, operation.name, result)
                    }
                })
                .buffered(limit.max(1))
                .collect()
                .await;

        let mut outcome = BatchOutcome::default();
        for (index, name, result) in outcomes {
            match result {
                Ok(value) => outcome.values.push(value),
                Err(error) => {
                    tracing::warn!("Batch operation {} ({}) failed: {}", index, name, error);
                    outcome.failures.push(OperationFailure { index, name, error });
                }
            }
        }
        outcome
    }
}

/// Run `work` under `policy`: each attempt is spawned and optionally raced
/// against a timer; failed attempts are retried after a fixed delay.
///
/// When more than one attempt was allowed and all of them failed, the error
/// is [`OperationError::RetryExhausted`] wrapping the last failure.
/// Non-retryable errors end the loop immediately and are returned as-is.
pub async fn execute_with_policy<T, F>(
    name: &str,
    policy: &ExecutionPolicy,
    work: &F,
) -> Result<T, RuntimeError>
where
    T: Send + 'static,
    F: Fn() -> WorkFuture<T> + ?Sized,
{
    let attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let started = match panic::catch_unwind(AssertUnwindSafe(|| work())) {
            Ok(future) => run_attempt(name, policy.timeout, future).await,
            Err(payload) => Err(panicked(name, payload.as_ref())),
        };
        let error = match started {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!("Operation {} succeeded on attempt {}", name, attempt);
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        if attempt >= attempts {
            if attempts > 1 {
                tracing::warn!("Operation {} failed after {} attempts: {}", name, attempts, error);
                return Err(OperationError::RetryExhausted {
                    name: name.to_string(),
                    attempts,
                    last: Box::new(error),
                }
                .into());
            }
            return Err(error);
        }

        tracing::debug!(
            "Operation {} attempt {}/{} failed: {}",
            name,
            attempt,
            attempts,
            error
        );
        if let Some(retry) = policy.retry {
            tokio::time::sleep(retry.delay).await;
        }
    }
}

async fn run_attempt<T: Send + 'static>(
    name: &str,
    timeout: Option<Duration>,
    work: WorkFuture<T>,
) -> Result<T, RuntimeError> {
    let handle = tokio::spawn(work);

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("Operation {} timed out after {:?}", name, limit);
                return Err(OperationError::Timeout {
                    name: name.to_string(),
                    after: limit,
                }
                .into());
            }
        },
        None => handle.await,
    };

    joined.map_err(|e| {
        RuntimeError::from(OperationError::Panicked {
            name: name.to_string(),
            message: e.to_string(),
        })
    })?
}

/// Removes a single-flight entry however its execution ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<String, SharedRun>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

fn guard_callback(name: &str, kind: &str, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(
            "Operation {} {} callback panicked: {}",
            name,
            kind,
            panic_message(payload.as_ref())
        );
    }
}

fn panicked(name: &str, payload: &(dyn Any + Send)) -> RuntimeError {
    OperationError::Panicked {
        name: name.to_string(),
        message: panic_message(payload),
    }
    .into()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegistryError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_op(id: &str, counter: Arc<AtomicUsize>, delay: Duration) -> AsyncOperation {
        AsyncOperation::from_fn(id, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(json!(n))
            }
        })
    }

    fn failing_op(id: &str, counter: Arc<AtomicUsize>) -> AsyncOperation {
        AsyncOperation::from_fn(id, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::handler("always fails"))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_by_id_is_single_flight() {
        let runner = AsyncOperationRunner::new();
        let counter = Arc::new(AtomicUsize::new(0));
        runner.register(counting_op("refresh", counter.clone(), Duration::from_millis(50)));

        let (a, b) = tokio::join!(runner.run_by_id("refresh"), runner.run_by_id("refresh"));

        assert_eq!(a.unwrap(), json!(1));
        assert_eq!(b.unwrap(), json!(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!runner.is_in_flight("refresh"));

        // A later call starts a fresh execution.
        assert_eq!(runner.run_by_id("refresh").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_run_by_id_unknown() {
        let runner = AsyncOperationRunner::new();
        let err = runner.run_by_id("missing").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Operation(OperationError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_runs_exactly_max_attempts() {
        let runner = AsyncOperationRunner::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let op = failing_op("flaky", counter.clone())
            .with_retry(RetryPolicy::new(4, Duration::from_millis(100)));

        let err = runner.run(&op).await.unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        match &err {
            RuntimeError::Operation(OperationError::RetryExhausted { attempts, .. }) => {
                assert_eq!(*attempts, 4)
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(err.root_cause(), RuntimeError::Handler(m) if m == "always fails"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_success() {
        let runner = AsyncOperationRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let op = AsyncOperation::from_fn("eventually", move || {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RuntimeError::handler("not yet"))
                } else {
                    Ok(json!("ok"))
                }
            }
        })
        .with_retry(RetryPolicy::new(5, Duration::from_millis(10)));

        assert_eq!(runner.run(&op).await.unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_never_retried() {
        let runner = AsyncOperationRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let op = AsyncOperation::from_fn("dispatch", move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(RegistryError::NotFound {
                    name: "nope:missing".to_string(),
                }
                .into())
            }
        })
        .with_retry(RetryPolicy::new(3, Duration::from_millis(10)));

        let err = runner.run(&op).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_but_work_continues() {
        let runner = AsyncOperationRunner::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = finished.clone();
        let op = AsyncOperation::from_fn("slow-quote", move || {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(Payload::Null)
            }
        })
        .with_timeout(Duration::from_millis(100));

        let err = runner.run(&op).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("slow-quote"));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_fire_once() {
        let runner = AsyncOperationRunner::new();
        let successes = Arc::new(AtomicUsize::new(0));
        let finals = Arc::new(AtomicUsize::new(0));
        let (s, f) = (successes.clone(), finals.clone());

        let op = AsyncOperation::from_fn("cb", || async { Ok(json!(1)) })
            .on_success(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(|_| panic!("should not fail"))
            .on_finally(move || {
                f.fetch_add(1, Ordering::SeqCst);
            });

        runner.run(&op).await.unwrap();
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(finals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_is_normalized() {
        let runner = AsyncOperationRunner::new();
        let op = AsyncOperation::from_fn("explodes", || async {
            if true {
                panic!("kaboom");
            }
            Ok(Payload::Null)
        });

        let err = runner.run(&op).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Operation(OperationError::Panicked { ref name, .. }) if name == "explodes"
        ));
    }

    #[tokio::test]
    async fn test_panic_before_future_is_normalized_and_id_recovers() {
        let runner = AsyncOperationRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        runner.register(AsyncOperation::from_fn("refresh", move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("setup failed");
            }
            async { Ok(json!("fresh")) }
        }));

        let err = runner.run_by_id("refresh").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Operation(OperationError::Panicked { ref message, .. })
                if message == "setup failed"
        ));
        assert!(!runner.is_in_flight("refresh"));

        assert_eq!(runner.run_by_id("refresh").await.unwrap(), json!("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_result() {
        let runner = AsyncOperationRunner::new();
        let finals = Arc::new(AtomicUsize::new(0));
        let f = finals.clone();
        runner.register(
            AsyncOperation::from_fn("report", || async { Ok(json!(3)) })
                .on_success(|_| panic!("listener broke"))
                .on_finally(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
        );

        assert_eq!(runner.run_by_id("report").await.unwrap(), json!(3));
        assert_eq!(finals.load(Ordering::SeqCst), 1);
        assert!(!runner.is_in_flight("report"));
        assert_eq!(runner.run_by_id("report").await.unwrap(), json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_parallel_preserves_order() {
        let runner = AsyncOperationRunner::new();
        let ops = vec![
            AsyncOperation::from_fn("a", || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(json!("a"))
            }),
            AsyncOperation::from_fn("b", || async { Ok(json!("b")) }),
            AsyncOperation::from_fn("c", || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!("c"))
            }),
        ];

        let results = runner.run_parallel(ops).await.unwrap();
        assert_eq!(results, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_parallel_first_failure_wins_others_finish() {
        let runner = AsyncOperationRunner::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let done = completed.clone();
        let ops = vec![
            AsyncOperation::from_fn("slow", move || {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("slow"))
                }
            }),
            AsyncOperation::from_fn("broken", || async {
                Err(RuntimeError::handler("broken"))
            }),
        ];

        let err = runner.run_parallel(ops).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Handler(ref m) if m == "broken"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_sequence_stops_at_first_failure() {
        let runner = AsyncOperationRunner::new();
        let third = Arc::new(AtomicUsize::new(0));
        let ops = vec![
            AsyncOperation::from_fn("one", || async { Ok(json!(1)) }),
            AsyncOperation::from_fn("two", || async { Err(RuntimeError::handler("two")) }),
            counting_op("three", third.clone(), Duration::ZERO),
        ];

        assert!(runner.run_sequence(ops).await.is_err());
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_concurrency_bounds_workers() {
        let runner = AsyncOperationRunner::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ops: Vec<_> = (0..6)
            .map(|i| {
                let active = active.clone();
                let peak = peak.clone();
                AsyncOperation::from_fn(format!("job-{i}"), move || {
                    let active = active.clone();
                    let peak = peak.clone();
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        if i == 3 {
                            Err(RuntimeError::handler("job 3 failed"))
                        } else {
                            Ok(json!(i))
                        }
                    }
                })
            })
            .collect();

        let outcome = runner.run_with_concurrency_detailed(ops, 2).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(
            outcome.values,
            vec![json!(0), json!(1), json!(2), json!(4), json!(5)]
        );
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 3);
    }
}
