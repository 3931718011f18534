//! Logic points and flow execution
//!
//! A logic point is a named, typed node wrapping a handler. Nodes run under
//! the same timeout/retry engine as async operations and can be chained into
//! sequences or routed through decisions.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::FlowConfig;
use crate::events::{EventBus, RuntimeEvent};
use crate::operations::{execute_with_policy, ExecutionPolicy, RetryPolicy, WorkFuture};
use crate::registry::{CallContext, CapabilityRegistry};
use crate::types::{AsyncNodeId, FlowError, LogicPointId, Payload, RuntimeError};

/// Metadata carried alongside a node's input.
pub type Metadata = serde_json::Map<String, Payload>;

/// Metadata key a decision branch receives the decision output under.
pub const DECISION_RESULT_KEY: &str = "decisionResult";

/// Branch used when no key matches the decision output.
pub const DEFAULT_BRANCH: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicPointType {
    Entry,
    Exit,
    Action,
    Decision,
    Checkpoint,
}

impl std::fmt::Display for LogicPointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogicPointType::Entry => "entry",
            LogicPointType::Exit => "exit",
            LogicPointType::Action => "action",
            LogicPointType::Decision => "decision",
            LogicPointType::Checkpoint => "checkpoint",
        };
        f.write_str(s)
    }
}

/// Per-node execution settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogicPointConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    pub retry_on_failure: bool,
    /// Total attempts when `retry_on_failure` is set
    pub max_retries: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
    /// Output used instead of an error once all attempts failed
    pub fallback: Option<Payload>,
}

impl LogicPointConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry_on_failure = true;
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_fallback(mut self, fallback: Payload) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn policy(&self, defaults: &FlowConfig) -> ExecutionPolicy {
        ExecutionPolicy {
            timeout: self.timeout,
            retry: self.retry_on_failure.then(|| {
                RetryPolicy::new(
                    self.max_retries.unwrap_or(defaults.default_max_retries),
                    self.retry_delay.unwrap_or(defaults.default_retry_delay),
                )
            }),
        }
    }
}

/// Input handed to a logic point handler.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub input: Payload,
    pub metadata: Metadata,
    registry: Option<Arc<CapabilityRegistry>>,
}

impl ExecutionContext {
    pub fn new(input: Payload) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Payload) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_registry(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Dispatch an action from inside a handler.
    pub async fn execute_action(
        &self,
        name: &str,
        input: Payload,
    ) -> Result<Payload, RuntimeError> {
        self.registry()?
            .execute_action(name, input, Some(self.call_context()))
            .await
    }

    pub async fn get_data(&self, name: &str, query: Payload) -> Result<Payload, RuntimeError> {
        self.registry()?
            .get_data(name, query, Some(self.call_context()))
            .await
    }

    fn registry(&self) -> Result<&Arc<CapabilityRegistry>, RuntimeError> {
        self.registry.as_ref().ok_or_else(|| {
            RuntimeError::Internal("no capability registry attached to this flow".to_string())
        })
    }

    fn call_context(&self) -> CallContext {
        CallContext {
            metadata: self
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..CallContext::default()
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("input", &self.input)
            .field("metadata", &self.metadata)
            .field("has_registry", &self.registry.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicPointResult {
    pub output: Payload,
    /// Stop an enclosing sequence after this node
    #[serde(default)]
    pub skip: bool,
}

impl LogicPointResult {
    pub fn output(output: Payload) -> Self {
        Self { output, skip: false }
    }

    pub fn skip(output: Payload) -> Self {
        Self { output, skip: true }
    }
}

#[async_trait]
pub trait LogicHandler: Send + Sync {
    async fn handle(&self, ctx: ExecutionContext) -> Result<LogicPointResult, RuntimeError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> LogicHandler for FnHandler<F>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<LogicPointResult, RuntimeError>> + Send + 'static,
{
    async fn handle(&self, ctx: ExecutionContext) -> Result<LogicPointResult, RuntimeError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn LogicHandler>
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<LogicPointResult, RuntimeError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What `create` needs to build a node.
#[derive(Clone)]
pub struct LogicPointSpec {
    pub name: String,
    pub point_type: LogicPointType,
    pub handler: Arc<dyn LogicHandler>,
    pub config: LogicPointConfig,
}

impl LogicPointSpec {
    pub fn new(
        name: impl Into<String>,
        point_type: LogicPointType,
        handler: Arc<dyn LogicHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            point_type,
            handler,
            config: LogicPointConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LogicPointConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Clone)]
pub struct LogicPoint {
    pub id: LogicPointId,
    pub name: String,
    pub point_type: LogicPointType,
    pub config: LogicPointConfig,
    pub created_at: DateTime<Utc>,
    handler: Arc<dyn LogicHandler>,
}

impl std::fmt::Debug for LogicPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicPoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("point_type", &self.point_type)
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointRecord {
    pub point_id: LogicPointId,
    pub name: String,
    pub input: Payload,
    pub output: Payload,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncNodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AsyncNodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AsyncNodeStatus::Completed | AsyncNodeStatus::Failed | AsyncNodeStatus::Cancelled
        )
    }
}

struct AsyncNode {
    status: AsyncNodeStatus,
    result: Option<Result<LogicPointResult, RuntimeError>>,
    done: Arc<Notify>,
}

/// Async nodes plus the order in which they finished.
#[derive(Default)]
struct AsyncNodes {
    nodes: HashMap<AsyncNodeId, AsyncNode>,
    finished: VecDeque<AsyncNodeId>,
}

impl AsyncNodes {
    /// Record a node as finished and evict the oldest beyond `retention`.
    fn retire(&mut self, node_id: AsyncNodeId, retention: usize) {
        self.finished.push_back(node_id);
        while self.finished.len() > retention.max(1) {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            if self.nodes.remove(&oldest).is_some() {
                tracing::debug!("Evicted unclaimed async node {}", oldest);
            }
        }
    }

    fn take(&mut self, node_id: AsyncNodeId) -> Option<AsyncNode> {
        self.finished.retain(|id| *id != node_id);
        self.nodes.remove(&node_id)
    }
}

struct FlowInner {
    points: RwLock<Vec<LogicPoint>>,
    async_nodes: Mutex<AsyncNodes>,
    checkpoints: Mutex<Vec<CheckpointRecord>>,
    registry: Option<Arc<CapabilityRegistry>>,
    events: EventBus,
    defaults: FlowConfig,
}

/// Registry and executor for logic points.
#[derive(Clone)]
pub struct LogicPointManager {
    inner: Arc<FlowInner>,
}

impl LogicPointManager {
    pub fn new(config: &FlowConfig, events: EventBus) -> Self {
        Self::build(config, events, None)
    }

    /// Manager whose handlers can reach the capability registry.
    pub fn with_registry(
        config: &FlowConfig,
        events: EventBus,
        registry: Arc<CapabilityRegistry>,
    ) -> Self {
        Self::build(config, events, Some(registry))
    }

    fn build(
        config: &FlowConfig,
        events: EventBus,
        registry: Option<Arc<CapabilityRegistry>>,
    ) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                points: RwLock::new(Vec::new()),
                async_nodes: Mutex::new(AsyncNodes::default()),
                checkpoints: Mutex::new(Vec::new()),
                registry,
                events,
                defaults: config.clone(),
            }),
        }
    }

    pub fn create(&self, spec: LogicPointSpec) -> Result<LogicPointId, FlowError> {
        let mut points = self.inner.points.write();
        if points.iter().any(|p| p.name == spec.name) {
            return Err(FlowError::DuplicateName { name: spec.name });
        }

        let id = LogicPointId::new();
        tracing::debug!("Created {} logic point {} ({})", spec.point_type, spec.name, id);
        points.push(LogicPoint {
            id,
            name: spec.name,
            point_type: spec.point_type,
            config: spec.config,
            created_at: Utc::now(),
            handler: spec.handler,
        });
        Ok(id)
    }

    pub fn get(&self, id: LogicPointId) -> Option<LogicPoint> {
        self.inner.points.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<LogicPoint> {
        self.inner
            .points
            .read()
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn get_by_type(&self, point_type: LogicPointType) -> Vec<LogicPoint> {
        self.inner
            .points
            .read()
            .iter()
            .filter(|p| p.point_type == point_type)
            .cloned()
            .collect()
    }

    /// All nodes in creation order.
    pub fn get_all(&self) -> Vec<LogicPoint> {
        self.inner.points.read().clone()
    }

    pub fn remove(&self, id: LogicPointId) -> bool {
        let mut points = self.inner.points.write();
        let before = points.len();
        points.retain(|p| p.id != id);
        points.len() != before
    }

    pub fn clear(&self) {
        self.inner.points.write().clear();
        self.inner.checkpoints.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.points.read().is_empty()
    }

    pub fn checkpoints(&self) -> Vec<CheckpointRecord> {
        self.inner.checkpoints.lock().clone()
    }

    fn require(&self, id: LogicPointId) -> Result<LogicPoint, FlowError> {
        self.get(id).ok_or_else(|| FlowError::NotFound { id: id.to_string() })
    }

    /// Run one node under its timeout/retry/fallback configuration.
    pub async fn execute(
        &self,
        id: LogicPointId,
        mut ctx: ExecutionContext,
    ) -> Result<LogicPointResult, RuntimeError> {
        let point = self.require(id)?;
        if ctx.registry.is_none() {
            ctx.registry = self.inner.registry.clone();
        }
        let checkpoint_input =
            (point.point_type == LogicPointType::Checkpoint).then(|| ctx.input.clone());

        self.inner.events.publish(RuntimeEvent::FlowStarted {
            point_id: point.id,
            name: point.name.clone(),
        });
        let started = Instant::now();

        let policy = point.config.policy(&self.inner.defaults);
        let handler = Arc::clone(&point.handler);
        let work = move || -> WorkFuture<LogicPointResult> {
            let handler = Arc::clone(&handler);
            let ctx = ctx.clone();
            async move { handler.handle(ctx).await }.boxed()
        };

        let (result, used_fallback) = match execute_with_policy(&point.name, &policy, &work).await {
            Ok(result) => (result, false),
            Err(error) => match &point.config.fallback {
                Some(fallback) => {
                    tracing::warn!(
                        "Logic point {} failed, using fallback: {}",
                        point.name,
                        error.root_cause()
                    );
                    (LogicPointResult::output(fallback.clone()), true)
                }
                None => {
                    let error = error.into_root_cause();
                    self.inner.events.publish(RuntimeEvent::FlowFailed {
                        point_id: point.id,
                        name: point.name.clone(),
                        error: error.to_string(),
                    });
                    return Err(error);
                }
            },
        };

        if let Some(input) = checkpoint_input {
            self.inner.checkpoints.lock().push(CheckpointRecord {
                point_id: point.id,
                name: point.name.clone(),
                input,
                output: result.output.clone(),
                at: Utc::now(),
            });
            self.inner.events.publish(RuntimeEvent::FlowCheckpoint {
                point_id: point.id,
                name: point.name.clone(),
            });
        }

        self.inner.events.publish(RuntimeEvent::FlowCompleted {
            point_id: point.id,
            name: point.name,
            duration: started.elapsed(),
            used_fallback,
        });
        Ok(result)
    }

    /// Pipe each node's output into the next; stops after a `skip` result.
    /// A failing node ends the chain with `chain:error`.
    pub async fn execute_sequence(
        &self,
        ids: &[LogicPointId],
        initial_input: Payload,
        metadata: Metadata,
    ) -> Result<Vec<LogicPointResult>, RuntimeError> {
        self.inner
            .events
            .publish(RuntimeEvent::ChainStarted { length: ids.len() });

        let mut results = Vec::with_capacity(ids.len());
        let mut input = initial_input;
        let mut skipped = false;

        for id in ids {
            let ctx = ExecutionContext::new(input).with_metadata(metadata.clone());
            let result = match self.execute(*id, ctx).await {
                Ok(result) => result,
                Err(error) => {
                    self.inner.events.publish(RuntimeEvent::ChainFailed {
                        executed: results.len(),
                        error: error.to_string(),
                    });
                    return Err(error);
                }
            };
            input = result.output.clone();
            skipped = result.skip;
            results.push(result);
            if skipped {
                tracing::debug!("Sequence stopped by skip after {} nodes", results.len());
                break;
            }
        }

        self.inner.events.publish(RuntimeEvent::ChainCompleted {
            executed: results.len(),
            skipped,
        });
        Ok(results)
    }

    /// Run a decision node, then the branch its output selects.
    pub async fn execute_decision(
        &self,
        decision_id: LogicPointId,
        ctx: ExecutionContext,
        branches: &HashMap<String, LogicPointId>,
    ) -> Result<LogicPointResult, RuntimeError> {
        let point = self.require(decision_id)?;
        if point.point_type != LogicPointType::Decision {
            return Err(FlowError::WrongType {
                id: decision_id,
                expected: LogicPointType::Decision.to_string(),
                actual: point.point_type.to_string(),
            }
            .into());
        }

        let mut branch_ctx = ctx.clone();
        let decision = self.execute(decision_id, ctx).await?;
        let key = branch_key(&decision.output);

        let (branch, branch_id) = match branches.get(&key) {
            Some(id) => (key.clone(), *id),
            None => match branches.get(DEFAULT_BRANCH) {
                Some(id) => (DEFAULT_BRANCH.to_string(), *id),
                None => return Err(FlowError::NoBranchFound { output: key }.into()),
            },
        };

        tracing::debug!("Decision {} chose branch {}", point.name, branch);
        self.inner.events.publish(RuntimeEvent::FlowDecision {
            decision_id,
            output: key,
            branch,
        });

        branch_ctx
            .metadata
            .insert(DECISION_RESULT_KEY.to_string(), decision.output);
        self.execute(branch_id, branch_ctx).await
    }

    /// Start a node in the background and return a handle to poll.
    pub fn execute_async(
        &self,
        id: LogicPointId,
        ctx: ExecutionContext,
    ) -> Result<AsyncNodeId, FlowError> {
        self.require(id)?;

        let node_id = AsyncNodeId::new();
        self.inner.async_nodes.lock().nodes.insert(
            node_id,
            AsyncNode {
                status: AsyncNodeStatus::Pending,
                result: None,
                done: Arc::new(Notify::new()),
            },
        );

        let manager = self.clone();
        tokio::spawn(async move {
            if !manager.mark_running(node_id) {
                return;
            }
            let result = manager.execute(id, ctx).await;
            manager.finish_async(node_id, result);
        });

        Ok(node_id)
    }

    fn mark_running(&self, node_id: AsyncNodeId) -> bool {
        let mut nodes = self.inner.async_nodes.lock();
        match nodes.nodes.get_mut(&node_id) {
            Some(node) if node.status == AsyncNodeStatus::Pending => {
                node.status = AsyncNodeStatus::Running;
                true
            }
            _ => false,
        }
    }

    fn finish_async(&self, node_id: AsyncNodeId, result: Result<LogicPointResult, RuntimeError>) {
        let mut nodes = self.inner.async_nodes.lock();
        let Some(node) = nodes.nodes.get_mut(&node_id) else {
            return;
        };
        if node.status == AsyncNodeStatus::Cancelled {
            tracing::debug!("Discarding result of cancelled node {}", node_id);
            return;
        }
        node.status = if result.is_ok() {
            AsyncNodeStatus::Completed
        } else {
            AsyncNodeStatus::Failed
        };
        node.result = Some(result);
        node.done.notify_waiters();
        nodes.retire(node_id, self.inner.defaults.async_result_retention);
    }

    pub fn async_node_status(&self, node_id: AsyncNodeId) -> Option<AsyncNodeStatus> {
        self.inner
            .async_nodes
            .lock()
            .nodes
            .get(&node_id)
            .map(|n| n.status)
    }

    /// Cancel a pending or running node. The work itself is not interrupted;
    /// its result is discarded when it arrives.
    pub fn cancel_async_node(&self, node_id: AsyncNodeId) -> bool {
        let mut nodes = self.inner.async_nodes.lock();
        let Some(node) = nodes.nodes.get_mut(&node_id) else {
            return false;
        };
        match node.status {
            AsyncNodeStatus::Pending | AsyncNodeStatus::Running => {
                node.status = AsyncNodeStatus::Cancelled;
                node.done.notify_waiters();
                nodes.retire(node_id, self.inner.defaults.async_result_retention);
                drop(nodes);
                self.inner
                    .events
                    .publish(RuntimeEvent::FlowAsyncCancelled { node_id });
                true
            }
            _ => false,
        }
    }

    /// Wait until the node reaches a terminal status.
    pub async fn wait_async(&self, node_id: AsyncNodeId) -> Option<AsyncNodeStatus> {
        loop {
            let done = {
                let nodes = self.inner.async_nodes.lock();
                let node = nodes.nodes.get(&node_id)?;
                if node.status.is_terminal() {
                    return Some(node.status);
                }
                Arc::clone(&node.done)
            };
            let notified = done.notified();
            if self
                .async_node_status(node_id)
                .map_or(true, |status| status.is_terminal())
            {
                continue;
            }
            notified.await;
        }
    }

    /// Remove a finished node and hand back its result.
    pub fn take_async_result(
        &self,
        node_id: AsyncNodeId,
    ) -> Option<Result<LogicPointResult, RuntimeError>> {
        let mut nodes = self.inner.async_nodes.lock();
        match nodes.nodes.get(&node_id).map(|n| n.status) {
            Some(AsyncNodeStatus::Completed | AsyncNodeStatus::Failed) => {
                nodes.take(node_id).and_then(|n| n.result)
            }
            Some(AsyncNodeStatus::Cancelled) => {
                nodes.take(node_id);
                None
            }
            _ => None,
        }
    }
}

/// Strings route by their raw text, everything else by its JSON text.
fn branch_key(output: &Payload) -> String {
    match output {
        Payload::String(s) => s.clone(),
        other => other.to_string(),
    }
}
