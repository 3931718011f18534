//! Axon Agent Runtime
//!
//! The runtime is the host process for capability plugins. It loads and
//! initializes plugins, dispatches their actions, providers and evaluators by
//! qualified name, runs ad hoc work through a bounded task queue, fires
//! recurring work from a cron/interval scheduler, and executes decision and
//! sequence flows over logic points.

pub mod agent;
pub mod config;
pub mod events;
pub mod flow;
pub mod lifecycle;
pub mod logging;
pub mod operations;
pub mod plugins;
pub mod registry;
pub mod scheduler;
pub mod types;

// Re-export commonly used types
pub use agent::{Agent, AgentConfig, AgentInfo};
pub use config::{PluginInitPolicy, RuntimeConfig};
pub use events::{EventBus, EventEnvelope, EventReceiver, RuntimeEvent};
pub use flow::{
    handler_fn, ExecutionContext, LogicHandler, LogicPointConfig, LogicPointManager,
    LogicPointResult, LogicPointSpec, LogicPointType,
};
pub use lifecycle::{RuntimeState, StateMachine};
pub use operations::{work_fn, AsyncOperation, AsyncOperationRunner, RetryPolicy, WorkFn};
pub use plugins::{
    InitReport, Plugin, PluginCore, PluginLoader, PluginManager, PluginSource, PluginState,
    StaticPluginLoader,
};
pub use registry::{
    Action, ActionResult, CallContext, CapabilityContext, CapabilityRegistry, Evaluator,
    Provider, ProviderResult,
};
pub use scheduler::{
    ScheduleOptions, ScheduleRequest, ScheduledTask, Scheduler, TaskManager, TaskOptions, Trigger,
};
pub use types::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::plugins::PluginStats;
use crate::registry::RegistryStats;
use crate::scheduler::{SchedulerMetrics, TaskStats};

/// Snapshot of every subsystem, suitable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub state: RuntimeState,
    pub started_at: Option<DateTime<Utc>>,
    pub tasks: TaskStats,
    pub scheduler: SchedulerMetrics,
    pub registry: RegistryStats,
    pub plugins: PluginStats,
    pub logic_points: usize,
    pub agents: usize,
    pub event_subscribers: usize,
}

/// Builder for [`AgentRuntime`].
#[derive(Default)]
pub struct AgentRuntimeBuilder {
    config: RuntimeConfig,
    loader: Option<Arc<dyn PluginLoader>>,
}

impl AgentRuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Loader used to resolve `PluginSource::Named` plugins.
    pub fn loader(mut self, loader: Arc<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> Result<AgentRuntime, RuntimeError> {
        AgentRuntime::assemble(self.config, self.loader)
    }
}

/// Main Agent Runtime
///
/// Clones share the same subsystems.
#[derive(Clone)]
pub struct AgentRuntime {
    config: Arc<RuntimeConfig>,
    events: EventBus,
    state: Arc<StateMachine>,
    operations: AsyncOperationRunner,
    tasks: TaskManager,
    scheduler: Scheduler,
    registry: Arc<CapabilityRegistry>,
    plugins: Arc<PluginManager>,
    flow: LogicPointManager,
    agents: Arc<DashMap<AgentId, Agent>>,
    started_at: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl AgentRuntime {
    /// Create a runtime with no plugin loader.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::assemble(config, None)
    }

    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::default()
    }

    fn assemble(
        config: RuntimeConfig,
        loader: Option<Arc<dyn PluginLoader>>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let events = EventBus::with_capacity(config.events.capacity);
        let state = Arc::new(StateMachine::new().with_events(events.clone()));
        let operations = AsyncOperationRunner::new();
        let tasks = TaskManager::new(&config.tasks, operations.clone());
        let scheduler = Scheduler::new(&config.scheduler, tasks.clone(), events.clone())?;
        let registry = Arc::new(CapabilityRegistry::new(events.clone()));
        let plugins = Arc::new(PluginManager::new(
            Arc::clone(&registry),
            events.clone(),
            loader,
        ));
        let flow =
            LogicPointManager::with_registry(&config.flow, events.clone(), Arc::clone(&registry));

        tracing::debug!(
            "Runtime assembled: max_concurrency={}, tick={:?}, timezone={}",
            config.tasks.max_concurrency,
            config.scheduler.tick_interval,
            config.scheduler.timezone
        );

        Ok(Self {
            config: Arc::new(config),
            events,
            state,
            operations,
            tasks,
            scheduler,
            registry,
            plugins,
            flow,
            agents: Arc::new(DashMap::new()),
            started_at: Arc::new(RwLock::new(None)),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    pub async fn load_plugin(
        &self,
        source: impl Into<PluginSource>,
    ) -> Result<String, RuntimeError> {
        Ok(self.plugins.load_plugin(source).await?)
    }

    /// Initialize loaded plugins and move to `Ready`.
    pub async fn initialize(&self) -> Result<InitReport, RuntimeError> {
        self.state.transition_to(RuntimeState::Initializing)?;
        self.events.publish(RuntimeEvent::SystemInit);
        tracing::info!("Initializing runtime with {} plugins", self.plugins.len());

        self.plugins
            .set_core(PluginCore::new(Arc::clone(&self.registry), self.events.clone()));

        let report = match self.plugins.init_all(self.config.plugins.init_policy).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("Runtime initialization aborted: {}", e);
                if let Err(state_error) = self.state.transition_to(RuntimeState::Error) {
                    tracing::warn!("Could not enter error state: {}", state_error);
                }
                return Err(e.into());
            }
        };

        for (name, reason) in &report.failed {
            tracing::warn!("Plugin {} unavailable: {}", name, reason);
        }

        self.state.transition_to(RuntimeState::Ready)?;
        self.events.publish(RuntimeEvent::SystemReady {
            plugins: report.initialized.len(),
        });
        tracing::info!(
            "Runtime ready: {} plugins initialized, {} failed",
            report.initialized.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Start the scheduler loop.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.state.transition_to(RuntimeState::Running)?;
        self.scheduler.start();
        *self.started_at.write() = Some(Utc::now());
        tracing::info!("Runtime started");
        Ok(())
    }

    /// Stop scheduling, drain queued work, then tear plugins down.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        self.state.transition_to(RuntimeState::Stopping)?;
        tracing::info!("Stopping runtime");

        self.scheduler.stop().await;
        self.tasks.wait_all().await;

        for failure in self.plugins.destroy_all().await {
            tracing::warn!("Plugin shutdown error: {}", failure);
        }

        self.state.transition_to(RuntimeState::Stopped)?;
        self.events.publish(RuntimeEvent::SystemShutdown);
        tracing::info!("Runtime stopped");
        Ok(())
    }

    /// Return to `Idle` from `Stopped` or `Error`.
    pub fn reset(&self) -> Result<(), RuntimeError> {
        self.state.reset()?;
        *self.started_at.write() = None;
        Ok(())
    }

    pub fn state(&self) -> RuntimeState {
        self.state.state()
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    pub async fn execute_action(
        &self,
        name: &str,
        input: Payload,
        call: Option<CallContext>,
    ) -> Result<Payload, RuntimeError> {
        self.registry.execute_action(name, input, call).await
    }

    pub async fn get_data(
        &self,
        name: &str,
        query: Payload,
        call: Option<CallContext>,
    ) -> Result<Payload, RuntimeError> {
        self.registry.get_data(name, query, call).await
    }

    pub async fn evaluate(
        &self,
        name: &str,
        input: Payload,
        call: Option<CallContext>,
    ) -> Result<bool, RuntimeError> {
        self.registry.evaluate(name, input, call).await
    }

    // ── Work ──────────────────────────────────────────────────────────

    pub async fn queue_task(
        &self,
        work: WorkFn,
        options: TaskOptions,
    ) -> Result<Payload, RuntimeError> {
        self.tasks.enqueue(work, options).await
    }

    pub fn schedule_task(
        &self,
        job: WorkFn,
        options: ScheduleOptions,
    ) -> Result<ScheduledTaskId, RuntimeError> {
        Ok(self.scheduler.schedule(job, options)?)
    }

    /// Schedule a registered action from an external request.
    pub fn schedule_action(
        &self,
        request: ScheduleRequest,
    ) -> Result<ScheduledTaskId, RuntimeError> {
        let action = request.action.clone();
        let input = request.action_input.clone().unwrap_or(Payload::Null);
        let options = ScheduleOptions::try_from(request)?;

        let registry = Arc::clone(&self.registry);
        let job = work_fn(move || {
            let registry = Arc::clone(&registry);
            let action = action.clone();
            let input = input.clone();
            async move { registry.execute_action(&action, input, None).await }
        });

        self.schedule_task(job, options)
    }

    pub fn list_scheduled(&self) -> Vec<ScheduledTask> {
        self.scheduler.list()
    }

    /// Flip a scheduled task's enabled flag, returning the new value.
    pub fn toggle_scheduled(&self, id: ScheduledTaskId) -> Result<bool, RuntimeError> {
        self.scheduler
            .toggle(id)
            .ok_or_else(|| SchedulerError::NotFound(id).into())
    }

    pub fn delete_scheduled(&self, id: ScheduledTaskId) -> Result<(), RuntimeError> {
        if self.scheduler.remove(id) {
            Ok(())
        } else {
            Err(SchedulerError::NotFound(id).into())
        }
    }

    // ── Agents ────────────────────────────────────────────────────────

    /// Create an agent whose required plugins are all initialized.
    pub fn create_agent(&self, config: AgentConfig) -> Result<Agent, RuntimeError> {
        for plugin in &config.plugins {
            match self.plugins.state_of(plugin) {
                Some(PluginState::Initialized) => {}
                Some(_) => {
                    return Err(PluginError::MissingDependency {
                        plugin: config.name.clone(),
                        dependency: plugin.clone(),
                    }
                    .into())
                }
                None => {
                    return Err(PluginError::NotFound {
                        name: plugin.clone(),
                    }
                    .into())
                }
            }
        }

        let agent = Agent::new(config, Arc::clone(&self.registry), self.tasks.clone());
        tracing::info!("Created agent {} ({})", agent.name(), agent.id());
        self.agents.insert(agent.id(), agent.clone());
        Ok(agent)
    }

    pub fn agent(&self, id: AgentId) -> Option<Agent> {
        self.agents.get(&id).map(|entry| entry.value().clone())
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.agents.iter().map(|entry| entry.info()).collect();
        agents.sort_by_key(|info| info.created_at);
        agents
    }

    pub fn remove_agent(&self, id: AgentId) -> bool {
        self.agents.remove(&id).is_some()
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            state: self.state.state(),
            started_at: *self.started_at.read(),
            tasks: self.tasks.stats(),
            scheduler: self.scheduler.metrics(),
            registry: self.registry.stats(),
            plugins: self.plugins.stats(),
            logic_points: self.flow.len(),
            agents: self.agents.len(),
            event_subscribers: self.events.subscriber_count(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    pub fn operations(&self) -> &AsyncOperationRunner {
        &self.operations
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    pub fn flow(&self) -> &LogicPointManager {
        &self.flow
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}
