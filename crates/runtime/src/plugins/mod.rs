//! Plugin lifecycle management
//!
//! Plugins are loaded (by name through a [`PluginLoader`], or as ready-made
//! instances), initialized in registration order, and destroyed in reverse.
//! A plugin's capabilities enter the registry only after its `init` succeeds
//! and leave it before its `destroy` runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::PluginInitPolicy;
use crate::events::{EventBus, RuntimeEvent};
use crate::registry::{Action, CallContext, CapabilityRegistry, Evaluator, Provider};
use crate::types::{Payload, PluginError, RuntimeError};

/// Contract every plugin implements.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Plugins that must be initialized before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn actions(&self) -> Vec<Arc<dyn Action>> {
        Vec::new()
    }

    fn providers(&self) -> Vec<Arc<dyn Provider>> {
        Vec::new()
    }

    fn evaluators(&self) -> Vec<Arc<dyn Evaluator>> {
        Vec::new()
    }

    async fn init(&self, _core: PluginCore) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Where a plugin comes from.
#[derive(Clone)]
pub enum PluginSource {
    /// Resolved through the configured [`PluginLoader`]
    Named(String),
    Instance(Arc<dyn Plugin>),
}

impl From<Arc<dyn Plugin>> for PluginSource {
    fn from(plugin: Arc<dyn Plugin>) -> Self {
        PluginSource::Instance(plugin)
    }
}

impl From<&str> for PluginSource {
    fn from(name: &str) -> Self {
        PluginSource::Named(name.to_string())
    }
}

/// Resolves plugin names to instances.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<Arc<dyn Plugin>, PluginError>;
}

pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Loader backed by a fixed table of factories.
#[derive(Default, Clone)]
pub struct StaticPluginLoader {
    factories: HashMap<String, PluginFactory>,
}

impl StaticPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PluginLoader for StaticPluginLoader {
    async fn load(&self, name: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PluginError::LoadFailed {
                name: name.to_string(),
                reason: "no factory registered under this name".to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Unloaded,
    Loading,
    Initialized,
    Failed,
    Destroyed,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PluginState::Unloaded => "unloaded",
            PluginState::Loading => "loading",
            PluginState::Initialized => "initialized",
            PluginState::Failed => "failed",
            PluginState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Back-reference handed to plugins so they can call other capabilities.
#[derive(Clone)]
pub struct PluginCore {
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
}

impl PluginCore {
    pub fn new(registry: Arc<CapabilityRegistry>, events: EventBus) -> Self {
        Self { registry, events }
    }

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

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Outcome of [`PluginManager::init_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub initialized: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub state: PluginState,
    pub dependencies: Vec<String>,
    pub capabilities: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PluginStats {
    pub total: usize,
    pub loading: usize,
    pub initialized: usize,
    pub failed: usize,
    pub destroyed: usize,
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    state: PluginState,
    capabilities: Vec<String>,
    error: Option<String>,
}

impl PluginEntry {
    fn name(&self) -> &str {
        self.plugin.name()
    }
}

/// Owns loaded plugins and drives their lifecycle.
pub struct PluginManager {
    /// Registration order
    plugins: RwLock<Vec<PluginEntry>>,
    loader: Option<Arc<dyn PluginLoader>>,
    registry: Arc<CapabilityRegistry>,
    events: EventBus,
    core: RwLock<Option<PluginCore>>,
}

impl PluginManager {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        events: EventBus,
        loader: Option<Arc<dyn PluginLoader>>,
    ) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            loader,
            registry,
            events,
            core: RwLock::new(None),
        }
    }

    /// Add a plugin in the `Loading` state.
    pub async fn load_plugin(
        &self,
        source: impl Into<PluginSource>,
    ) -> Result<String, PluginError> {
        let plugin = match source.into() {
            PluginSource::Instance(plugin) => plugin,
            PluginSource::Named(name) => {
                let loader = self
                    .loader
                    .as_ref()
                    .ok_or_else(|| PluginError::LoaderUnavailable { name: name.clone() })?;
                loader.load(&name).await?
            }
        };

        let name = plugin.name().to_string();
        let version = plugin.version().to_string();
        {
            let mut plugins = self.plugins.write();
            if let Some(position) = plugins.iter().position(|e| e.name() == name) {
                match plugins[position].state {
                    PluginState::Destroyed | PluginState::Unloaded => {
                        plugins.remove(position);
                    }
                    _ => return Err(PluginError::AlreadyLoaded { name }),
                }
            }
            plugins.push(PluginEntry {
                plugin,
                state: PluginState::Loading,
                capabilities: Vec::new(),
                error: None,
            });
        }

        tracing::info!("Loaded plugin {} v{}", name, version);
        self.events
            .publish(RuntimeEvent::PluginLoaded { name: name.clone(), version });
        Ok(name)
    }

    pub fn set_core(&self, core: PluginCore) {
        *self.core.write() = Some(core);
    }

    pub fn has_core(&self) -> bool {
        self.core.read().is_some()
    }

    /// Initialize every `Loading` plugin in registration order.
    pub async fn init_all(&self, policy: PluginInitPolicy) -> Result<InitReport, PluginError> {
        let core = self.core.read().clone().ok_or(PluginError::CoreNotSet)?;
        let pending: Vec<Arc<dyn Plugin>> = self
            .plugins
            .read()
            .iter()
            .filter(|e| e.state == PluginState::Loading)
            .map(|e| Arc::clone(&e.plugin))
            .collect();

        let mut report = InitReport::default();
        for plugin in pending {
            let name = plugin.name().to_string();
            match self.init_one(&plugin, core.clone()).await {
                Ok(capabilities) => {
                    tracing::info!(
                        "Initialized plugin {} with {} capabilities",
                        name,
                        capabilities.len()
                    );
                    self.update(&name, |entry| {
                        entry.state = PluginState::Initialized;
                        entry.capabilities = capabilities;
                        entry.error = None;
                    });
                    report.initialized.push(name);
                }
                Err(error) => {
                    let message = error.to_string();
                    tracing::error!("Plugin {} failed to initialize: {}", name, message);
                    self.update(&name, |entry| {
                        entry.state = PluginState::Failed;
                        entry.error = Some(message.clone());
                    });
                    self.events.publish(RuntimeEvent::PluginError {
                        name: name.clone(),
                        error: message.clone(),
                    });
                    if policy == PluginInitPolicy::Strict {
                        return Err(error);
                    }
                    report.failed.push((name, message));
                }
            }
        }
        Ok(report)
    }

    async fn init_one(
        &self,
        plugin: &Arc<dyn Plugin>,
        core: PluginCore,
    ) -> Result<Vec<String>, PluginError> {
        let name = plugin.name().to_string();

        for dependency in plugin.dependencies() {
            if self.state_of(&dependency) != Some(PluginState::Initialized) {
                return Err(PluginError::MissingDependency {
                    plugin: name,
                    dependency,
                });
            }
        }

        plugin
            .init(core)
            .await
            .map_err(|e| PluginError::InitFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        match self.registry.register_plugin(
            &name,
            plugin.actions(),
            plugin.providers(),
            plugin.evaluators(),
        ) {
            Ok(capabilities) => Ok(capabilities),
            Err(registry_error) => {
                if let Err(e) = plugin.destroy().await {
                    tracing::warn!("Plugin {} cleanup after failed registration: {}", name, e);
                }
                Err(PluginError::InitFailed {
                    name,
                    reason: registry_error.to_string(),
                })
            }
        }
    }

    /// Destroy initialized plugins in reverse registration order.
    ///
    /// Failures are isolated per plugin and returned together.
    pub async fn destroy_all(&self) -> Vec<PluginError> {
        let initialized: Vec<Arc<dyn Plugin>> = self
            .plugins
            .read()
            .iter()
            .rev()
            .filter(|e| e.state == PluginState::Initialized)
            .map(|e| Arc::clone(&e.plugin))
            .collect();

        let mut failures = Vec::new();
        for plugin in initialized {
            if let Err(e) = self.teardown(&plugin).await {
                failures.push(e);
            }
            let name = plugin.name().to_string();
            self.update(&name, |entry| {
                entry.state = PluginState::Destroyed;
                entry.capabilities.clear();
            });
        }
        failures
    }

    /// Tear down one plugin and forget it entirely.
    pub async fn unload_plugin(&self, name: &str) -> Result<(), PluginError> {
        let (plugin, state) = {
            let plugins = self.plugins.read();
            let entry = plugins
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| PluginError::NotFound {
                    name: name.to_string(),
                })?;
            (Arc::clone(&entry.plugin), entry.state)
        };

        let result = if state == PluginState::Initialized {
            self.teardown(&plugin).await
        } else {
            self.events.publish(RuntimeEvent::PluginUnloaded {
                name: name.to_string(),
            });
            Ok(())
        };

        self.plugins.write().retain(|e| e.name() != name);
        result
    }

    /// Unregister capabilities, run `destroy`, publish the outcome.
    async fn teardown(&self, plugin: &Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        self.registry.unregister_plugin(&name);

        let result = plugin.destroy().await.map_err(|e| PluginError::DestroyFailed {
            name: name.clone(),
            reason: e.to_string(),
        });

        match &result {
            Ok(()) => tracing::info!("Destroyed plugin {}", name),
            Err(e) => {
                tracing::error!("{}", e);
                self.events.publish(RuntimeEvent::PluginError {
                    name: name.clone(),
                    error: e.to_string(),
                });
            }
        }
        self.events.publish(RuntimeEvent::PluginUnloaded { name });
        result
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut PluginEntry)) {
        if let Some(entry) = self.plugins.write().iter_mut().find(|e| e.name() == name) {
            f(entry);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .iter()
            .find(|e| e.name() == name)
            .map(|e| Arc::clone(&e.plugin))
    }

    pub fn state_of(&self, name: &str) -> Option<PluginState> {
        self.plugins
            .read()
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.state)
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.state_of(name) == Some(PluginState::Initialized)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .iter()
            .map(|e| PluginInfo {
                name: e.name().to_string(),
                version: e.plugin.version().to_string(),
                description: e.plugin.description().to_string(),
                state: e.state,
                dependencies: e.plugin.dependencies(),
                capabilities: e.capabilities.clone(),
                error: e.error.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    pub fn stats(&self) -> PluginStats {
        let plugins = self.plugins.read();
        let mut stats = PluginStats {
            total: plugins.len(),
            ..PluginStats::default()
        };
        for entry in plugins.iter() {
            match entry.state {
                PluginState::Loading => stats.loading += 1,
                PluginState::Initialized => stats.initialized += 1,
                PluginState::Failed => stats.failed += 1,
                PluginState::Destroyed => stats.destroyed += 1,
                PluginState::Unloaded => {}
            }
        }
        stats
    }
}
