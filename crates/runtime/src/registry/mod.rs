//! Capability registry and dispatcher
//!
//! Plugins contribute three kinds of capabilities: actions (do something),
//! providers (return data) and evaluators (answer yes/no). Each is registered
//! under `"<plugin>:<verb>"`; one table holds all three kinds, so a qualified
//! name is unique across the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, RuntimeEvent};
use crate::types::{AgentId, Payload, RegistryError, RequestId, RuntimeError};

/// Who is calling, carried alongside every capability input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallContext {
    pub request_id: RequestId,
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub metadata: HashMap<String, Payload>,
}

impl CallContext {
    pub fn for_agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }
}

/// Everything a capability handler receives.
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    /// Qualified name the caller dispatched to
    pub name: String,
    pub input: Payload,
    pub call: CallContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(data: Payload) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderResult {
    pub fn ok(data: Payload) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Something a plugin can do on request.
#[async_trait]
pub trait Action: Send + Sync {
    /// Verb part of the qualified name
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Reject malformed input before `execute` runs.
    fn validate(&self, _input: &Payload) -> Result<(), String> {
        Ok(())
    }

    async fn execute(&self, ctx: CapabilityContext) -> ActionResult;
}

/// A source of data.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn get(&self, ctx: CapabilityContext) -> ProviderResult;
}

/// A yes/no predicate over some input.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn evaluate(&self, ctx: CapabilityContext) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Action,
    Provider,
    Evaluator,
}

/// A handler of any kind.
#[derive(Clone)]
pub enum Capability {
    Action(Arc<dyn Action>),
    Provider(Arc<dyn Provider>),
    Evaluator(Arc<dyn Evaluator>),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Action(_) => CapabilityKind::Action,
            Capability::Provider(_) => CapabilityKind::Provider,
            Capability::Evaluator(_) => CapabilityKind::Evaluator,
        }
    }

    pub fn verb(&self) -> &str {
        match self {
            Capability::Action(a) => a.name(),
            Capability::Provider(p) => p.name(),
            Capability::Evaluator(e) => e.name(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Capability::Action(a) => a.description(),
            Capability::Provider(p) => p.description(),
            Capability::Evaluator(e) => e.description(),
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.verb())
    }
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub plugin: String,
    pub kind: CapabilityKind,
    pub description: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub actions: usize,
    pub providers: usize,
    pub evaluators: usize,
    pub plugins: usize,
}

struct Registration {
    plugin: String,
    capability: Capability,
}

pub fn qualified_name(plugin: &str, verb: &str) -> String {
    format!("{plugin}:{verb}")
}

/// Name-keyed table of capabilities plus the dispatch entry points.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    events: EventBus,
}

impl CapabilityRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn register_action(
        &self,
        action: Arc<dyn Action>,
        plugin: &str,
    ) -> Result<String, RegistryError> {
        self.register(plugin, Capability::Action(action))
    }

    pub fn register_provider(
        &self,
        provider: Arc<dyn Provider>,
        plugin: &str,
    ) -> Result<String, RegistryError> {
        self.register(plugin, Capability::Provider(provider))
    }

    pub fn register_evaluator(
        &self,
        evaluator: Arc<dyn Evaluator>,
        plugin: &str,
    ) -> Result<String, RegistryError> {
        self.register(plugin, Capability::Evaluator(evaluator))
    }

    /// Register one capability under `plugin`.
    pub fn register(&self, plugin: &str, capability: Capability) -> Result<String, RegistryError> {
        let name = qualified_name(plugin, capability.verb());
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(RegistryError::DuplicateRegistration { name });
        }
        tracing::debug!("Registered {:?} {}", capability.kind(), name);
        entries.insert(
            name.clone(),
            Registration {
                plugin: plugin.to_string(),
                capability,
            },
        );
        Ok(name)
    }

    /// Register a whole batch, or nothing if any name collides.
    pub fn register_plugin(
        &self,
        plugin: &str,
        actions: Vec<Arc<dyn Action>>,
        providers: Vec<Arc<dyn Provider>>,
        evaluators: Vec<Arc<dyn Evaluator>>,
    ) -> Result<Vec<String>, RegistryError> {
        let capabilities: Vec<Capability> = actions
            .into_iter()
            .map(Capability::Action)
            .chain(providers.into_iter().map(Capability::Provider))
            .chain(evaluators.into_iter().map(Capability::Evaluator))
            .collect();
        let names: Vec<String> = capabilities
            .iter()
            .map(|c| qualified_name(plugin, c.verb()))
            .collect();

        let mut entries = self.entries.write();
        for (index, name) in names.iter().enumerate() {
            if entries.contains_key(name) || names[..index].contains(name) {
                return Err(RegistryError::DuplicateRegistration { name: name.clone() });
            }
        }

        for (name, capability) in names.iter().zip(capabilities) {
            entries.insert(
                name.clone(),
                Registration {
                    plugin: plugin.to_string(),
                    capability,
                },
            );
        }
        tracing::info!("Registered {} capabilities for plugin {}", names.len(), plugin);
        Ok(names)
    }

    /// Remove every capability owned by `plugin` in one step.
    pub fn unregister_plugin(&self, plugin: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.write().retain(|name, registration| {
            if registration.plugin == plugin {
                removed.push(name.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            tracing::info!("Unregistered {} capabilities for plugin {}", removed.len(), plugin);
        }
        removed.sort();
        removed
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn list(&self, kind: CapabilityKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, r)| r.capability.kind() == kind)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn list_actions(&self) -> Vec<String> {
        self.list(CapabilityKind::Action)
    }

    pub fn list_providers(&self) -> Vec<String> {
        self.list(CapabilityKind::Provider)
    }

    pub fn list_evaluators(&self) -> Vec<String> {
        self.list(CapabilityKind::Evaluator)
    }

    pub fn capabilities_of(&self, plugin: &str) -> Vec<CapabilityInfo> {
        let mut infos: Vec<CapabilityInfo> = self
            .entries
            .read()
            .iter()
            .filter(|(_, r)| r.plugin == plugin)
            .map(|(name, r)| CapabilityInfo {
                name: name.clone(),
                plugin: r.plugin.clone(),
                kind: r.capability.kind(),
                description: r.capability.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.read();
        let mut stats = RegistryStats::default();
        let mut plugins = std::collections::HashSet::new();
        for registration in entries.values() {
            plugins.insert(registration.plugin.as_str());
            match registration.capability.kind() {
                CapabilityKind::Action => stats.actions += 1,
                CapabilityKind::Provider => stats.providers += 1,
                CapabilityKind::Evaluator => stats.evaluators += 1,
            }
        }
        stats.plugins = plugins.len();
        stats
    }

    // ── Dispatch ──────────────────────────────────────────────────────

    pub async fn execute_action(
        &self,
        name: &str,
        input: Payload,
        call: Option<CallContext>,
    ) -> Result<Payload, RuntimeError> {
        let action = match self.lookup(name) {
            Some(Capability::Action(action)) => action,
            _ => return Err(not_found(name)),
        };

        action
            .validate(&input)
            .map_err(|reason| RegistryError::Validation {
                name: name.to_string(),
                reason,
            })?;

        self.events.publish(RuntimeEvent::ActionStarted {
            name: name.to_string(),
        });
        let started = Instant::now();

        let result = action.execute(context(name, input, call)).await;

        if result.success {
            self.events.publish(RuntimeEvent::ActionCompleted {
                name: name.to_string(),
                duration: started.elapsed(),
            });
            Ok(result.data.unwrap_or(Payload::Null))
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "action reported failure".to_string());
            tracing::warn!("Action {} failed: {}", name, error);
            self.events.publish(RuntimeEvent::ActionFailed {
                name: name.to_string(),
                error: error.clone(),
            });
            Err(RegistryError::CapabilityFailed {
                name: name.to_string(),
                error,
            }
            .into())
        }
    }

    pub async fn get_data(
        &self,
        name: &str,
        query: Payload,
        call: Option<CallContext>,
    ) -> Result<Payload, RuntimeError> {
        let provider = match self.lookup(name) {
            Some(Capability::Provider(provider)) => provider,
            _ => return Err(not_found(name)),
        };

        let result = provider.get(context(name, query, call)).await;
        if result.success {
            Ok(result.data.unwrap_or(Payload::Null))
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "provider reported failure".to_string());
            tracing::warn!("Provider {} failed: {}", name, error);
            Err(RegistryError::CapabilityFailed {
                name: name.to_string(),
                error,
            }
            .into())
        }
    }

    pub async fn evaluate(
        &self,
        name: &str,
        input: Payload,
        call: Option<CallContext>,
    ) -> Result<bool, RuntimeError> {
        let evaluator = match self.lookup(name) {
            Some(Capability::Evaluator(evaluator)) => evaluator,
            _ => return Err(not_found(name)),
        };
        Ok(evaluator.evaluate(context(name, input, call)).await)
    }

    fn lookup(&self, name: &str) -> Option<Capability> {
        self.entries
            .read()
            .get(name)
            .map(|registration| registration.capability.clone())
    }
}

fn context(name: &str, input: Payload, call: Option<CallContext>) -> CapabilityContext {
    CapabilityContext {
        name: name.to_string(),
        input,
        call: call.unwrap_or_default(),
    }
}

fn not_found(name: &str) -> RuntimeError {
    RegistryError::NotFound {
        name: name.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Action for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn validate(&self, input: &Payload) -> Result<(), String> {
            if input.is_object() {
                Ok(())
            } else {
                Err("expected an object".to_string())
            }
        }

        async fn execute(&self, ctx: CapabilityContext) -> ActionResult {
            ActionResult::ok(json!({ "echo": ctx.input, "agent": ctx.call.agent_id }))
        }
    }

    struct Broken;

    #[async_trait]
    impl Action for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn execute(&self, _ctx: CapabilityContext) -> ActionResult {
            ActionResult::fail("insufficient balance")
        }
    }

    struct Price;

    #[async_trait]
    impl Provider for Price {
        fn name(&self) -> &str {
            "price"
        }

        async fn get(&self, ctx: CapabilityContext) -> ProviderResult {
            match ctx.input["symbol"].as_str() {
                Some("SOL") => ProviderResult::ok(json!(142.5)),
                _ => ProviderResult::fail("unknown symbol"),
            }
        }
    }

    struct IsPositive;

    #[async_trait]
    impl Evaluator for IsPositive {
        fn name(&self) -> &str {
            "positive"
        }

        async fn evaluate(&self, ctx: CapabilityContext) -> bool {
            ctx.input.as_f64().map(|v| v > 0.0).unwrap_or(false)
        }
    }

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(EventBus::new())
    }

    #[tokio::test]
    async fn test_execute_action() {
        let registry = registry();
        let name = registry.register_action(Arc::new(Echo), "util").unwrap();
        assert_eq!(name, "util:echo");

        let agent = AgentId::new();
        let out = registry
            .execute_action("util:echo", json!({"a": 1}), Some(CallContext::for_agent(agent)))
            .await
            .unwrap();
        assert_eq!(out["echo"], json!({"a": 1}));
        assert_eq!(out["agent"], json!(agent));
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = registry();
        registry.register_action(Arc::new(Echo), "util").unwrap();
        let err = registry.register_action(Arc::new(Echo), "util").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateRegistration { ref name } if name == "util:echo"
        ));

        // Same verb under another plugin is a different name.
        assert!(registry.register_action(Arc::new(Echo), "other").is_ok());
    }

    #[test]
    fn test_unregister_plugin_removes_only_its_entries() {
        let registry = registry();
        registry.register_action(Arc::new(Echo), "alpha").unwrap();
        registry.register_provider(Arc::new(Price), "alpha").unwrap();
        registry.register_action(Arc::new(Echo), "beta").unwrap();
        registry.register_evaluator(Arc::new(IsPositive), "beta").unwrap();

        let removed = registry.unregister_plugin("alpha");
        assert_eq!(removed, vec!["alpha:echo".to_string(), "alpha:price".to_string()]);

        assert!(!registry.has("alpha:echo"));
        assert!(!registry.has("alpha:price"));
        assert!(registry.has("beta:echo"));
        assert!(registry.has("beta:positive"));
        assert_eq!(registry.stats().plugins, 1);
    }

    #[test]
    fn test_register_plugin_is_all_or_nothing() {
        let registry = registry();
        registry.register_action(Arc::new(Echo), "wallet").unwrap();

        let err = registry
            .register_plugin(
                "wallet",
                vec![Arc::new(Echo) as Arc<dyn Action>],
                vec![Arc::new(Price) as Arc<dyn Provider>],
                vec![],
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRegistration { .. }));
        assert!(!registry.has("wallet:price"));

        let names = registry
            .register_plugin(
                "dex",
                vec![Arc::new(Echo) as Arc<dyn Action>],
                vec![Arc::new(Price) as Arc<dyn Provider>],
                vec![],
            )
            .unwrap();
        assert_eq!(names, vec!["dex:echo".to_string(), "dex:price".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let registry = registry();
        registry.register_provider(Arc::new(Price), "market").unwrap();

        let err = registry
            .execute_action("market:missing", json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        // A provider is not an action.
        let err = registry
            .execute_action("market:price", json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_validation_rejects_input() {
        let registry = registry();
        registry.register_action(Arc::new(Echo), "util").unwrap();
        let err = registry
            .execute_action("util:echo", json!("not an object"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Registry(RegistryError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_result_becomes_error() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_topic("action:*");
        let registry = CapabilityRegistry::new(bus);
        registry.register_action(Arc::new(Broken), "swap").unwrap();

        let err = registry
            .execute_action("swap:broken", json!({}), None)
            .await
            .unwrap_err();
        match err {
            RuntimeError::Registry(RegistryError::CapabilityFailed { name, error }) => {
                assert_eq!(name, "swap:broken");
                assert_eq!(error, "insufficient balance");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let topics: Vec<String> = rx.drain().iter().map(|e| e.topic().to_string()).collect();
        assert_eq!(topics, vec!["action:start", "action:error"]);
    }

    #[tokio::test]
    async fn test_providers_and_evaluators() {
        let registry = registry();
        registry.register_provider(Arc::new(Price), "market").unwrap();
        registry.register_evaluator(Arc::new(IsPositive), "math").unwrap();

        let price = registry
            .get_data("market:price", json!({"symbol": "SOL"}), None)
            .await
            .unwrap();
        assert_eq!(price, json!(142.5));

        assert!(registry
            .get_data("market:price", json!({"symbol": "???"}), None)
            .await
            .is_err());

        assert!(registry.evaluate("math:positive", json!(3), None).await.unwrap());
        assert!(!registry.evaluate("math:positive", json!(-1), None).await.unwrap());
    }

    #[test]
    fn test_listing() {
        let registry = registry();
        registry.register_action(Arc::new(Echo), "b").unwrap();
        registry.register_action(Arc::new(Broken), "a").unwrap();
        registry.register_provider(Arc::new(Price), "a").unwrap();

        assert_eq!(registry.list_actions(), vec!["a:broken", "b:echo"]);
        assert_eq!(registry.list_providers(), vec!["a:price"]);
        assert!(registry.list_evaluators().is_empty());
        assert_eq!(registry.capabilities_of("a").len(), 2);
    }
}
