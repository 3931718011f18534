//! Agents: named callers bound to a runtime
//!
//! An [`Agent`] does not own capabilities. It is a handle that stamps its
//! identity onto every call it makes through the runtime's registry and
//! task manager.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operations::WorkFn;
use crate::registry::{CallContext, CapabilityRegistry};
use crate::scheduler::{TaskManager, TaskOptions};
use crate::types::{AgentId, Payload, RuntimeError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub description: Option<String>,
    /// Plugins that must be initialized for this agent to run
    pub plugins: Vec<String>,
    pub metadata: HashMap<String, Payload>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugins.push(plugin.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Payload) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Serializable view of an agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub description: Option<String>,
    pub plugins: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Agent {
    id: AgentId,
    config: Arc<AgentConfig>,
    created_at: DateTime<Utc>,
    registry: Arc<CapabilityRegistry>,
    tasks: TaskManager,
}

impl Agent {
    pub(crate) fn new(
        config: AgentConfig,
        registry: Arc<CapabilityRegistry>,
        tasks: TaskManager,
    ) -> Self {
        Self {
            id: AgentId::new(),
            config: Arc::new(config),
            created_at: Utc::now(),
            registry,
            tasks,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id,
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            plugins: self.config.plugins.clone(),
            created_at: self.created_at,
        }
    }

    /// Fresh call context carrying this agent's id and metadata.
    pub fn call_context(&self) -> CallContext {
        CallContext {
            agent_id: Some(self.id),
            metadata: self.config.metadata.clone(),
            ..CallContext::default()
        }
    }

    pub async fn execute_action(
        &self,
        name: &str,
        input: Payload,
    ) -> Result<Payload, RuntimeError> {
        self.registry
            .execute_action(name, input, Some(self.call_context()))
            .await
    }

    pub async fn get_data(&self, name: &str, query: Payload) -> Result<Payload, RuntimeError> {
        self.registry
            .get_data(name, query, Some(self.call_context()))
            .await
    }

    pub async fn evaluate(&self, name: &str, input: Payload) -> Result<bool, RuntimeError> {
        self.registry
            .evaluate(name, input, Some(self.call_context()))
            .await
    }

    /// Queue work on the runtime's task manager under this agent's name.
    pub async fn queue_task(
        &self,
        work: WorkFn,
        mut options: TaskOptions,
    ) -> Result<Payload, RuntimeError> {
        if options.name.is_none() {
            options.name = Some(format!("{}:task", self.config.name));
        }
        self.tasks.enqueue(work, options).await
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskManagerConfig;
    use crate::events::EventBus;
    use crate::operations::{work_fn, AsyncOperationRunner};
    use crate::registry::{Action, ActionResult, CapabilityContext};
    use async_trait::async_trait;
    use serde_json::json;

    struct WhoAmI;

    #[async_trait]
    impl Action for WhoAmI {
        fn name(&self) -> &str {
            "whoami"
        }

        async fn execute(&self, ctx: CapabilityContext) -> ActionResult {
            ActionResult::ok(json!({
                "agent": ctx.call.agent_id,
                "team": ctx.call.metadata.get("team"),
            }))
        }
    }

    fn agent(config: AgentConfig) -> Agent {
        let registry = Arc::new(CapabilityRegistry::new(EventBus::new()));
        registry.register_action(Arc::new(WhoAmI), "core").unwrap();
        let tasks = TaskManager::new(&TaskManagerConfig::default(), AsyncOperationRunner::new());
        Agent::new(config, registry, tasks)
    }

    #[tokio::test]
    async fn test_calls_carry_agent_identity() {
        let agent = agent(AgentConfig::new("trader").with_metadata("team", json!("desk-1")));
        let out = agent.execute_action("core:whoami", json!({})).await.unwrap();
        assert_eq!(out["agent"], json!(agent.id()));
        assert_eq!(out["team"], json!("desk-1"));
    }

    #[tokio::test]
    async fn test_queue_task_names_work_after_agent() {
        let agent = agent(AgentConfig::new("trader"));
        let value = agent
            .queue_task(work_fn(|| async { Ok(json!(7)) }), TaskOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!(7));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: AgentConfig = serde_json::from_value(json!({
            "name": "watcher",
            "plugins": ["market"]
        }))
        .unwrap();
        assert_eq!(config.plugins, vec!["market"]);
        assert!(config.metadata.is_empty());
        assert!(config.description.is_none());
    }
}
