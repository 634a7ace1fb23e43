//! Sub-Agent Registry
//!
//! The configurable set of specialist agents behind the triage and dynamic
//! workflows. Workflow schemas, routing tables, and capability summaries
//! are all derived from this registry, so onboarding a new sub-agent means
//! adding one spec here and nothing in the workflow code.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use super::prompts;
use crate::services::agent::{Agent, AgentConfig};
use crate::services::llm::{model_for, AgentModelMapping, ClientProvider};
use crate::services::tools::{ops, ToolRegistry};
use crate::utils::error::AppResult;

type ToolBuilder = fn(Arc<Semaphore>) -> ToolRegistry;

/// Static description of one specialist agent
pub struct SubAgentSpec {
    /// Routing key used in plans and task assignments ("servicenow")
    pub key: &'static str,
    /// Display/event name ("servicenow-agent")
    pub agent_name: &'static str,
    /// One-line capability description fed into orchestration prompts
    pub description: &'static str,
    pub instructions: &'static str,
    tools: ToolBuilder,
}

/// Registry of specialist agents sharing one tool worker pool.
pub struct SubAgentRegistry {
    specs: Vec<SubAgentSpec>,
    permits: Arc<Semaphore>,
}

impl SubAgentRegistry {
    /// The built-in ops set: ServiceNow, log analytics, service health.
    pub fn default_ops(permits: Arc<Semaphore>) -> Self {
        Self {
            specs: vec![
                SubAgentSpec {
                    key: "servicenow",
                    agent_name: "servicenow-agent",
                    description: "ServiceNow operations (change requests, incidents)",
                    instructions: prompts::SERVICENOW_INSTRUCTIONS,
                    tools: ops::servicenow_tools,
                },
                SubAgentSpec {
                    key: "log_analytics",
                    agent_name: "log-analytics-agent",
                    description: "Data pipeline monitoring (run status, failures, details)",
                    instructions: prompts::LOG_ANALYTICS_INSTRUCTIONS,
                    tools: ops::log_analytics_tools,
                },
                SubAgentSpec {
                    key: "service_health",
                    agent_name: "service-health-agent",
                    description: "Service health checks (Databricks, Snowflake, Azure)",
                    instructions: prompts::SERVICE_HEALTH_INSTRUCTIONS,
                    tools: ops::service_health_tools,
                },
            ],
            permits,
        }
    }

    pub fn has_agents(&self) -> bool {
        !self.specs.is_empty()
    }

    pub fn specs(&self) -> &[SubAgentSpec] {
        &self.specs
    }

    /// Routing keys, in registration order.
    pub fn agent_keys(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.key.to_string()).collect()
    }

    /// Executor id a sub-agent key maps to in the workflow graph.
    pub fn executor_id(key: &str) -> String {
        format!("{}_executor", key)
    }

    /// Capability listing for orchestration prompts and rejection messages.
    pub fn capabilities_summary(&self) -> String {
        self.specs
            .iter()
            .map(|s| format!("- {}: {}", s.key, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Instantiate every sub-agent with its resolved model and tool set.
    pub fn create_agents(
        &self,
        provider: &Arc<dyn ClientProvider>,
        workflow_model: &str,
        mapping: Option<&AgentModelMapping>,
    ) -> AppResult<HashMap<String, Arc<Agent>>> {
        let mut agents = HashMap::new();
        for spec in &self.specs {
            let model = model_for(spec.key, mapping, workflow_model);
            let client = provider.client_for(model)?;
            let tools = Arc::new((spec.tools)(Arc::clone(&self.permits)));
            let agent = Agent::new(
                AgentConfig::new(spec.agent_name, spec.instructions),
                client,
                Some(tools),
            );
            agents.insert(spec.key.to_string(), Arc::new(agent));
        }
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ops_registry() {
        let registry = SubAgentRegistry::default_ops(ToolRegistry::shared_permits());
        assert!(registry.has_agents());
        assert_eq!(
            registry.agent_keys(),
            vec!["servicenow", "log_analytics", "service_health"]
        );
        let summary = registry.capabilities_summary();
        assert!(summary.contains("- servicenow:"));
        assert!(summary.contains("Snowflake"));
    }

    #[test]
    fn test_executor_id_mapping() {
        assert_eq!(
            SubAgentRegistry::executor_id("servicenow"),
            "servicenow_executor"
        );
    }
}
