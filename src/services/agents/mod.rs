//! Agent catalog: orchestration agent constructors and the sub-agent
//! registry.

pub mod prompts;
pub mod registry;

pub use registry::{SubAgentRegistry, SubAgentSpec};

use std::sync::Arc;

use crate::services::agent::{Agent, AgentConfig};
use crate::services::llm::{model_for, AgentModelMapping, ClientProvider};
use crate::services::workflow::schemas;
use crate::utils::error::AppResult;

/// Agent keys of the triage workflow set, for `GET /api/agents`.
pub fn triage_agent_keys(registry: &SubAgentRegistry) -> Vec<String> {
    let mut keys = vec!["triage".to_string()];
    keys.extend(registry.agent_keys());
    keys.push("summary".to_string());
    keys
}

/// Agent keys of the dynamic workflow set.
pub fn dynamic_agent_keys(registry: &SubAgentRegistry) -> Vec<String> {
    let mut keys = vec![
        "plan".to_string(),
        "replan".to_string(),
        "review".to_string(),
        "clarify".to_string(),
    ];
    keys.extend(registry.agent_keys());
    keys.push("summary".to_string());
    keys
}

fn build(
    provider: &Arc<dyn ClientProvider>,
    agent_key: &str,
    mapping: Option<&AgentModelMapping>,
    workflow_model: &str,
    config: AgentConfig,
) -> AppResult<Arc<Agent>> {
    let model = model_for(agent_key, mapping, workflow_model);
    let client = provider.client_for(model)?;
    Ok(Arc::new(Agent::new(config, client, None)))
}

pub fn create_triage_agent(
    provider: &Arc<dyn ClientProvider>,
    registry: &SubAgentRegistry,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Arc<Agent>> {
    let schema = schemas::triage_output_schema(&registry.agent_keys());
    build(
        provider,
        "triage",
        mapping,
        workflow_model,
        AgentConfig::new(
            "triage-agent",
            prompts::triage_instructions(&registry.capabilities_summary()),
        )
        .with_schema(schema)
        .orchestration(),
    )
}

pub fn create_plan_agent(
    provider: &Arc<dyn ClientProvider>,
    registry: &SubAgentRegistry,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Arc<Agent>> {
    let schema = schemas::triage_plan_schema(&registry.agent_keys());
    build(
        provider,
        "plan",
        mapping,
        workflow_model,
        AgentConfig::new(
            "plan-agent",
            prompts::plan_instructions(&registry.capabilities_summary()),
        )
        .with_schema(schema)
        .orchestration(),
    )
}

pub fn create_replan_agent(
    provider: &Arc<dyn ClientProvider>,
    registry: &SubAgentRegistry,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Arc<Agent>> {
    let schema = schemas::triage_replan_schema(&registry.agent_keys());
    build(
        provider,
        "replan",
        mapping,
        workflow_model,
        AgentConfig::new(
            "replan-agent",
            prompts::replan_instructions(&registry.capabilities_summary()),
        )
        .with_schema(schema)
        .orchestration(),
    )
}

pub fn create_review_agent(
    provider: &Arc<dyn ClientProvider>,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Arc<Agent>> {
    build(
        provider,
        "review",
        mapping,
        workflow_model,
        AgentConfig::new("review-agent", prompts::REVIEW_INSTRUCTIONS)
            .with_schema(schemas::review_schema())
            .orchestration(),
    )
}

pub fn create_clarify_agent(
    provider: &Arc<dyn ClientProvider>,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Arc<Agent>> {
    build(
        provider,
        "clarify",
        mapping,
        workflow_model,
        AgentConfig::new("clarify-agent", prompts::CLARIFY_INSTRUCTIONS)
            .with_schema(schemas::clarify_schema())
            .orchestration(),
    )
}

pub fn create_summary_agent(
    provider: &Arc<dyn ClientProvider>,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Arc<Agent>> {
    build(
        provider,
        "summary",
        mapping,
        workflow_model,
        AgentConfig::new("summary-agent", prompts::SUMMARY_INSTRUCTIONS).orchestration(),
    )
}

pub fn create_memory_agent(
    provider: &Arc<dyn ClientProvider>,
    memory_model: &str,
) -> AppResult<Arc<Agent>> {
    build(
        provider,
        "memory",
        None,
        memory_model,
        AgentConfig::new("memory-agent", prompts::MEMORY_INSTRUCTIONS)
            .with_schema(schemas::memory_summary_schema()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tools::ToolRegistry;

    #[test]
    fn test_agent_key_sets() {
        let registry = SubAgentRegistry::default_ops(ToolRegistry::shared_permits());
        let triage = triage_agent_keys(&registry);
        assert_eq!(triage.first().map(String::as_str), Some("triage"));
        assert!(triage.contains(&"servicenow".to_string()));
        assert!(!triage.contains(&"review".to_string()));

        let dynamic = dynamic_agent_keys(&registry);
        assert!(dynamic.contains(&"plan".to_string()));
        assert!(dynamic.contains(&"replan".to_string()));
        assert!(dynamic.contains(&"service_health".to_string()));
    }
}
