//! Structured-output schemas for the orchestration agents.
//!
//! The JSON schemas handed to the LLM are built at workflow-construction
//! time from the registered sub-agent set, so the `agent` fields validate
//! against exactly the agents this deployment knows about. Adding an agent
//! requires no change here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::utils::error::{AppError, AppResult};

// ── Triage workflow ─────────────────────────────────────────────────────

/// A single task assignment to a specialized agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub question: String,
    pub agent: String,
}

/// Structured output from the triage agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageOutput {
    pub should_reject: bool,
    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub tasks: Vec<TaskAssignment>,
}

/// JSON schema for [`TriageOutput`] with `agent` constrained to the
/// registered sub-agent keys.
pub fn triage_output_schema(agent_keys: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "should_reject": {"type": "boolean"},
            "reject_reason": {"type": "string"},
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "question": {"type": "string"},
                        "agent": {"type": "string", "enum": agent_keys},
                    },
                    "required": ["question", "agent"],
                },
            },
        },
        "required": ["should_reject", "reject_reason", "tasks"],
    })
}

impl TriageOutput {
    /// Reject task assignments naming agents outside the registered set.
    pub fn validate_agents(&self, agent_keys: &[String]) -> AppResult<()> {
        for task in &self.tasks {
            if !agent_keys.contains(&task.agent) {
                return Err(AppError::SchemaViolation(format!(
                    "triage assigned unknown agent '{}'",
                    task.agent
                )));
            }
        }
        Ok(())
    }
}

// ── Dynamic workflow: plan ──────────────────────────────────────────────

/// Action chosen by the plan agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Plan,
    Clarify,
    Reject,
}

/// A single step in the execution plan. Tasks sharing a step number run in
/// parallel; distinct step numbers run sequentially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: u32,
    pub agent: String,
    pub question: String,
}

/// Output from the plan agent on the initial query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriagePlanOutput {
    pub action: PlanAction,
    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub plan_reason: String,
}

pub fn triage_plan_schema(agent_keys: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": {"type": "string", "enum": ["plan", "clarify", "reject"]},
            "reject_reason": {"type": "string"},
            "plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "step": {"type": "integer", "minimum": 1},
                        "agent": {"type": "string", "enum": agent_keys},
                        "question": {"type": "string"},
                    },
                    "required": ["step", "agent", "question"],
                },
            },
            "plan_reason": {"type": "string"},
        },
        "required": ["action", "reject_reason", "plan", "plan_reason"],
    })
}

impl TriagePlanOutput {
    pub fn validate_agents(&self, agent_keys: &[String]) -> AppResult<()> {
        validate_plan_agents(&self.plan, agent_keys)
    }
}

fn validate_plan_agents(plan: &[PlanStep], agent_keys: &[String]) -> AppResult<()> {
    for step in plan {
        if !agent_keys.contains(&step.agent) {
            return Err(AppError::SchemaViolation(format!(
                "plan step {} references unknown agent '{}'",
                step.step, step.agent
            )));
        }
    }
    Ok(())
}

// ── Dynamic workflow: replan ────────────────────────────────────────────

/// Output from the replan agent after review feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageReplanOutput {
    /// Whether the review's gap is genuine and addressable
    pub accept_review: bool,
    #[serde(default)]
    pub new_plan: Vec<PlanStep>,
    /// Why the current answer is sufficient when the review is rejected
    #[serde(default)]
    pub rejection_reason: String,
}

pub fn triage_replan_schema(agent_keys: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "accept_review": {"type": "boolean"},
            "new_plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "step": {"type": "integer", "minimum": 1},
                        "agent": {"type": "string", "enum": agent_keys},
                        "question": {"type": "string"},
                    },
                    "required": ["step", "agent", "question"],
                },
            },
            "rejection_reason": {"type": "string"},
        },
        "required": ["accept_review", "new_plan", "rejection_reason"],
    })
}

impl TriageReplanOutput {
    pub fn validate_agents(&self, agent_keys: &[String]) -> AppResult<()> {
        validate_plan_agents(&self.new_plan, agent_keys)
    }
}

// ── Review & clarify ────────────────────────────────────────────────────

/// Structured output from the review agent.
///
/// Deliberately has no summary field: when `is_complete` the streaming
/// summary agent produces the user-facing text in a second call, because
/// one completion cannot provide both JSON and a token stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutput {
    pub is_complete: bool,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    #[serde(default)]
    pub suggested_approach: String,
    #[serde(default)]
    pub confidence: f64,
}

pub fn review_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "is_complete": {"type": "boolean"},
            "missing_aspects": {"type": "array", "items": {"type": "string"}},
            "suggested_approach": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
        },
        "required": ["is_complete", "missing_aspects", "suggested_approach", "confidence"],
    })
}

/// Structured output from the clarify agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarifyOutput {
    pub clarification_request: String,
    #[serde(default)]
    pub possible_interpretations: Vec<String>,
}

pub fn clarify_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "clarification_request": {"type": "string"},
            "possible_interpretations": {"type": "array", "items": {"type": "string"}},
        },
        "required": ["clarification_request", "possible_interpretations"],
    })
}

/// Structured output from the memory summarization agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySummaryOutput {
    pub summary: String,
}

pub fn memory_summary_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
        },
        "required": ["summary"],
    })
}

// ── Workflow input ──────────────────────────────────────────────────────

/// A prior conversation turn handed to a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub text: String,
}

/// Standard input for both workflows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub messages: Vec<ChatTurn>,
}

impl WorkflowInput {
    pub fn from_query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            messages: Vec::new(),
        }
    }

    /// The latest user turn, falling back to the bare query.
    pub fn latest_user_query(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.text.clone())
            .unwrap_or_else(|| self.query.clone())
    }

    /// Conversation rendered one turn per line for prompt building.
    pub fn history_text(&self) -> String {
        if self.messages.is_empty() {
            return format!("[user]: {}", self.query);
        }
        self.messages
            .iter()
            .map(|m| format!("[{}]: {}", m.role, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<String> {
        vec![
            "servicenow".to_string(),
            "log_analytics".to_string(),
            "service_health".to_string(),
        ]
    }

    #[test]
    fn test_triage_output_parse_and_validate() {
        let raw = r#"{
            "should_reject": false,
            "reject_reason": "",
            "tasks": [{"question": "Check INC123", "agent": "servicenow"}]
        }"#;
        let output: TriageOutput = serde_json::from_str(raw).unwrap();
        assert!(output.validate_agents(&keys()).is_ok());

        let bad = TriageOutput {
            should_reject: false,
            reject_reason: String::new(),
            tasks: vec![TaskAssignment {
                question: "x".into(),
                agent: "haiku_writer".into(),
            }],
        };
        assert!(matches!(
            bad.validate_agents(&keys()),
            Err(AppError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_schema_embeds_agent_enum() {
        let schema = triage_output_schema(&keys());
        let enum_values = &schema["properties"]["tasks"]["items"]["properties"]["agent"]["enum"];
        assert_eq!(enum_values.as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_plan_action_parses_lowercase() {
        let output: TriagePlanOutput = serde_json::from_str(
            r#"{"action": "plan", "plan": [{"step": 1, "agent": "servicenow", "question": "q"}]}"#,
        )
        .unwrap();
        assert_eq!(output.action, PlanAction::Plan);
        assert!(output.validate_agents(&keys()).is_ok());
    }

    #[test]
    fn test_replan_defaults() {
        let output: TriageReplanOutput =
            serde_json::from_str(r#"{"accept_review": false}"#).unwrap();
        assert!(!output.accept_review);
        assert!(output.new_plan.is_empty());
        assert!(output.rejection_reason.is_empty());
    }

    #[test]
    fn test_review_output_defaults() {
        let output: ReviewOutput = serde_json::from_str(r#"{"is_complete": true}"#).unwrap();
        assert!(output.is_complete);
        assert!(output.missing_aspects.is_empty());
    }

    #[test]
    fn test_workflow_input_latest_query() {
        let input = WorkflowInput {
            query: String::new(),
            messages: vec![
                ChatTurn {
                    role: "user".into(),
                    text: "first".into(),
                },
                ChatTurn {
                    role: "assistant".into(),
                    text: "reply".into(),
                },
                ChatTurn {
                    role: "user".into(),
                    text: "second".into(),
                },
            ],
        };
        assert_eq!(input.latest_user_query(), "second");
        assert!(input.history_text().contains("[assistant]: reply"));
    }
}
