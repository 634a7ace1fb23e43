//! Triage Workflow
//!
//! Classification routing: the triage agent splits the query into tasks,
//! a dispatcher fans them out to the specialist agents, an aggregator
//! fans the responses back in, and a streaming summary agent produces the
//! user-facing answer. Rejected queries short-circuit to a capability
//! summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::engine::{Envelope, Executor, ExecutorContext, Selector, Workflow, WorkflowBuilder};
use super::schemas::{TriageOutput, WorkflowInput};
use super::stream_agent_text;
use crate::services::agent::Agent;
use crate::services::agents::{create_summary_agent, create_triage_agent, prompts, SubAgentRegistry};
use crate::services::llm::{AgentModelMapping, ChatMessage, ClientProvider};
use crate::utils::error::{AppError, AppResult};

/// Messages carried along the triage graph's edges
#[derive(Debug, Clone)]
pub enum TriageMsg {
    /// The user query plus conversation context
    Input(WorkflowInput),
    /// Parsed triage classification
    Triage(TriageOutput),
    /// Task batch for one sub-agent
    Tasks { agent: String, questions: Vec<String> },
    /// One sub-agent's response section
    Section { executor_id: String, text: String },
    /// Fan-in result: all sections joined
    Aggregated(String),
}

// ── Executors ───────────────────────────────────────────────────────────

/// Stores conversation context in shared state and forwards the input.
struct StoreQuery;

#[async_trait]
impl Executor<TriageMsg> for StoreQuery {
    fn id(&self) -> &str {
        "store_query"
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let TriageMsg::Input(input) = envelope.payload else {
                continue;
            };
            ctx.set_state("original_query", &input.latest_user_query())
                .await;
            ctx.send_message(TriageMsg::Input(input)).await;
        }
        Ok(())
    }
}

/// Runs the triage agent and parses its classification.
struct TriageAgentExecutor {
    agent: Arc<Agent>,
    agent_keys: Vec<String>,
}

#[async_trait]
impl Executor<TriageMsg> for TriageAgentExecutor {
    fn id(&self) -> &str {
        "triage_agent"
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let TriageMsg::Input(input) = envelope.payload else {
                continue;
            };
            let response = self
                .agent
                .run(vec![ChatMessage::user(input.history_text())])
                .await?;
            let triage: TriageOutput = serde_json::from_str(response.text.trim())
                .map_err(|e| AppError::SchemaViolation(format!("triage output: {}", e)))?;
            triage.validate_agents(&self.agent_keys)?;

            ctx.set_state("tasks", &triage.tasks).await;
            ctx.send_message(TriageMsg::Triage(triage)).await;
        }
        Ok(())
    }
}

/// Terminal executor for rejected queries. Emits the rejection text as a
/// single update and as the final output so the downstream path is uniform.
struct RejectQuery {
    capabilities: String,
}

#[async_trait]
impl Executor<TriageMsg> for RejectQuery {
    fn id(&self) -> &str {
        "reject_query"
    }

    fn streams_output(&self) -> bool {
        true
    }

    fn yields_output(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let TriageMsg::Triage(triage) = envelope.payload else {
                continue;
            };
            let message = prompts::rejection_message(&triage.reject_reason, &self.capabilities);
            ctx.emit_update(message.clone()).await;
            ctx.yield_output(message).await;
        }
        Ok(())
    }
}

/// Splits tasks by agent key and fans them out, annotated with the fan-in
/// cardinality the aggregator should wait for.
struct DispatchToAgents;

#[async_trait]
impl Executor<TriageMsg> for DispatchToAgents {
    fn id(&self) -> &str {
        "dispatch_to_agents"
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let TriageMsg::Triage(triage) = envelope.payload else {
                continue;
            };
            let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for task in triage.tasks {
                grouped.entry(task.agent).or_default().push(task.question);
            }
            let expected = grouped.len();
            for (agent, questions) in grouped {
                ctx.send_message_expecting(TriageMsg::Tasks { agent, questions }, expected)
                    .await;
            }
        }
        Ok(())
    }
}

/// Wraps one specialist agent; answers its task batch as a section.
struct SubAgentExecutor {
    executor_id: String,
    agent: Arc<Agent>,
}

#[async_trait]
impl Executor<TriageMsg> for SubAgentExecutor {
    fn id(&self) -> &str {
        &self.executor_id
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let expected = envelope.expected_responses.unwrap_or(1);
            let TriageMsg::Tasks { questions, .. } = envelope.payload else {
                continue;
            };

            let combined = if questions.len() > 1 {
                questions
                    .iter()
                    .map(|q| format!("- {}", q))
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                questions.into_iter().next().unwrap_or_default()
            };

            let response = self.agent.run(vec![ChatMessage::user(combined)]).await?;
            ctx.send_message_expecting(
                TriageMsg::Section {
                    executor_id: self.executor_id.clone(),
                    text: response.text,
                },
                expected,
            )
            .await;
        }
        Ok(())
    }
}

/// Fan-in: concatenates non-empty sections, one per agent.
struct AggregateResponses;

/// "servicenow_executor" -> "Servicenow"
fn section_title(executor_id: &str) -> String {
    executor_id
        .trim_end_matches("_executor")
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Executor<TriageMsg> for AggregateResponses {
    fn id(&self) -> &str {
        "aggregate_responses"
    }

    fn fan_in(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        let mut sections = Vec::new();
        for envelope in inputs {
            let TriageMsg::Section { executor_id, text } = envelope.payload else {
                continue;
            };
            if !text.is_empty() {
                sections.push(format!("## {}\n{}", section_title(&executor_id), text));
            }
        }
        ctx.send_message(TriageMsg::Aggregated(sections.join("\n\n---\n\n")))
            .await;
        Ok(())
    }
}

/// Streams the final answer synthesized from the aggregated sections.
struct SummaryExecutor {
    agent: Arc<Agent>,
}

#[async_trait]
impl Executor<TriageMsg> for SummaryExecutor {
    fn id(&self) -> &str {
        "summary_agent"
    }

    fn streams_output(&self) -> bool {
        true
    }

    fn yields_output(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<TriageMsg>>,
        ctx: &ExecutorContext<TriageMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let TriageMsg::Aggregated(consolidated) = envelope.payload else {
                continue;
            };
            let original_query: String = ctx.get_state("original_query").await.unwrap_or_default();
            let prompt = format!(
                "Answer the user's question based on collected data.\n\n\
## User's Question\n{original_query}\n\n## Collected Data\n{consolidated}"
            );

            let response =
                stream_agent_text(&self.agent, vec![ChatMessage::user(prompt)], ctx).await?;
            if !response.text.is_empty() {
                ctx.yield_output(response.text).await;
            }
        }
        Ok(())
    }
}

// ── Factory ─────────────────────────────────────────────────────────────

/// Build the triage workflow graph for one request.
pub fn create_triage_workflow(
    provider: &Arc<dyn ClientProvider>,
    subagents: &SubAgentRegistry,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Workflow<TriageMsg>> {
    if !subagents.has_agents() {
        return Err(AppError::config("no sub-agents configured"));
    }

    let triage_agent = create_triage_agent(provider, subagents, workflow_model, mapping)?;
    let summary_agent = create_summary_agent(provider, workflow_model, mapping)?;
    let sub_agent_map = subagents.create_agents(provider, workflow_model, mapping)?;

    let store_query: Arc<dyn Executor<TriageMsg>> = Arc::new(StoreQuery);
    let triage_executor: Arc<dyn Executor<TriageMsg>> = Arc::new(TriageAgentExecutor {
        agent: triage_agent,
        agent_keys: subagents.agent_keys(),
    });
    let reject_query: Arc<dyn Executor<TriageMsg>> = Arc::new(RejectQuery {
        capabilities: subagents.capabilities_summary(),
    });
    let dispatcher: Arc<dyn Executor<TriageMsg>> = Arc::new(DispatchToAgents);
    let aggregator: Arc<dyn Executor<TriageMsg>> = Arc::new(AggregateResponses);
    let summary: Arc<dyn Executor<TriageMsg>> = Arc::new(SummaryExecutor {
        agent: summary_agent,
    });

    let agent_executors: Vec<Arc<dyn Executor<TriageMsg>>> = subagents
        .agent_keys()
        .into_iter()
        .map(|key| {
            let agent = Arc::clone(&sub_agent_map[&key]);
            Arc::new(SubAgentExecutor {
                executor_id: SubAgentRegistry::executor_id(&key),
                agent,
            }) as Arc<dyn Executor<TriageMsg>>
        })
        .collect();

    // An empty task list with should_reject = false also takes the reject
    // branch; there is nothing to dispatch.
    let dispatch_or_reject: Selector<TriageMsg> = Arc::new(|message, targets| {
        let (dispatch_id, reject_id) = (targets[0].clone(), targets[1].clone());
        match message {
            TriageMsg::Triage(triage) if triage.should_reject || triage.tasks.is_empty() => {
                vec![reject_id]
            }
            TriageMsg::Triage(_) => vec![dispatch_id],
            _ => Vec::new(),
        }
    });

    // Task batches route to the executor owning their agent key.
    let route_tasks: Selector<TriageMsg> = Arc::new(|message, _targets| match message {
        TriageMsg::Tasks { agent, .. } => vec![SubAgentRegistry::executor_id(agent)],
        _ => Vec::new(),
    });

    WorkflowBuilder::new("Ops Triage Workflow")
        .max_iterations(10)
        .set_start_executor(Arc::clone(&store_query))
        .add_edge(&store_query, &triage_executor)
        .add_multi_selection_edge_group(
            &triage_executor,
            vec![Arc::clone(&dispatcher), Arc::clone(&reject_query)],
            dispatch_or_reject,
        )
        .add_multi_selection_edge_group(&dispatcher, agent_executors.clone(), route_tasks)
        .add_fan_in_edges(agent_executors, &aggregator)
        .add_edge(&aggregator, &summary)
        .build()
}
