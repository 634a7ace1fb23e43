//! Dynamic Workflow
//!
//! Plan/execute/review loop: a plan agent produces a step-based execution
//! plan, the orchestrator runs it (parallel within a step, sequential
//! between steps), and a review agent checks completeness. Incomplete
//! results loop back through a replan agent; the loop is bounded by the
//! engine's superstep limit. Every terminal path streams its text and
//! yields it as the workflow output.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};

use super::engine::{Envelope, Executor, ExecutorContext, Selector, Workflow, WorkflowBuilder};
use super::schemas::{
    PlanAction, PlanStep, ReviewOutput, TriagePlanOutput, TriageReplanOutput, WorkflowInput,
};
use super::stream_agent_text;
use crate::services::agent::Agent;
use crate::services::agents::{
    create_clarify_agent, create_plan_agent, create_replan_agent, create_review_agent,
    create_summary_agent, prompts, SubAgentRegistry,
};
use crate::services::llm::{AgentModelMapping, ChatMessage, ClientProvider};
use crate::utils::error::{AppError, AppResult};

/// Result from a single agent execution within a plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub agent: String,
    pub question: String,
    pub response: String,
}

/// Results grouped by step number
pub type ExecutionResults = BTreeMap<u32, Vec<ExecutionResult>>;

/// Review feedback sent back to triage on the loop edge
#[derive(Debug, Clone)]
pub struct ReplanFeedback {
    pub missing_aspects: Vec<String>,
    pub suggested_approach: String,
}

/// Messages carried along the dynamic graph's edges
#[derive(Debug, Clone)]
pub enum DynamicMsg {
    Input(WorkflowInput),
    Plan(TriagePlanOutput),
    Replan(TriageReplanOutput),
    Review(ExecutionResults),
    ReplanRequest(ReplanFeedback),
}

fn format_execution_results(results: &ExecutionResults) -> String {
    let mut parts = Vec::new();
    for (step, step_results) in results {
        for result in step_results {
            parts.push(format!(
                "---\nStep {} | Agent: {}\nQuestion: {}\nResponse:\n{}\n---",
                step, result.agent, result.question, result.response
            ));
        }
    }
    if parts.is_empty() {
        "(No results)".to_string()
    } else {
        parts.join("\n")
    }
}

fn summary_prompt(original_query: &str, results: &ExecutionResults) -> String {
    format!(
        "Answer the user's question based on the collected data.\n\n\
## User's Question\n{}\n\n## Collected Data\n{}",
        original_query,
        format_execution_results(results)
    )
}

// ── Executors ───────────────────────────────────────────────────────────

/// Stores conversation context and forwards the input to triage.
struct StoreQuery;

#[async_trait]
impl Executor<DynamicMsg> for StoreQuery {
    fn id(&self) -> &str {
        "store_query"
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let DynamicMsg::Input(input) = envelope.payload else {
                continue;
            };
            ctx.set_state("original_query", &input.latest_user_query())
                .await;
            ctx.send_message(DynamicMsg::Input(input)).await;
        }
        Ok(())
    }
}

/// Unified triage executor: plan mode on user input, replan mode on review
/// feedback.
struct TriageExecutor {
    plan_agent: Arc<Agent>,
    replan_agent: Arc<Agent>,
    agent_keys: Vec<String>,
}

impl TriageExecutor {
    async fn handle_plan(
        &self,
        input: WorkflowInput,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        let prompt = format!(
            "Analyze this conversation and create an execution plan.\n\n\
## Conversation History\n{}\n\n\
Remember: same step number = parallel, different step numbers = sequential.",
            input.history_text()
        );
        let response = self.plan_agent.run(vec![ChatMessage::user(prompt)]).await?;
        let plan: TriagePlanOutput = serde_json::from_str(response.text.trim())
            .map_err(|e| AppError::SchemaViolation(format!("plan output: {}", e)))?;
        plan.validate_agents(&self.agent_keys)?;

        ctx.set_state("current_plan", &plan.plan).await;
        ctx.send_message(DynamicMsg::Plan(plan)).await;
        Ok(())
    }

    async fn handle_replan(
        &self,
        feedback: ReplanFeedback,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        let original_query: String = ctx.get_state("original_query").await.unwrap_or_default();
        let previous: ExecutionResults = ctx
            .get_state("execution_results")
            .await
            .unwrap_or_default();

        let prompt = format!(
            "The review agent found gaps in the response. Decide how to proceed.\n\n\
## Original Query\n{}\n\n## Previous Execution Results\n{}\n\n\
## Review Feedback\n- Missing aspects: {:?}\n- Suggested approach: {}",
            original_query,
            format_execution_results(&previous),
            feedback.missing_aspects,
            feedback.suggested_approach,
        );
        let response = self
            .replan_agent
            .run(vec![ChatMessage::user(prompt)])
            .await?;
        let replan: TriageReplanOutput = serde_json::from_str(response.text.trim())
            .map_err(|e| AppError::SchemaViolation(format!("replan output: {}", e)))?;
        replan.validate_agents(&self.agent_keys)?;

        ctx.send_message(DynamicMsg::Replan(replan)).await;
        Ok(())
    }
}

#[async_trait]
impl Executor<DynamicMsg> for TriageExecutor {
    fn id(&self) -> &str {
        "triage"
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            match envelope.payload {
                DynamicMsg::Input(input) => self.handle_plan(input, ctx).await?,
                DynamicMsg::ReplanRequest(feedback) => self.handle_replan(feedback, ctx).await?,
                _ => {}
            }
        }
        Ok(())
    }
}

/// Terminal executor for rejected queries.
struct RejectQuery {
    capabilities: String,
}

#[async_trait]
impl Executor<DynamicMsg> for RejectQuery {
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
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let DynamicMsg::Plan(plan) = envelope.payload else {
                continue;
            };
            let message = prompts::rejection_message(&plan.reject_reason, &self.capabilities);
            ctx.emit_update(message.clone()).await;
            ctx.yield_output(message).await;
        }
        Ok(())
    }
}

/// Terminal executor producing a clarification request for ambiguous
/// queries.
struct ClarifyExecutor {
    agent: Arc<Agent>,
}

#[async_trait]
impl Executor<DynamicMsg> for ClarifyExecutor {
    fn id(&self) -> &str {
        "clarify_executor"
    }

    fn yields_output(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let DynamicMsg::Plan(plan) = envelope.payload else {
                continue;
            };
            let original_query: String = ctx.get_state("original_query").await.unwrap_or_default();
            let prompt = format!(
                "The user asked: \"{}\"\n\n\
This query is related to data operations but is unclear or ambiguous.\n\
Reason: {}\n\nPlease provide a polite clarification request.",
                original_query, plan.reject_reason
            );
            let response = self.agent.run(vec![ChatMessage::user(prompt)]).await?;
            let clarify: super::schemas::ClarifyOutput = serde_json::from_str(response.text.trim())
                .map_err(|e| AppError::SchemaViolation(format!("clarify output: {}", e)))?;

            let interpretations = clarify
                .possible_interpretations
                .iter()
                .map(|i| format!("  - {}", i))
                .collect::<Vec<_>>()
                .join("\n");
            let message = format!(
                "{}\n\nPossible interpretations:\n{}",
                clarify.clarification_request, interpretations
            );
            ctx.yield_output(message).await;
        }
        Ok(())
    }
}

/// Executes plans with step-based parallelism: tasks sharing a step number
/// run concurrently, steps run in order, and step n+1 sees step n's
/// combined results as context.
struct DynamicOrchestrator {
    agents: std::collections::HashMap<String, Arc<Agent>>,
}

impl DynamicOrchestrator {
    async fn run_plan(
        &self,
        plan: &[PlanStep],
        carried_context: Option<&ExecutionResults>,
    ) -> AppResult<ExecutionResults> {
        let mut grouped: BTreeMap<u32, Vec<&PlanStep>> = BTreeMap::new();
        for task in plan {
            grouped.entry(task.step).or_default().push(task);
        }

        let mut all_results = ExecutionResults::new();
        for (step, tasks) in grouped {
            let previous = step
                .checked_sub(1)
                .and_then(|prev| all_results.get(&prev))
                .or_else(|| {
                    carried_context.and_then(|c| c.values().last())
                });
            let context = previous.map(|results| {
                let parts = results
                    .iter()
                    .map(|r| {
                        format!(
                            "---\nAgent: {}\nQuestion: {}\nResponse: {}\n---",
                            r.agent, r.question, r.response
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("Previous step results:\n{}", parts)
            });

            let step_futures = tasks.into_iter().map(|task| {
                let context = context.clone();
                async move {
                    let agent = self.agents.get(&task.agent).ok_or_else(|| {
                        AppError::SchemaViolation(format!("unknown agent '{}'", task.agent))
                    })?;
                    let message = match &context {
                        Some(context) => format!("{}\n\nYour task: {}", context, task.question),
                        None => task.question.clone(),
                    };
                    let response = agent.run(vec![ChatMessage::user(message)]).await?;
                    Ok::<_, AppError>(ExecutionResult {
                        agent: task.agent.clone(),
                        question: task.question.clone(),
                        response: response.text,
                    })
                }
            });

            all_results.insert(step, try_join_all(step_futures).await?);
        }
        Ok(all_results)
    }
}

#[async_trait]
impl Executor<DynamicMsg> for DynamicOrchestrator {
    fn id(&self) -> &str {
        "orchestrator"
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            match envelope.payload {
                DynamicMsg::Plan(plan) => {
                    let results = self.run_plan(&plan.plan, None).await?;
                    ctx.set_state("execution_results", &results).await;
                    ctx.send_message(DynamicMsg::Review(results)).await;
                }
                DynamicMsg::Replan(replan) => {
                    let previous: ExecutionResults = ctx
                        .get_state("execution_results")
                        .await
                        .unwrap_or_default();
                    let new_results = self.run_plan(&replan.new_plan, Some(&previous)).await?;

                    // Merge behind the existing steps so the combined
                    // record keeps its order.
                    let offset = previous.keys().max().copied().unwrap_or(0);
                    let mut merged = previous;
                    for (step, results) in new_results {
                        merged.insert(offset + step, results);
                    }

                    ctx.set_state("execution_results", &merged).await;
                    ctx.send_message(DynamicMsg::Review(merged)).await;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Reviews execution results; streams the summary when complete, loops
/// back to triage otherwise.
///
/// Two separate LLM calls on purpose: one completion cannot produce both
/// schema-constrained JSON and a user-facing token stream.
struct ReviewExecutor {
    review_agent: Arc<Agent>,
    summary_agent: Arc<Agent>,
}

#[async_trait]
impl Executor<DynamicMsg> for ReviewExecutor {
    fn id(&self) -> &str {
        "review_executor"
    }

    fn streams_output(&self) -> bool {
        true
    }

    fn yields_output(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let DynamicMsg::Review(results) = envelope.payload else {
                continue;
            };
            let original_query: String = ctx.get_state("original_query").await.unwrap_or_default();

            let prompt = format!(
                "## Review Request\n\n## Original User Query\n{}\n\n\
## Execution Results\n{}\n\n\
## Instructions\nEvaluate whether the execution results fully answer the user's query.",
                original_query,
                format_execution_results(&results)
            );
            let response = self
                .review_agent
                .run(vec![ChatMessage::user(prompt)])
                .await?;
            let review: ReviewOutput = serde_json::from_str(response.text.trim())
                .map_err(|e| AppError::SchemaViolation(format!("review output: {}", e)))?;

            if review.is_complete {
                let prompt = summary_prompt(&original_query, &results);
                let summary =
                    stream_agent_text(&self.summary_agent, vec![ChatMessage::user(prompt)], ctx)
                        .await?;
                if !summary.text.is_empty() {
                    ctx.yield_output(summary.text).await;
                }
            } else {
                ctx.send_message(DynamicMsg::ReplanRequest(ReplanFeedback {
                    missing_aspects: review.missing_aspects,
                    suggested_approach: review.suggested_approach,
                }))
                .await;
            }
        }
        Ok(())
    }
}

/// Streams existing aggregated results as the final answer when replan
/// rejects the review.
struct StreamingSummaryExecutor {
    summary_agent: Arc<Agent>,
}

#[async_trait]
impl Executor<DynamicMsg> for StreamingSummaryExecutor {
    fn id(&self) -> &str {
        "streaming_summary"
    }

    fn streams_output(&self) -> bool {
        true
    }

    fn yields_output(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        inputs: Vec<Envelope<DynamicMsg>>,
        ctx: &ExecutorContext<DynamicMsg>,
    ) -> AppResult<()> {
        for envelope in inputs {
            let DynamicMsg::Replan(_) = envelope.payload else {
                continue;
            };
            let original_query: String = ctx.get_state("original_query").await.unwrap_or_default();
            let results: ExecutionResults = ctx
                .get_state("execution_results")
                .await
                .unwrap_or_default();

            if results.is_empty() {
                ctx.emit_update(prompts::EMPTY_RESULTS_MESSAGE).await;
                ctx.yield_output(prompts::EMPTY_RESULTS_MESSAGE).await;
                continue;
            }

            let prompt = summary_prompt(&original_query, &results);
            let summary =
                stream_agent_text(&self.summary_agent, vec![ChatMessage::user(prompt)], ctx)
                    .await?;
            if !summary.text.is_empty() {
                ctx.yield_output(summary.text).await;
            }
        }
        Ok(())
    }
}

// ── Factory ─────────────────────────────────────────────────────────────

/// Build the dynamic workflow graph for one request.
///
/// The replan loop (review -> triage -> orchestrator -> review) is bounded
/// by the engine's superstep limit; ten supersteps allow one full retry
/// cycle with room to spare while preventing unbounded loops.
pub fn create_dynamic_workflow(
    provider: &Arc<dyn ClientProvider>,
    subagents: &SubAgentRegistry,
    workflow_model: &str,
    mapping: Option<&AgentModelMapping>,
) -> AppResult<Workflow<DynamicMsg>> {
    if !subagents.has_agents() {
        return Err(AppError::config("no sub-agents configured"));
    }

    let plan_agent = create_plan_agent(provider, subagents, workflow_model, mapping)?;
    let replan_agent = create_replan_agent(provider, subagents, workflow_model, mapping)?;
    let review_agent = create_review_agent(provider, workflow_model, mapping)?;
    let clarify_agent = create_clarify_agent(provider, workflow_model, mapping)?;
    let summary_agent = create_summary_agent(provider, workflow_model, mapping)?;
    let sub_agent_map = subagents.create_agents(provider, workflow_model, mapping)?;

    let store_query: Arc<dyn Executor<DynamicMsg>> = Arc::new(StoreQuery);
    let triage: Arc<dyn Executor<DynamicMsg>> = Arc::new(TriageExecutor {
        plan_agent,
        replan_agent,
        agent_keys: subagents.agent_keys(),
    });
    let clarify: Arc<dyn Executor<DynamicMsg>> = Arc::new(ClarifyExecutor {
        agent: clarify_agent,
    });
    let reject: Arc<dyn Executor<DynamicMsg>> = Arc::new(RejectQuery {
        capabilities: subagents.capabilities_summary(),
    });
    let orchestrator: Arc<dyn Executor<DynamicMsg>> = Arc::new(DynamicOrchestrator {
        agents: sub_agent_map,
    });
    let review: Arc<dyn Executor<DynamicMsg>> = Arc::new(ReviewExecutor {
        review_agent,
        summary_agent: Arc::clone(&summary_agent),
    });
    let streaming_summary: Arc<dyn Executor<DynamicMsg>> = Arc::new(StreamingSummaryExecutor {
        summary_agent,
    });

    // Unified routing for both plan and replan outputs.
    // Target order: [clarify_executor, reject_query, orchestrator, streaming_summary]
    let select_triage_path: Selector<DynamicMsg> = Arc::new(|message, targets| {
        let clarify_id = targets[0].clone();
        let reject_id = targets[1].clone();
        let orchestrator_id = targets[2].clone();
        let streaming_id = targets[3].clone();
        match message {
            DynamicMsg::Plan(plan) => match plan.action {
                PlanAction::Clarify => vec![clarify_id],
                PlanAction::Reject => vec![reject_id],
                PlanAction::Plan => vec![orchestrator_id],
            },
            DynamicMsg::Replan(replan) => {
                if replan.accept_review && !replan.new_plan.is_empty() {
                    vec![orchestrator_id]
                } else {
                    vec![streaming_id]
                }
            }
            _ => Vec::new(),
        }
    });

    WorkflowBuilder::new("Dynamic Ops Workflow")
        .max_iterations(10)
        .set_start_executor(Arc::clone(&store_query))
        .add_edge(&store_query, &triage)
        .add_multi_selection_edge_group(
            &triage,
            vec![
                Arc::clone(&clarify),
                Arc::clone(&reject),
                Arc::clone(&orchestrator),
                Arc::clone(&streaming_summary),
            ],
            select_triage_path,
        )
        .add_edge(&orchestrator, &review)
        // The loop edge: incomplete reviews re-enter triage in replan mode.
        .add_edge(&review, &triage)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_execution_results_ordering() {
        let mut results = ExecutionResults::new();
        results.insert(
            2,
            vec![ExecutionResult {
                agent: "log_analytics".into(),
                question: "q2".into(),
                response: "r2".into(),
            }],
        );
        results.insert(
            1,
            vec![ExecutionResult {
                agent: "servicenow".into(),
                question: "q1".into(),
                response: "r1".into(),
            }],
        );
        let formatted = format_execution_results(&results);
        let pos1 = formatted.find("Step 1").unwrap();
        let pos2 = formatted.find("Step 2").unwrap();
        assert!(pos1 < pos2);
    }

    #[test]
    fn test_format_empty_results() {
        assert_eq!(format_execution_results(&ExecutionResults::new()), "(No results)");
    }
}
