//! Dynamic (plan/review loop) workflow integration tests.

mod common;

use common::{MockProvider, RoutedClient};
use serde_json::json;

use opschat::services::agents::SubAgentRegistry;
use opschat::services::tools::ToolRegistry;
use opschat::services::workflow::dynamic::{create_dynamic_workflow, DynamicMsg};
use opschat::services::workflow::{WorkflowEvent, WorkflowInput, WorkflowRunResult};

async fn run_dynamic(client: &std::sync::Arc<RoutedClient>, query: &str) -> WorkflowRunResult {
    let provider = MockProvider::new(std::sync::Arc::clone(client));
    let subagents = SubAgentRegistry::default_ops(ToolRegistry::shared_permits());
    let workflow = create_dynamic_workflow(&provider, &subagents, "gpt-4.1", None).unwrap();
    workflow
        .run_collect(DynamicMsg::Input(WorkflowInput::from_query(query)))
        .await
}

fn executor_invocations(result: &WorkflowRunResult, executor_id: &str) -> usize {
    result
        .events
        .iter()
        .filter(
            |e| matches!(e, WorkflowEvent::ExecutorInvoked { executor_id: id } if id == executor_id),
        )
        .count()
}

/// Seed scenario: plan with one parallel step, review passes first time.
#[tokio::test]
async fn dynamic_single_pass_plan_review_summary() {
    let client = RoutedClient::new();
    client.script(
        "plan-agent",
        RoutedClient::json(json!({
            "action": "plan",
            "reject_reason": "",
            "plan": [
                {"step": 1, "agent": "servicenow", "question": "Summarize open incidents"},
                {"step": 1, "agent": "log_analytics", "question": "Show related pipeline logs"},
            ],
            "plan_reason": "Both sources needed in parallel.",
        })),
    );
    client.script("servicenow-agent", RoutedClient::text("Incident summary."));
    client.script("log-analytics-agent", RoutedClient::text("Log details."));
    client.script(
        "review-agent",
        RoutedClient::json(json!({
            "is_complete": true,
            "missing_aspects": [],
            "suggested_approach": "",
            "confidence": 0.9,
        })),
    );
    client.script(
        "summary-agent",
        RoutedClient::text("Incidents and related logs, summarized."),
    );

    let result = run_dynamic(&client, "Summarize incidents and show related logs.").await;

    assert!(result.final_output().is_some());
    // Exactly one review; the standalone streaming path never ran.
    assert_eq!(client.count_calls("review-agent"), 1);
    assert_eq!(executor_invocations(&result, "orchestrator"), 1);
    assert_eq!(executor_invocations(&result, "streaming_summary"), 0);

    // Both step-1 tasks ran in parallel within one orchestrator pass.
    assert_eq!(client.count_calls("servicenow-agent"), 1);
    assert_eq!(client.count_calls("log-analytics-agent"), 1);

    // Streaming originated from the review executor.
    let streamed: String = result
        .events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::AgentRunUpdate {
                executor_id, text, ..
            } if executor_id == "review_executor" => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, result.final_output().unwrap());
}

/// Seed scenario: one review-driven retry, then completion. Retried
/// executions pass through review again, so two reviews and two
/// orchestrator runs.
#[tokio::test]
async fn dynamic_retry_loop_runs_review_twice() {
    let client = RoutedClient::new();
    client.script(
        "plan-agent",
        RoutedClient::json(json!({
            "action": "plan",
            "reject_reason": "",
            "plan": [
                {"step": 1, "agent": "servicenow", "question": "Summarize open incidents"},
                {"step": 1, "agent": "log_analytics", "question": "Show related pipeline logs"},
            ],
            "plan_reason": "",
        })),
    );
    client.script("servicenow-agent", RoutedClient::text("Incident summary."));
    client.script("log-analytics-agent", RoutedClient::text("Log details."));
    client.script(
        "review-agent",
        RoutedClient::json(json!({
            "is_complete": false,
            "missing_aspects": ["service_health"],
            "suggested_approach": "Check platform health too.",
            "confidence": 0.7,
        })),
    );
    client.script(
        "replan-agent",
        RoutedClient::json(json!({
            "accept_review": true,
            "new_plan": [{"step": 1, "agent": "service_health", "question": "Check service health"}],
            "rejection_reason": "",
        })),
    );
    client.script("service-health-agent", RoutedClient::text("All healthy."));
    client.script(
        "review-agent",
        RoutedClient::json(json!({
            "is_complete": true,
            "missing_aspects": [],
            "suggested_approach": "",
            "confidence": 0.95,
        })),
    );
    client.script(
        "summary-agent",
        RoutedClient::text("Incidents, logs, and healthy services."),
    );

    let result = run_dynamic(&client, "Summarize incidents and show related logs.").await;

    assert!(result.final_output().is_some());
    assert_eq!(client.count_calls("review-agent"), 2);
    assert_eq!(executor_invocations(&result, "orchestrator"), 2);

    // Agent calls bounded by the two plans: one each.
    assert_eq!(client.count_calls("servicenow-agent"), 1);
    assert_eq!(client.count_calls("log-analytics-agent"), 1);
    assert_eq!(client.count_calls("service-health-agent"), 1);
}

/// Replan rejecting the review streams the existing results instead of
/// re-executing.
#[tokio::test]
async fn dynamic_replan_reject_streams_existing_results() {
    let client = RoutedClient::new();
    client.script(
        "plan-agent",
        RoutedClient::json(json!({
            "action": "plan",
            "reject_reason": "",
            "plan": [{"step": 1, "agent": "servicenow", "question": "List incidents"}],
            "plan_reason": "",
        })),
    );
    client.script("servicenow-agent", RoutedClient::text("Two incidents open."));
    client.script(
        "review-agent",
        RoutedClient::json(json!({
            "is_complete": false,
            "missing_aspects": ["weather report"],
            "suggested_approach": "None of our agents cover this.",
            "confidence": 0.4,
        })),
    );
    client.script(
        "replan-agent",
        RoutedClient::json(json!({
            "accept_review": false,
            "new_plan": [],
            "rejection_reason": "The gap is outside agent capabilities.",
        })),
    );
    client.script(
        "summary-agent",
        RoutedClient::text("Two incidents are open."),
    );

    let result = run_dynamic(&client, "List incidents and the weather.").await;

    assert_eq!(result.final_output(), Some("Two incidents are open."));
    assert_eq!(executor_invocations(&result, "orchestrator"), 1);
    assert_eq!(executor_invocations(&result, "streaming_summary"), 1);
    // Streaming came from the standalone summary path.
    assert!(result.events.iter().any(|e| matches!(
        e,
        WorkflowEvent::AgentRunUpdate { executor_id, .. } if executor_id == "streaming_summary"
    )));
}

/// Clarify action terminates with a clarification request.
#[tokio::test]
async fn dynamic_clarify_terminates_with_request() {
    let client = RoutedClient::new();
    client.script(
        "plan-agent",
        RoutedClient::json(json!({
            "action": "clarify",
            "reject_reason": "Ambiguous: which pipeline?",
            "plan": [],
            "plan_reason": "",
        })),
    );
    client.script(
        "clarify-agent",
        RoutedClient::json(json!({
            "clarification_request": "Which pipeline do you mean?",
            "possible_interpretations": ["nightly-ingest", "dim-refresh"],
        })),
    );

    let result = run_dynamic(&client, "Fix the pipeline.").await;
    let final_text = result.final_output().unwrap();
    assert!(final_text.contains("Which pipeline do you mean?"));
    assert!(final_text.contains("nightly-ingest"));
    assert_eq!(client.count_calls("review-agent"), 0);
}

/// Reject action terminates with the capability summary.
#[tokio::test]
async fn dynamic_reject_terminates() {
    let client = RoutedClient::new();
    client.script(
        "plan-agent",
        RoutedClient::json(json!({
            "action": "reject",
            "reject_reason": "Not a data-operations question.",
            "plan": [],
            "plan_reason": "",
        })),
    );

    let result = run_dynamic(&client, "Compose me a haiku.").await;
    let final_text = result.final_output().unwrap();
    assert!(final_text.contains("I can only help with"));
    assert_eq!(client.count_calls("review-agent"), 0);
    assert_eq!(client.count_calls("summary-agent"), 0);
}

/// Sequential steps execute in order with step context carried forward.
#[tokio::test]
async fn dynamic_sequential_steps_do_not_hit_iteration_limit() {
    let client = RoutedClient::new();
    client.script(
        "plan-agent",
        RoutedClient::json(json!({
            "action": "plan",
            "reject_reason": "",
            "plan": [
                {"step": 1, "agent": "servicenow", "question": "List incidents"},
                {"step": 2, "agent": "log_analytics", "question": "Logs for those incidents"},
                {"step": 3, "agent": "service_health", "question": "Health of affected services"},
            ],
            "plan_reason": "Each step depends on the previous.",
        })),
    );
    client.script("servicenow-agent", RoutedClient::text("INC001001, INC001002."));
    client.script("log-analytics-agent", RoutedClient::text("Timeout errors."));
    client.script("service-health-agent", RoutedClient::text("Degraded pool."));
    client.script(
        "review-agent",
        RoutedClient::json(json!({
            "is_complete": true,
            "missing_aspects": [],
            "suggested_approach": "",
            "confidence": 0.9,
        })),
    );
    client.script("summary-agent", RoutedClient::text("Full picture."));

    let result = run_dynamic(&client, "Walk the incident chain.").await;

    // Sequential steps run inside one orchestrator invocation, so the
    // superstep bound is nowhere near exceeded.
    assert!(result.final_output().is_some());
    assert!(!result
        .events
        .iter()
        .any(|e| matches!(e, WorkflowEvent::WorkflowFailed { .. })));
    assert_eq!(executor_invocations(&result, "orchestrator"), 1);

    // The step-2 agent saw step-1 results as context.
    let calls = client.calls();
    let sn = calls.iter().position(|c| c == "servicenow-agent").unwrap();
    let logs = calls.iter().position(|c| c == "log-analytics-agent").unwrap();
    let health = calls.iter().position(|c| c == "service-health-agent").unwrap();
    assert!(sn < logs && logs < health);
}
