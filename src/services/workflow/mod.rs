//! Workflow engine and the two concrete workflows built on it.

pub mod dynamic;
pub mod engine;
pub mod schemas;
pub mod triage;

pub use engine::{
    Envelope, Executor, ExecutorContext, Selector, Workflow, WorkflowBuilder, WorkflowEvent,
    WorkflowRunResult,
};
pub use schemas::{ChatTurn, WorkflowInput};

use tokio::sync::mpsc;

use crate::services::agent::{Agent, AgentResponse};
use crate::services::llm::{ChatMessage, StreamUpdate};
use crate::utils::error::{AppError, AppResult};

/// Run an agent in streaming mode, relaying its text deltas as executor
/// updates while the stream is live. Returns the buffered response so the
/// executor can also yield the concatenated text as workflow output.
pub(crate) async fn stream_agent_text<M: engine::WorkflowMessage>(
    agent: &Agent,
    messages: Vec<ChatMessage>,
    ctx: &ExecutorContext<M>,
) -> AppResult<AgentResponse> {
    let (tx, mut rx) = mpsc::channel::<StreamUpdate>(64);
    let run = agent.run_stream(messages, tx, ctx.cancellation());
    tokio::pin!(run);

    let mut response: Option<AppResult<AgentResponse>> = None;
    loop {
        tokio::select! {
            result = &mut run, if response.is_none() => {
                response = Some(result);
            }
            update = rx.recv() => match update {
                Some(StreamUpdate::TextDelta { content }) => ctx.emit_update(content).await,
                Some(_) => {}
                // The sender lives inside the run future; None means the
                // stream is fully drained.
                None => break,
            }
        }
    }

    response.unwrap_or_else(|| Err(AppError::internal("agent stream ended without a response")))
}
