//! Send-message endpoint with the server-sent event stream.
//!
//! The response is one long-lived stream carrying the whole turn: the
//! echoed user message, thinking events, incremental text, the persisted
//! assistant message, and the `done` terminator. Dropping the response
//! (client disconnect) cancels the in-flight workflow.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::user::LOCAL_USER_ID;
use crate::models::Event;
use crate::services::bus::BusReceiver;
use crate::services::llm::AgentModelMapping;
use crate::services::orchestrator::SendMessageOptions;
use crate::state::AppState;
use crate::utils::error::AppResult;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub react_mode: Option<bool>,
    pub workflow_model: Option<String>,
    pub agent_model_mapping: Option<AgentModelMapping>,
    pub memory_enabled: Option<bool>,
}

/// JSON payload for one bus event on the wire.
fn sse_payload(event: &Event) -> Value {
    match event {
        Event::Done => json!({}),
        Event::Stream {
            executor_id,
            text,
            seq,
        } => json!({
            "executor_id": executor_id,
            "text": text,
            "seq": seq,
        }),
        other => serde_json::to_value(other).unwrap_or_else(|_| json!({})),
    }
}

/// Cancels the workflow when the client goes away.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn bus_to_sse(
    receiver: BusReceiver,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    let guard = CancelOnDrop(cancel);
    futures_util::stream::unfold(
        (receiver, guard, false),
        |(mut receiver, guard, finished)| async move {
            if finished {
                return None;
            }
            let event = receiver.recv().await?;
            let done = matches!(event, Event::Done);
            let sse = SseEvent::default()
                .event(event.sse_event_name())
                .data(sse_payload(&event).to_string());
            Some((Ok(sse), (receiver, guard, done)))
        },
    )
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let options = SendMessageOptions {
        message: body.message,
        react_mode: body.react_mode,
        workflow_model: body.workflow_model,
        agent_model_mapping: body.agent_model_mapping,
        memory_enabled: body.memory_enabled,
    };

    let (receiver, cancel) = state
        .orchestrator
        .handle_message(&conversation_id, LOCAL_USER_ID, options)
        .await?;

    Ok(Sse::new(bus_to_sse(receiver, cancel)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_payload_shapes() {
        assert_eq!(sse_payload(&Event::Done), json!({}));

        let stream = Event::Stream {
            executor_id: "summary_agent".into(),
            text: "tok".into(),
            seq: 3,
        };
        let payload = sse_payload(&stream);
        assert_eq!(payload["executor_id"], "summary_agent");
        assert_eq!(payload["seq"], 3);
        assert!(payload.get("type").is_none());

        let thinking = Event::AgentInvoked {
            agent: "servicenow-agent".into(),
        };
        assert_eq!(sse_payload(&thinking)["type"], "agent_invoked");
    }

    #[tokio::test]
    async fn test_stream_terminates_after_done() {
        use futures_util::StreamExt;

        let (bus, receiver) = crate::services::bus::EventBus::new();
        bus.emit(Event::AgentInvoked {
            agent: "a".into(),
        })
        .await
        .unwrap();
        bus.close().await;

        let cancel = CancellationToken::new();
        let stream = bus_to_sse(receiver, cancel.clone());
        let events: Vec<_> = stream.collect().await;
        // agent_invoked + done, then the stream ends.
        assert_eq!(events.len(), 2);
        // The drop guard fires once the stream is consumed.
        assert!(cancel.is_cancelled());
    }
}
