//! Message Orchestrator
//!
//! Per-request glue: persists the user turn, assembles workflow input from
//! memory context, drives the selected workflow, multiplexes its events
//! onto the request bus, persists the final answer, and kicks off
//! background summarization.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::models::{ConversationContext, Event, MessageRole};
use crate::services::agents::{prompts, SubAgentRegistry};
use crate::services::bus::{with_bus, BusReceiver, EventBus};
use crate::services::llm::{validate_agent_mapping, AgentModelMapping, ClientProvider};
use crate::services::memory::MemoryService;
use crate::services::workflow::engine::WorkflowMessage;
use crate::services::workflow::{
    dynamic::create_dynamic_workflow, triage::create_triage_workflow, ChatTurn, Workflow,
    WorkflowEvent, WorkflowInput,
};
use crate::storage::ChatHistoryStore;
use crate::utils::error::{AppError, AppResult};
use crate::utils::title_from_first_user_message;

/// Per-request options from the send-message API
#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    pub message: String,
    pub react_mode: Option<bool>,
    pub workflow_model: Option<String>,
    pub agent_model_mapping: Option<AgentModelMapping>,
    pub memory_enabled: Option<bool>,
}

#[derive(Clone)]
pub struct MessageOrchestrator {
    settings: Settings,
    store: Arc<ChatHistoryStore>,
    memory: Arc<MemoryService>,
    provider: Arc<dyn ClientProvider>,
    subagents: Arc<SubAgentRegistry>,
}

impl MessageOrchestrator {
    pub fn new(
        settings: Settings,
        store: Arc<ChatHistoryStore>,
        memory: Arc<MemoryService>,
        provider: Arc<dyn ClientProvider>,
        subagents: Arc<SubAgentRegistry>,
    ) -> Self {
        Self {
            settings,
            store,
            memory,
            provider,
            subagents,
        }
    }

    /// Handle one user message. Returns the bus consumer the transport
    /// drains into the client response, and the token that cancels the
    /// in-flight workflow when the client disconnects.
    pub async fn handle_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        options: SendMessageOptions,
    ) -> AppResult<(BusReceiver, CancellationToken)> {
        let message = options.message.trim().to_string();
        if message.is_empty() {
            return Err(AppError::validation("Message cannot be empty"));
        }
        if let Some(mapping) = &options.agent_model_mapping {
            validate_agent_mapping(mapping, &self.subagents.agent_keys())?;
        }
        if let Some(model) = &options.workflow_model {
            if !crate::services::llm::ModelRegistry::is_known_model(model) {
                return Err(AppError::validation(format!("Unknown model '{}'", model)));
            }
        }

        // 1. Append the user message (write-through; assigns the sequence).
        let (conversation, user_seq) = self
            .store
            .append_message(conversation_id, user_id, MessageRole::User, &message)
            .await?;
        let user_message = conversation.messages[user_seq as usize].clone();

        // 2. Memory context for the workflow input.
        let memory_enabled = options.memory_enabled.unwrap_or(self.settings.memory_enabled);
        let context = if memory_enabled {
            self.memory
                .context_for_workflow(conversation_id, &conversation.messages)
                .await
        } else {
            ConversationContext {
                memory_text: None,
                gap_messages: conversation.messages[..user_seq as usize].to_vec(),
            }
        };
        let input = build_workflow_input(&context, &message);

        // 3. Per-request bus, published to middleware via the ambient handle.
        let (bus, receiver) = EventBus::new();
        bus.emit(Event::UserMessage {
            content: user_message.content.clone(),
            seq: user_seq,
            time: user_message.timestamp.clone(),
        })
        .await?;

        let cancel = CancellationToken::new();
        let react_mode = options.react_mode.unwrap_or(self.settings.dynamic_plan);
        let workflow_model = options
            .workflow_model
            .clone()
            .unwrap_or_else(|| conversation.meta.model.clone());
        let mapping = options
            .agent_model_mapping
            .clone()
            .or_else(|| conversation.meta.agent_level_llm_overwrite.clone());

        // 4. Drive the workflow on a background task scoped to the bus.
        let orchestrator = self.clone();
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        let task_bus = bus.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(with_bus(bus, async move {
            orchestrator
                .run_request(
                    conversation_id,
                    user_id,
                    message,
                    input,
                    react_mode,
                    workflow_model,
                    mapping,
                    memory_enabled,
                    task_bus,
                    task_cancel,
                )
                .await;
        }));

        Ok((receiver, cancel))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_request(
        &self,
        conversation_id: String,
        user_id: String,
        user_message: String,
        input: WorkflowInput,
        react_mode: bool,
        workflow_model: String,
        mapping: Option<AgentModelMapping>,
        memory_enabled: bool,
        bus: EventBus,
        cancel: CancellationToken,
    ) {
        let final_text = if react_mode {
            match create_dynamic_workflow(
                &self.provider,
                &self.subagents,
                &workflow_model,
                mapping.as_ref(),
            ) {
                Ok(workflow) => {
                    let input = crate::services::workflow::dynamic::DynamicMsg::Input(input);
                    run_workflow_to_bus(workflow, input, &bus, cancel.clone()).await
                }
                Err(err) => {
                    tracing::error!("failed to build dynamic workflow: {}", err);
                    None
                }
            }
        } else {
            match create_triage_workflow(
                &self.provider,
                &self.subagents,
                &workflow_model,
                mapping.as_ref(),
            ) {
                Ok(workflow) => {
                    let input = crate::services::workflow::triage::TriageMsg::Input(input);
                    run_workflow_to_bus(workflow, input, &bus, cancel.clone()).await
                }
                Err(err) => {
                    tracing::error!("failed to build triage workflow: {}", err);
                    None
                }
            }
        };

        // Client gone: nothing to persist, nothing to deliver.
        if cancel.is_cancelled() {
            tracing::debug!("request for {} cancelled mid-stream", conversation_id);
            bus.close().await;
            return;
        }

        let reply = final_text.unwrap_or_else(|| prompts::WORKFLOW_ERROR_MESSAGE.to_string());

        // 5. Persist the assistant turn before the client sees it.
        match self
            .store
            .append_message(&conversation_id, &user_id, MessageRole::Assistant, &reply)
            .await
        {
            Ok((mut conversation, assistant_seq)) => {
                let mut new_title = None;
                if conversation.meta.title == "New chat" {
                    let title = title_from_first_user_message(&user_message);
                    conversation.meta.title = title.clone();
                    if let Err(err) = self.store.save_conversation(&conversation).await {
                        tracing::warn!("failed to persist title: {}", err);
                    } else {
                        new_title = Some(title);
                    }
                }

                let assistant = conversation.messages[assistant_seq as usize].clone();
                let _ = bus
                    .emit(Event::AssistantMessage {
                        content: assistant.content,
                        seq: assistant_seq,
                        time: assistant.timestamp,
                        title: new_title,
                    })
                    .await;

                // 6. Fire-and-forget summarization for the finished round.
                if memory_enabled {
                    if let Err(err) = self
                        .memory
                        .trigger_summarization(
                            &conversation_id,
                            assistant_seq,
                            conversation.messages,
                        )
                        .await
                    {
                        tracing::warn!(
                            "memory trigger failed for {}: {}",
                            conversation_id,
                            err
                        );
                    }
                }
            }
            Err(err) => {
                tracing::error!("failed to persist assistant message: {}", err);
            }
        }

        bus.close().await;
    }
}

/// Build workflow input from memory context plus the current message.
/// The memory summary rides as a preamble on the first included message.
fn build_workflow_input(context: &ConversationContext, current_message: &str) -> WorkflowInput {
    let mut turns: Vec<ChatTurn> = Vec::with_capacity(context.gap_messages.len() + 1);
    for message in &context.gap_messages {
        turns.push(ChatTurn {
            role: message.role.as_str().to_string(),
            text: message.content.clone(),
        });
    }
    turns.push(ChatTurn {
        role: "user".to_string(),
        text: current_message.to_string(),
    });

    if let Some(memory_text) = &context.memory_text {
        let first = &mut turns[0];
        first.text = format!(
            "<memory>\n{}\n</memory>\n(Summarized context from earlier in this conversation.)\n\n{}",
            memory_text, first.text
        );
    }

    WorkflowInput {
        query: String::new(),
        messages: turns,
    }
}

/// Per-workflow wall-clock budget
const WORKFLOW_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(180);

/// Drive a workflow, relaying user-visible updates to the bus and
/// capturing the final output. Returns `None` on workflow failure.
async fn run_workflow_to_bus<M: WorkflowMessage>(
    workflow: Workflow<M>,
    input: M,
    bus: &EventBus,
    cancel: CancellationToken,
) -> Option<String> {
    let streaming_ids = workflow.streaming_executor_ids().clone();
    let (tx, mut rx) = mpsc::channel(256);
    // Child token: a workflow timeout aborts the run without looking like
    // a client disconnect to the caller.
    let workflow_cancel = cancel.child_token();
    let run = workflow.run_to_channel(input, tx, workflow_cancel.clone());
    tokio::pin!(run);

    let deadline = tokio::time::sleep(WORKFLOW_TIMEOUT);
    tokio::pin!(deadline);

    let mut running = true;
    let mut timed_out = false;
    let mut final_text: Option<String> = None;
    let mut failed = false;
    loop {
        tokio::select! {
            _ = &mut run, if running => running = false,
            _ = &mut deadline, if running && !timed_out => {
                tracing::error!("workflow timed out after {:?}", WORKFLOW_TIMEOUT);
                timed_out = true;
                failed = true;
                workflow_cancel.cancel();
            }
            event = rx.recv() => match event {
                Some(WorkflowEvent::AgentRunUpdate { executor_id, text, seq })
                    if streaming_ids.contains(&executor_id) =>
                {
                    let _ = bus
                        .emit(Event::Stream {
                            executor_id,
                            text,
                            seq,
                        })
                        .await;
                }
                Some(WorkflowEvent::WorkflowOutput { text }) => final_text = Some(text),
                Some(WorkflowEvent::WorkflowFailed { error }) => {
                    tracing::error!("workflow failed: {}", error);
                    failed = true;
                }
                Some(event) => tracing::debug!("workflow event: {:?}", event),
                None => break,
            }
        }
    }

    if failed {
        None
    } else {
        final_text
    }
}
