//! LLM client layer: types, provider trait, OpenAI-compatible backend,
//! and the model registry.

pub mod openai;
pub mod provider;
pub mod registry;
pub mod types;

pub use openai::OpenAiCompatClient;
pub use provider::{complete_structured, with_transient_retry, ChatClient, ClientProvider};
pub use registry::{
    model_for, validate_agent_mapping, AgentModelMapping, ModelRegistry, ResolvedModelConfig,
};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, ParameterSchema, StreamUpdate,
    ToolCall, ToolDefinition, Usage,
};
