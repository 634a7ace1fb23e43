//! opschat - multi-agent ops chat service
//!
//! Users submit natural-language queries; the service routes each query
//! through a graph of cooperating specialist agents, streams intermediate
//! thinking events and the final answer over a single long-lived HTTP
//! response, and persists the conversation behind a write-through cache
//! with sliding-window memory summarization.

pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;

pub use config::Settings;
pub use state::{AppState, AppStateInner};
pub use utils::error::{AppError, AppResult};
