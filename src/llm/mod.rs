//! LLM integration for the sampling broker (C9): a single configured
//! provider, no multi-backend routing or failover chain.

mod provider;

pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, Role, StreamEvent, Usage};
