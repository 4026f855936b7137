//! Minimal LLM client for Weir flows.
//!
//! Provides the `ProviderAdapter` trait, a `DynProvider` wrapper, an
//! OpenAI-compatible adapter (blocking and SSE streaming), and `LlmClient`
//! for constructing a provider from the configuration emitted by a flow's
//! client node.

mod client;
mod openai;
mod provider;
mod types;

pub use client::{ClientConfig, LlmClient};
pub use openai::OpenAiCompatAdapter;
pub use provider::{DeltaStream, DynProvider, ProviderAdapter};
pub use types::{ChatDelta, ChatMessage, ChatRequest, ChatResponse, Role, Usage};
