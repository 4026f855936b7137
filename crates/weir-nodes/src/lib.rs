//! Node contract and built-in node behaviors for Weir agent flows.
//!
//! Every node implements [`FlowNode`]: shared state lives in a [`NodeCore`]
//! (inputs, outputs, response marker, bypass flag) and behavior is an async
//! event stream returned by `call`. The executor classifies each event by
//! its kind: streaming content, debug records, conditional system signals,
//! or output-handle values.

pub mod chat;
pub mod client;
pub mod conditional;
pub mod end;
pub mod factory;
pub mod fetch;
pub mod inner;
pub mod llm;
pub mod loop_node;
pub mod node;
pub mod parser;
pub mod send_message;
pub mod template;
pub mod text;
pub mod user_input;

pub use chat::ChatNode;
pub use client::ClientNode;
pub use conditional::ConditionalNode;
pub use end::EndNode;
pub use factory::{build_node, SeedInput};
pub use fetch::FetchNode;
pub use inner::{InnerNode, SubFlow};
pub use llm::LlmNode;
pub use loop_node::{LoopHandles, LoopNode};
pub use node::{FlowNode, NodeCore, NodeEventStream};
pub use parser::ParserNode;
pub use send_message::SendMessageNode;
pub use text::TextNode;
pub use user_input::UserInputNode;
