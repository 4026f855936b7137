//! Node construction from the graph dialect.

use serde_json::Value;

use weir_schema::{node_data, Handles, NodeSpec};
use weir_types::{NodeKind, Result};

use crate::{
    ChatNode, ClientNode, ConditionalNode, EndNode, FetchNode, FlowNode, InnerNode, LlmNode,
    LoopNode, ParserNode, SendMessageNode, TextNode, UserInputNode,
};

/// The caller's request, seeded into entry nodes at build time.
#[derive(Debug, Clone, Default)]
pub struct SeedInput {
    pub message: String,
    pub images: Option<Vec<Value>>,
}

/// Build a node instance from its spec. The seed message overrides the
/// configured text of user-input and chat nodes, matching how a request
/// enters the graph.
pub fn build_node(spec: &NodeSpec, seed: &SeedInput, debug: bool) -> Result<Box<dyn FlowNode>> {
    let mut node: Box<dyn FlowNode> = match spec.kind {
        NodeKind::UserInput => {
            let mut data: weir_schema::UserInputData = node_data(&spec.data)?;
            data.text = seed.message.clone();
            data.images = seed.images.clone();
            Box::new(UserInputNode::new(&spec.id, data))
        }
        NodeKind::Text => Box::new(TextNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Parser => Box::new(ParserNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Fetch => Box::new(FetchNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Client => Box::new(ClientNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Llm => Box::new(LlmNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Chat => {
            let mut data: weir_schema::ChatData = node_data(&spec.data)?;
            data.message = seed.message.clone();
            Box::new(ChatNode::new(&spec.id, data))
        }
        NodeKind::SendMessage => Box::new(SendMessageNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Conditional => Box::new(ConditionalNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Loop => Box::new(LoopNode::new(&spec.id, node_data(&spec.data)?)),
        NodeKind::Inner => {
            let data: weir_schema::InnerData = node_data(&spec.data)?;
            Box::new(InnerNode::new(&spec.id, data.flow, data.handles))
        }
        NodeKind::End => {
            let handles: Handles = spec
                .data
                .get("handles")
                .map(|h| serde_json::from_value(h.clone()))
                .transpose()?
                .unwrap_or_default();
            Box::new(EndNode::new(&spec.id, handles))
        }
        NodeKind::Void => Box::new(EndNode::terminal(&spec.id)),
    };
    node.core_mut().debug = debug;
    Ok(node)
}
