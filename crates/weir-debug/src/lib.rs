//! Debug event pipeline for Weir graph executions.
//!
//! Events flow through a fixed chain: capture (the convenience methods on
//! [`DebugContext`]) → transform ([`TransformPipeline`]) → emit
//! ([`EmitterRegistry`]) → collect ([`Collector`]). The whole chain is
//! request-scoped; a disabled context is a no-op on every call path.

pub mod collector;
pub mod config;
pub mod context;
pub mod emitter;
pub mod events;
pub mod transform;

pub use collector::{Collector, EdgeTrace, GraphExecutionSummary, NodeExecutionSummary};
pub use config::DebugConfig;
pub use context::DebugContext;
pub use emitter::{
    BufferedEmitter, CallbackEmitter, Emitter, EmitterRegistry, FilteredEmitter, LogEmitter,
    NullEmitter, QueueEmitter,
};
pub use events::{DebugEvent, DebugEventKind, DebugSeverity};
pub use transform::{
    EnrichTransformer, FilterTransformer, RedactTransformer, SamplingTransformer,
    TagFilterTransformer, TransformPipeline, Transformer, TruncateTransformer,
};
