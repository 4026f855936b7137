//! Reactive execution engine for Weir agent flow graphs.
//!
//! A graph is built once per request ([`build`]), then executed
//! ([`execute_graph`]): one task per node, each waiting on its input
//! tracker, with outputs routed through the event dispatcher and results
//! multiplexed onto a single output stream. Graphs containing a loop node
//! are delegated to the loop sub-executor.

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod graph;
pub mod loop_exec;
pub mod tracker;
pub mod validation;

pub use builder::build;
pub use config::ExecutorConfig;
pub use dispatcher::{EventDispatcher, NodeState};
pub use executor::{execute_graph, FlowEventStream};
pub use graph::{Edge, FlowGraph, SharedNode};
pub use tracker::NodeInputTracker;
pub use validation::{validate, Diagnostic, Severity, ValidationRule};
