//! Typed execution graph and the flow-document compiler.
//!
//! The frontend persists scenarios as a generic node/edge document. This
//! module turns that document into an owned arena of command/event nodes
//! linked by id, grouped into one chain per declared SIP instance.

mod compiler;
mod types;

pub use compiler::{compile, FlowDocument, FlowEdge, FlowNode};
pub use types::{
    CommandKind, CommandSpec, EventKind, EventSpec, ExecutionGraph, GraphNode, InstanceChain,
    InstanceId, NodeAction, NodeId, SipInstanceConfig, DEFAULT_CODECS,
};
