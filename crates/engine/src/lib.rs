//! # sipflow-engine
//!
//! Scenario execution engine for visual SIP call-flow testing.
//!
//! A scenario is a graph of SIP endpoints ("instances") and per-instance
//! chains of command and event nodes (make a call, answer, play audio, send
//! DTMF, hold/retrieve, blind transfer, wait for events). This crate compiles
//! that graph into a typed execution structure and runs it concurrently
//! against live SIP endpoints, streaming progress back as lifecycle events.
//!
//! Layering, leaves first:
//!
//! - [`graph`] — compiles the generic node/edge flow document into a typed
//!   [`graph::ExecutionGraph`].
//! - [`endpoint`] — the abstract SIP endpoint capability the engine drives
//!   (placing/accepting calls, media direction, DTMF, REFER). The actual
//!   wire stack lives behind these traits.
//! - [`instance`] — allocates one endpoint per declared instance and runs
//!   its serve loop.
//! - [`session`] — registry of active dialogs plus the in-process SIP event
//!   bus used for cross-instance hold/retrieve/transfer signalling.
//! - [`executor`] — the per-instance chain interpreter.
//! - [`engine`] — orchestrates one run end to end.
//! - [`testkit`] — an in-memory loopback endpoint and scenario store for
//!   tests and local experimentation.

pub mod endpoint;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod graph;
pub mod instance;
pub mod session;
pub mod store;
pub mod testkit;

pub use endpoint::{Dialog, EndpointFactory, MediaDirection, ServerSession, SipEndpoint, SipUri};
pub use engine::Engine;
pub use errors::{EngineError, Result};
pub use events::{ChannelEventSink, EngineEvent, EventSink, NodeState, TracingEventSink};
pub use graph::{compile, ExecutionGraph, GraphNode, InstanceId, NodeId, SipInstanceConfig};
pub use store::{ScenarioStore, StoreError, StoredScenario};
