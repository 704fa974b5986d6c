//! Error types for the scenario execution engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::endpoint::EndpointError;
use crate::graph::{InstanceId, NodeId};
use crate::store::StoreError;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while compiling or executing a scenario.
#[derive(Debug, Error)]
pub enum EngineError {
    // ---- Compile errors ----
    /// The flow document could not be decoded.
    #[error("failed to parse flow document: {0}")]
    FlowParse(#[from] serde_json::Error),

    /// A command/event node did not name its owning instance.
    #[error("node {node_id} is missing sipInstanceId")]
    MissingInstanceRef { node_id: NodeId },

    /// A command/event node referenced an instance that was never declared.
    #[error("node {node_id} references unknown instance {instance_id}")]
    UnknownInstanceRef {
        node_id: NodeId,
        instance_id: InstanceId,
    },

    /// A command or event node carried a name outside the fixed vocabulary.
    #[error("node {node_id} has unsupported {kind} {name:?}")]
    UnsupportedAction {
        node_id: NodeId,
        kind: &'static str,
        name: String,
    },

    /// The document declared no SIP instances at all.
    #[error("no sipInstance nodes found")]
    NoInstances,

    // ---- Resource allocation errors ----
    /// The port allocator ran out of candidate ports.
    #[error("failed to allocate port after {retries} retries")]
    PortsExhausted { retries: u32 },

    /// Port allocation failed while materializing one instance of a batch.
    #[error("failed to allocate port for instance {instance}: {source}")]
    PortAllocation {
        instance: InstanceId,
        #[source]
        source: Box<EngineError>,
    },

    /// Endpoint construction failed while materializing one instance.
    #[error("failed to create endpoint for instance {instance}: {source}")]
    EndpointSetup {
        instance: InstanceId,
        #[source]
        source: EndpointError,
    },

    /// Lookup of a managed instance by id failed.
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    // ---- Protocol operation errors ----
    /// A command required a parameter the node did not carry.
    #[error("{command} requires {field}")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    /// A target URI was not a `sip:` URI.
    #[error("targetUri must start with sip: scheme")]
    UriScheme,

    /// A target URI failed to parse.
    #[error("invalid target URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The outbound INVITE was not answered successfully.
    #[error("INVITE failed: {0}")]
    InviteFailed(#[source] EndpointError),

    /// The outbound call did not complete within its bound.
    #[error("call setup timed out after {0:?}")]
    CallSetupTimeout(Duration),

    /// Answer was executed with no pending inbound call.
    #[error("no incoming dialog to answer for instance {0}")]
    NoPendingCall(InstanceId),

    /// Accepting an inbound call failed during media negotiation.
    #[error("codec negotiation failed (488 Not Acceptable): {0}")]
    CodecNegotiation(#[source] EndpointError),

    /// Accepting an inbound call failed for a non-negotiation reason.
    #[error("Answer failed: {0}")]
    AnswerFailed(#[source] EndpointError),

    /// A command needed an active dialog and none was stored.
    #[error("no active dialog for instance {0}")]
    NoActiveDialog(InstanceId),

    /// The referenced audio file does not exist.
    #[error("audio file not found: {0}")]
    AudioFileNotFound(PathBuf),

    /// The referenced audio file exists but could not be accessed.
    #[error("cannot access audio file {path}: {source}")]
    AudioFileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Streaming audio into the dialog failed.
    #[error("playback failed: {0}")]
    Playback(#[source] EndpointError),

    /// A DTMF digit outside {0-9, *, #, A-D} was requested.
    #[error("invalid DTMF digit: {0} (allowed: 0-9, *, #, A-D)")]
    InvalidDtmfDigit(char),

    /// Transmitting a DTMF digit failed.
    #[error("failed to send DTMF {digit}: {source}")]
    DtmfSend {
        digit: char,
        #[source]
        source: EndpointError,
    },

    /// Reading inbound DTMF failed.
    #[error("DTMF receive failed: {0}")]
    DtmfReceive(#[source] EndpointError),

    /// Hold renegotiation failed.
    #[error("Hold re-INVITE failed: {0}")]
    HoldFailed(#[source] EndpointError),

    /// Retrieve renegotiation failed.
    #[error("Retrieve re-INVITE failed: {0}")]
    RetrieveFailed(#[source] EndpointError),

    /// The REFER request of a blind transfer failed.
    #[error("REFER failed: {0}")]
    ReferFailed(#[source] EndpointError),

    // ---- Event waits ----
    /// A blocking event wait expired.
    #[error("{event} event timeout after {timeout:?}")]
    EventTimeout { event: String, timeout: Duration },

    // ---- Lifecycle ----
    /// `start_scenario` was called while a run was active.
    #[error("scenario already running")]
    AlreadyRunning,

    /// `stop_scenario` was called with no run active.
    #[error("no running scenario")]
    NotRunning,

    /// The run context was cancelled while this node was in flight.
    #[error("execution cancelled")]
    Cancelled,

    /// A chain failure, tagged with the instance it belongs to.
    #[error("instance {instance}: {source}")]
    InstanceChain {
        instance: InstanceId,
        #[source]
        source: Box<EngineError>,
    },

    /// Scenario store failure while loading a run's definition.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Generic endpoint-layer failure.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// True when this error (or the chain error wrapping it) is the result
    /// of run cancellation rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::InstanceChain { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
