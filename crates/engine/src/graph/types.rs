//! Data model of the compiled execution graph.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Codec list applied when a sipInstance node omits the field entirely or
/// supplies an empty array.
pub const DEFAULT_CODECS: [&str; 2] = ["PCMU", "PCMA"];

/// Identifier of a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of a declared SIP instance (the id of its graph node).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The fixed command vocabulary of the flow language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    MakeCall,
    Answer,
    Release,
    PlayAudio,
    SendDtmf,
    Hold,
    Retrieve,
    BlindTransfer,
}

impl CommandKind {
    /// Parse the document-level command name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "MakeCall" => Self::MakeCall,
            "Answer" => Self::Answer,
            "Release" => Self::Release,
            "PlayAudio" => Self::PlayAudio,
            "SendDTMF" => Self::SendDtmf,
            "Hold" => Self::Hold,
            "Retrieve" => Self::Retrieve,
            "BlindTransfer" => Self::BlindTransfer,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MakeCall => "MakeCall",
            Self::Answer => "Answer",
            Self::Release => "Release",
            Self::PlayAudio => "PlayAudio",
            Self::SendDtmf => "SendDTMF",
            Self::Hold => "Hold",
            Self::Retrieve => "Retrieve",
            Self::BlindTransfer => "BlindTransfer",
        }
    }

    /// Fallback timeout applied at execution time when the node's own
    /// timeout is zero.
    pub fn default_timeout(&self) -> Duration {
        match self {
            Self::MakeCall => Duration::from_secs(30),
            _ => Duration::from_secs(10),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed event vocabulary of the flow language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Incoming,
    Disconnected,
    Ringing,
    Timeout,
    DtmfReceived,
    Held,
    Retrieved,
    Transferred,
}

impl EventKind {
    /// Parse the document-level event name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "INCOMING" => Self::Incoming,
            "DISCONNECTED" => Self::Disconnected,
            "RINGING" => Self::Ringing,
            "TIMEOUT" => Self::Timeout,
            "DTMFReceived" => Self::DtmfReceived,
            "HELD" => Self::Held,
            "RETRIEVED" => Self::Retrieved,
            "TRANSFERRED" => Self::Transferred,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "INCOMING",
            Self::Disconnected => "DISCONNECTED",
            Self::Ringing => "RINGING",
            Self::Timeout => "TIMEOUT",
            Self::DtmfReceived => "DTMFReceived",
            Self::Held => "HELD",
            Self::Retrieved => "RETRIEVED",
            Self::Transferred => "TRANSFERRED",
        }
    }

    /// Fallback wait bound applied at execution time when the node's own
    /// timeout is zero.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of one declared SIP instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipInstanceConfig {
    pub id: InstanceId,
    pub label: String,
    /// "DN" or "Endpoint".
    pub mode: String,
    pub dn: String,
    pub register: bool,
    pub color: String,
    /// User-selected codecs in priority order. Invalid names survive
    /// compilation untouched and are filtered at endpoint creation.
    pub codecs: Vec<String>,
}

/// Parameters of a command node.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub kind: CommandKind,
    /// MakeCall target.
    pub target_uri: String,
    /// PlayAudio source file.
    pub file_path: String,
    /// SendDTMF digit string.
    pub digits: String,
    /// SendDTMF inter-digit gap in milliseconds.
    pub interval_ms: u64,
    /// BlindTransfer target user part.
    pub target_user: String,
    /// BlindTransfer target host part.
    pub target_host: String,
}

/// Parameters of an event node.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSpec {
    pub kind: EventKind,
    /// DTMFReceived: only this digit satisfies the wait; others are
    /// consumed and ignored.
    pub expected_digit: Option<char>,
}

/// The two node flavours the executor dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeAction {
    Command(CommandSpec),
    Event(EventSpec),
}

/// One compiled command/event node.
///
/// Nodes are owned by the [`ExecutionGraph`] arena; `success_next` and
/// `failure_next` are id references resolved through the arena, never
/// aliasing pointers. Nodes are read-only during execution.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: NodeId,
    pub instance_id: InstanceId,
    pub action: NodeAction,
    /// Document timeout, defaulted to 10s at compile time. A zero value
    /// defers to the action's execution-time fallback.
    pub timeout: Duration,
    pub success_next: Option<NodeId>,
    pub failure_next: Option<NodeId>,
}

/// Per-instance execution chain entry points.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceChain {
    pub config: SipInstanceConfig,
    /// Nodes wired directly to the instance's own graph node. Each start
    /// node roots an independent chain; an instance's chains run
    /// sequentially inside its worker.
    pub start_nodes: Vec<NodeId>,
}

/// The compiled form of a flow document, owned for the lifetime of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionGraph {
    pub instances: HashMap<InstanceId, InstanceChain>,
    pub nodes: HashMap<NodeId, GraphNode>,
}

impl ExecutionGraph {
    pub fn node(&self, id: &NodeId) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&InstanceChain> {
        self.instances.get(id)
    }

    /// Instance ids in a stable order, used wherever deterministic
    /// iteration matters (port assignment, worker spawn order).
    pub fn instance_ids_sorted(&self) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self.instances.keys().cloned().collect();
        ids.sort();
        ids
    }
}
