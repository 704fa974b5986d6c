//! Run progress events.
//!
//! The engine reports everything that happens during a run through an
//! [`EventSink`]: node state transitions, per-action logs (optionally
//! annotated with SIP message details), and the scenario lifecycle
//! (started, completed, failed, stopped). Payload field names are part of
//! the wire contract with UI consumers and use camelCase.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::graph::{InstanceId, NodeId};

pub const EVENT_NODE_STATE: &str = "scenario:node-state";
pub const EVENT_ACTION_LOG: &str = "scenario:action-log";
pub const EVENT_STARTED: &str = "scenario:started";
pub const EVENT_COMPLETED: &str = "scenario:completed";
pub const EVENT_FAILED: &str = "scenario:failed";
pub const EVENT_STOPPED: &str = "scenario:stopped";

/// Lifecycle state of a graph node during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an action log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Direction of a logged SIP message, from this instance's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SipDirection {
    Sent,
    Received,
}

/// SIP message details attached to an action log line.
#[derive(Debug, Clone, Serialize)]
pub struct SipMessageInfo {
    pub direction: SipDirection,
    pub method: String,
    #[serde(rename = "responseCode", skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(rename = "callId", skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SipMessageInfo {
    pub fn new(direction: SipDirection, method: impl Into<String>) -> Self {
        Self {
            direction,
            method: method.into(),
            response_code: None,
            call_id: String::new(),
            from: String::new(),
            to: String::new(),
            note: None,
        }
    }

    pub fn response_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// One event as delivered to a sink. Timestamps are epoch milliseconds,
/// captured when the event was created.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    NodeStateChanged {
        node_id: NodeId,
        previous: NodeState,
        state: NodeState,
        timestamp: i64,
    },
    ActionLog {
        node_id: String,
        instance_id: String,
        message: String,
        level: LogLevel,
        sip_message: Option<SipMessageInfo>,
        timestamp: i64,
    },
    ScenarioStarted {
        scenario_id: String,
        timestamp: i64,
    },
    ScenarioCompleted {
        scenario_id: String,
        timestamp: i64,
    },
    ScenarioFailed {
        error: String,
        timestamp: i64,
    },
    ScenarioStopped {
        timestamp: i64,
    },
}

impl EngineEvent {
    /// The event channel this payload goes out on.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeStateChanged { .. } => EVENT_NODE_STATE,
            Self::ActionLog { .. } => EVENT_ACTION_LOG,
            Self::ScenarioStarted { .. } => EVENT_STARTED,
            Self::ScenarioCompleted { .. } => EVENT_COMPLETED,
            Self::ScenarioFailed { .. } => EVENT_FAILED,
            Self::ScenarioStopped { .. } => EVENT_STOPPED,
        }
    }

    /// The JSON payload as UI consumers receive it.
    pub fn payload(&self) -> Value {
        match self {
            Self::NodeStateChanged {
                node_id,
                previous,
                state,
                timestamp,
            } => json!({
                "nodeId": node_id,
                "previousState": previous.as_str(),
                "newState": state.as_str(),
                "timestamp": timestamp,
            }),
            Self::ActionLog {
                node_id,
                instance_id,
                message,
                level,
                sip_message,
                timestamp,
            } => {
                let mut payload = json!({
                    "nodeId": node_id,
                    "instanceId": instance_id,
                    "message": message,
                    "level": level.as_str(),
                    "timestamp": timestamp,
                });
                if let Some(sip) = sip_message {
                    if let Ok(value) = serde_json::to_value(sip) {
                        payload["sipMessage"] = value;
                    }
                }
                payload
            }
            Self::ScenarioStarted {
                scenario_id,
                timestamp,
            } => json!({ "scenarioId": scenario_id, "timestamp": timestamp }),
            Self::ScenarioCompleted {
                scenario_id,
                timestamp,
            } => json!({ "scenarioId": scenario_id, "timestamp": timestamp }),
            Self::ScenarioFailed { error, timestamp } => {
                json!({ "error": error, "timestamp": timestamp })
            }
            Self::ScenarioStopped { timestamp } => json!({ "timestamp": timestamp }),
        }
    }
}

/// Where the engine delivers run events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Sink that forwards every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EngineEvent) {
        let name = event.name();
        let payload = event.payload();
        match &event {
            EngineEvent::ScenarioFailed { .. } => error!(event = name, %payload, "scenario event"),
            EngineEvent::ActionLog {
                level: LogLevel::Warn,
                ..
            } => warn!(event = name, %payload, "scenario event"),
            EngineEvent::ActionLog {
                level: LogLevel::Error,
                ..
            } => error!(event = name, %payload, "scenario event"),
            EngineEvent::ActionLog {
                level: LogLevel::Debug,
                ..
            } => tracing::debug!(event = name, %payload, "scenario event"),
            _ => info!(event = name, %payload, "scenario event"),
        }
    }
}

/// Sink that queues events on an unbounded channel, for tests and for
/// consumers that render events elsewhere.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: EngineEvent) {
        // Receiver dropped means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Cheap, cloneable handle the engine and executor use to emit events.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn node_state(&self, node_id: &NodeId, previous: NodeState, state: NodeState) {
        self.sink.emit(EngineEvent::NodeStateChanged {
            node_id: node_id.clone(),
            previous,
            state,
            timestamp: now_millis(),
        });
    }

    pub fn action_log(
        &self,
        node_id: &NodeId,
        instance_id: &InstanceId,
        message: impl Into<String>,
        level: LogLevel,
    ) {
        self.emit_action_log(node_id.as_str(), instance_id.as_str(), message, level, None);
    }

    pub fn action_log_sip(
        &self,
        node_id: &NodeId,
        instance_id: &InstanceId,
        message: impl Into<String>,
        level: LogLevel,
        sip: SipMessageInfo,
    ) {
        self.emit_action_log(
            node_id.as_str(),
            instance_id.as_str(),
            message,
            level,
            Some(sip),
        );
    }

    /// Log line not attached to any node, for engine-level messages.
    pub fn system_log(&self, message: impl Into<String>, level: LogLevel) {
        self.emit_action_log("system", "", message, level, None);
    }

    fn emit_action_log(
        &self,
        node_id: &str,
        instance_id: &str,
        message: impl Into<String>,
        level: LogLevel,
        sip_message: Option<SipMessageInfo>,
    ) {
        self.sink.emit(EngineEvent::ActionLog {
            node_id: node_id.to_string(),
            instance_id: instance_id.to_string(),
            message: message.into(),
            level,
            sip_message,
            timestamp: now_millis(),
        });
    }

    pub fn scenario_started(&self, scenario_id: &str) {
        self.sink.emit(EngineEvent::ScenarioStarted {
            scenario_id: scenario_id.to_string(),
            timestamp: now_millis(),
        });
    }

    pub fn scenario_completed(&self, scenario_id: &str) {
        self.sink.emit(EngineEvent::ScenarioCompleted {
            scenario_id: scenario_id.to_string(),
            timestamp: now_millis(),
        });
    }

    pub fn scenario_failed(&self, error: impl Into<String>) {
        self.sink.emit(EngineEvent::ScenarioFailed {
            error: error.into(),
            timestamp: now_millis(),
        });
    }

    pub fn scenario_stopped(&self) {
        self.sink.emit(EngineEvent::ScenarioStopped {
            timestamp: now_millis(),
        });
    }
}
