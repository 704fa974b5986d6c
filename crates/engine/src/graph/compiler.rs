//! Flow-document decoding and graph compilation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{
    CommandKind, CommandSpec, EventKind, EventSpec, ExecutionGraph, GraphNode, InstanceChain,
    InstanceId, NodeAction, NodeId, SipInstanceConfig, DEFAULT_CODECS,
};
use crate::errors::{EngineError, Result};

/// Raw flow document as persisted by the editor: generic nodes plus edges.
/// Field aliases accept the capitalized spellings older documents carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    #[serde(default, alias = "Nodes")]
    pub nodes: Vec<FlowNode>,
    #[serde(default, alias = "Edges")]
    pub edges: Vec<FlowEdge>,
}

/// One generic document node with an untyped data bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,
    #[serde(rename = "type", alias = "Type")]
    pub node_type: String,
    #[serde(default, alias = "Data")]
    pub data: Map<String, Value>,
}

/// One generic document edge. `source_handle == "failure"` (or a
/// `branchType` of "failure" in the data bag) marks a failure branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    #[serde(alias = "ID", alias = "Id")]
    pub id: String,
    #[serde(alias = "Source")]
    pub source: String,
    #[serde(alias = "Target")]
    pub target: String,
    #[serde(default, rename = "sourceHandle", alias = "SourceHandle")]
    pub source_handle: Option<String>,
    #[serde(default, alias = "Data")]
    pub data: Map<String, Value>,
}

/// Timeout applied at compile time when the document omits the field.
const COMPILE_DEFAULT_TIMEOUT_MS: f64 = 10_000.0;

/// SendDTMF inter-digit gap default in milliseconds.
const DEFAULT_DTMF_INTERVAL_MS: f64 = 100.0;

/// Compile a flow document into a typed execution graph.
///
/// Fails on malformed JSON, on command/event nodes missing their
/// `sipInstanceId`, on references to undeclared instances, on command/event
/// names outside the fixed vocabulary, and on documents declaring no
/// sipInstance nodes at all. Edges whose source or target cannot be
/// resolved are silently skipped. Cycles are not detected; a well-formed
/// scenario is expected to terminate.
pub fn compile(flow_data: &str) -> Result<ExecutionGraph> {
    let flow: FlowDocument = serde_json::from_str(flow_data)?;

    let mut graph = ExecutionGraph::default();

    // First pass: declared instances, plus an id -> type lookup over every
    // node (unknown node types are recorded but produce no graph node).
    let mut node_types: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for node in &flow.nodes {
        node_types.insert(node.id.as_str(), node.node_type.as_str());

        if node.node_type == "sipInstance" {
            let config = SipInstanceConfig {
                id: InstanceId::new(&node.id),
                label: string_field(&node.data, "label", ""),
                mode: string_field(&node.data, "mode", "DN"),
                dn: string_field(&node.data, "dn", ""),
                register: bool_field(&node.data, "register", true),
                color: string_field(&node.data, "color", ""),
                codecs: string_array_field(&node.data, "codecs", &DEFAULT_CODECS),
            };
            graph.instances.insert(
                InstanceId::new(&node.id),
                InstanceChain {
                    config,
                    start_nodes: Vec::new(),
                },
            );
        }
    }

    // Second pass: command/event nodes into the arena.
    for node in &flow.nodes {
        if node.node_type != "command" && node.node_type != "event" {
            continue;
        }

        let instance_ref = string_field(&node.data, "sipInstanceId", "");
        if instance_ref.is_empty() {
            return Err(EngineError::MissingInstanceRef {
                node_id: NodeId::new(&node.id),
            });
        }
        let instance_id = InstanceId::new(&instance_ref);
        if !graph.instances.contains_key(&instance_id) {
            return Err(EngineError::UnknownInstanceRef {
                node_id: NodeId::new(&node.id),
                instance_id,
            });
        }

        let action = if node.node_type == "command" {
            let name = string_field(&node.data, "command", "");
            let kind =
                CommandKind::parse(&name).ok_or_else(|| EngineError::UnsupportedAction {
                    node_id: NodeId::new(&node.id),
                    kind: "command",
                    name: name.clone(),
                })?;
            NodeAction::Command(CommandSpec {
                kind,
                target_uri: string_field(&node.data, "targetUri", ""),
                file_path: string_field(&node.data, "filePath", ""),
                digits: string_field(&node.data, "digits", ""),
                interval_ms: float_field(&node.data, "intervalMs", DEFAULT_DTMF_INTERVAL_MS)
                    .max(0.0) as u64,
                target_user: string_field(&node.data, "targetUser", ""),
                target_host: string_field(&node.data, "targetHost", ""),
            })
        } else {
            let name = string_field(&node.data, "event", "");
            let kind = EventKind::parse(&name).ok_or_else(|| EngineError::UnsupportedAction {
                node_id: NodeId::new(&node.id),
                kind: "event",
                name: name.clone(),
            })?;
            NodeAction::Event(EventSpec {
                kind,
                expected_digit: string_field(&node.data, "expectedDigit", "")
                    .chars()
                    .next(),
            })
        };

        let timeout_ms = float_field(&node.data, "timeout", COMPILE_DEFAULT_TIMEOUT_MS).max(0.0);
        graph.nodes.insert(
            NodeId::new(&node.id),
            GraphNode {
                id: NodeId::new(&node.id),
                instance_id,
                action,
                timeout: Duration::from_millis(timeout_ms as u64),
                success_next: None,
                failure_next: None,
            },
        );
    }

    // Edge pass: start nodes and success/failure links.
    for edge in &flow.edges {
        let source_type = node_types.get(edge.source.as_str()).copied().unwrap_or("");
        let target_id = NodeId::new(&edge.target);
        let target_exists = graph.nodes.contains_key(&target_id);

        let is_failure = edge.source_handle.as_deref() == Some("failure")
            || string_field(&edge.data, "branchType", "") == "failure";

        if source_type == "sipInstance" {
            if target_exists {
                if let Some(chain) = graph.instances.get_mut(&InstanceId::new(&edge.source)) {
                    chain.start_nodes.push(target_id);
                }
            }
        } else if source_type == "command" || source_type == "event" {
            if target_exists {
                if let Some(source_node) = graph.nodes.get_mut(&NodeId::new(&edge.source)) {
                    if is_failure {
                        source_node.failure_next = Some(target_id);
                    } else {
                        source_node.success_next = Some(target_id);
                    }
                }
            }
        }
    }

    if graph.instances.is_empty() {
        return Err(EngineError::NoInstances);
    }

    Ok(graph)
}

// Field extraction over the untyped data bag. Wrong-typed values fall back
// to the default rather than failing the document.

fn string_field(data: &Map<String, Value>, key: &str, default: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        _ => default.to_string(),
    }
}

fn bool_field(data: &Map<String, Value>, key: &str, default: bool) -> bool {
    match data.get(key) {
        Some(Value::Bool(b)) => *b,
        _ => default,
    }
}

fn float_field(data: &Map<String, Value>, key: &str, default: f64) -> f64 {
    match data.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        _ => default,
    }
}

fn string_array_field(data: &Map<String, Value>, key: &str, default: &[&str]) -> Vec<String> {
    if let Some(Value::Array(arr)) = data.get(key) {
        let values: Vec<String> = arr
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        if !values.is_empty() {
            return values;
        }
    }
    default.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(nodes: Value, edges: Value) -> String {
        json!({ "nodes": nodes, "edges": edges }).to_string()
    }

    fn instance_node(id: &str) -> Value {
        json!({ "id": id, "type": "sipInstance", "data": { "label": id, "dn": "1000" } })
    }

    fn command_node(id: &str, instance: &str, command: &str, extra: Value) -> Value {
        let mut data = json!({ "sipInstanceId": instance, "command": command });
        if let (Some(map), Some(extra_map)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                map.insert(k.clone(), v.clone());
            }
        }
        json!({ "id": id, "type": "command", "data": data })
    }

    fn event_node(id: &str, instance: &str, event: &str, extra: Value) -> Value {
        let mut data = json!({ "sipInstanceId": instance, "event": event });
        if let (Some(map), Some(extra_map)) = (data.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                map.insert(k.clone(), v.clone());
            }
        }
        json!({ "id": id, "type": "event", "data": data })
    }

    fn edge(id: &str, source: &str, target: &str) -> Value {
        json!({ "id": id, "source": source, "target": target })
    }

    #[test]
    fn malformed_json_fails() {
        let err = compile("{not json").unwrap_err();
        assert!(matches!(err, EngineError::FlowParse(_)));
    }

    #[test]
    fn zero_instances_fails() {
        let err = compile(&doc(json!([]), json!([]))).unwrap_err();
        assert_eq!(err.to_string(), "no sipInstance nodes found");
    }

    #[test]
    fn missing_instance_ref_names_the_node() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                { "id": "cmd1", "type": "command", "data": { "command": "Release" } },
            ]),
            json!([]),
        );
        let err = compile(&flow).unwrap_err();
        assert_eq!(err.to_string(), "node cmd1 is missing sipInstanceId");
    }

    #[test]
    fn unknown_instance_ref_fails() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                command_node("cmd1", "ghost", "Release", json!({})),
            ]),
            json!([]),
        );
        let err = compile(&flow).unwrap_err();
        assert_eq!(
            err.to_string(),
            "node cmd1 references unknown instance ghost"
        );
    }

    #[test]
    fn unsupported_command_fails() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                command_node("cmd1", "inst1", "Teleport", json!({})),
            ]),
            json!([]),
        );
        let err = compile(&flow).unwrap_err();
        assert!(err.to_string().contains("cmd1"));
        assert!(err.to_string().contains("Teleport"));
    }

    #[test]
    fn instance_edge_builds_start_nodes() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                event_node("ev1", "inst1", "TIMEOUT", json!({ "timeout": 500 })),
            ]),
            json!([edge("e1", "inst1", "ev1")]),
        );
        let graph = compile(&flow).unwrap();
        let chain = graph.instance(&InstanceId::from("inst1")).unwrap();
        assert_eq!(chain.start_nodes, vec![NodeId::from("ev1")]);
    }

    #[test]
    fn success_and_failure_branches() {
        let mut failure_edge = edge("e2", "cmd1", "ev_fail");
        failure_edge["sourceHandle"] = json!("failure");
        let flow = doc(
            json!([
                instance_node("inst1"),
                command_node("cmd1", "inst1", "MakeCall", json!({ "targetUri": "sip:b@h" })),
                event_node("ev_ok", "inst1", "RINGING", json!({})),
                event_node("ev_fail", "inst1", "TIMEOUT", json!({ "timeout": 100 })),
            ]),
            json!([edge("e1", "cmd1", "ev_ok"), failure_edge]),
        );
        let graph = compile(&flow).unwrap();
        let node = graph.node(&NodeId::from("cmd1")).unwrap();
        assert_eq!(node.success_next, Some(NodeId::from("ev_ok")));
        assert_eq!(node.failure_next, Some(NodeId::from("ev_fail")));
    }

    #[test]
    fn branch_type_data_marks_failure() {
        let mut failure_edge = edge("e1", "cmd1", "ev_fail");
        failure_edge["data"] = json!({ "branchType": "failure" });
        let flow = doc(
            json!([
                instance_node("inst1"),
                command_node("cmd1", "inst1", "Release", json!({})),
                event_node("ev_fail", "inst1", "TIMEOUT", json!({ "timeout": 100 })),
            ]),
            json!([failure_edge]),
        );
        let graph = compile(&flow).unwrap();
        let node = graph.node(&NodeId::from("cmd1")).unwrap();
        assert_eq!(node.failure_next, Some(NodeId::from("ev_fail")));
        assert_eq!(node.success_next, None);
    }

    #[test]
    fn unresolved_edges_are_skipped() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                command_node("cmd1", "inst1", "Release", json!({})),
            ]),
            json!([
                edge("e1", "cmd1", "ghost"),
                edge("e2", "ghost", "cmd1"),
                edge("e3", "inst1", "ghost"),
            ]),
        );
        let graph = compile(&flow).unwrap();
        let node = graph.node(&NodeId::from("cmd1")).unwrap();
        assert_eq!(node.success_next, None);
        assert!(graph
            .instance(&InstanceId::from("inst1"))
            .unwrap()
            .start_nodes
            .is_empty());
    }

    #[test]
    fn codecs_default_when_absent_or_empty() {
        let flow = doc(
            json!([
                instance_node("no_codecs"),
                { "id": "empty_codecs", "type": "sipInstance", "data": { "codecs": [] } },
            ]),
            json!([]),
        );
        let graph = compile(&flow).unwrap();
        for id in ["no_codecs", "empty_codecs"] {
            let chain = graph.instance(&InstanceId::from(id)).unwrap();
            assert_eq!(chain.config.codecs, vec!["PCMU", "PCMA"]);
        }
    }

    #[test]
    fn codec_order_and_invalid_names_preserved() {
        let flow = doc(
            json!([
                { "id": "inst1", "type": "sipInstance",
                  "data": { "codecs": ["G722", "NOT_A_CODEC", "PCMU"] } },
            ]),
            json!([]),
        );
        let graph = compile(&flow).unwrap();
        let chain = graph.instance(&InstanceId::from("inst1")).unwrap();
        assert_eq!(chain.config.codecs, vec!["G722", "NOT_A_CODEC", "PCMU"]);
    }

    #[test]
    fn instance_defaults() {
        let flow = doc(json!([{ "id": "inst1", "type": "sipInstance", "data": {} }]), json!([]));
        let graph = compile(&flow).unwrap();
        let config = &graph.instance(&InstanceId::from("inst1")).unwrap().config;
        assert_eq!(config.mode, "DN");
        assert!(config.register);
        assert_eq!(config.dn, "");
    }

    #[test]
    fn timeout_defaults_to_ten_seconds() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                event_node("ev1", "inst1", "INCOMING", json!({})),
            ]),
            json!([]),
        );
        let graph = compile(&flow).unwrap();
        let node = graph.node(&NodeId::from("ev1")).unwrap();
        assert_eq!(node.timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn custom_timeout_is_honored() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                event_node("ev1", "inst1", "INCOMING", json!({ "timeout": 5000 })),
            ]),
            json!([]),
        );
        let graph = compile(&flow).unwrap();
        let node = graph.node(&NodeId::from("ev1")).unwrap();
        assert_eq!(node.timeout, Duration::from_secs(5));
    }

    #[test]
    fn wrong_typed_fields_fall_back_to_defaults() {
        let flow = doc(
            json!([
                { "id": "inst1", "type": "sipInstance",
                  "data": { "label": 42, "register": "yes", "codecs": [1, 2] } },
                event_node("ev1", "inst1", "TIMEOUT", json!({ "timeout": "soon" })),
            ]),
            json!([]),
        );
        let graph = compile(&flow).unwrap();
        let config = &graph.instance(&InstanceId::from("inst1")).unwrap().config;
        assert_eq!(config.label, "");
        assert!(config.register);
        assert_eq!(config.codecs, vec!["PCMU", "PCMA"]);
        let node = graph.node(&NodeId::from("ev1")).unwrap();
        assert_eq!(node.timeout, Duration::from_millis(10_000));
    }

    #[test]
    fn unknown_node_types_are_ignored() {
        let flow = doc(
            json!([
                instance_node("inst1"),
                { "id": "note1", "type": "stickyNote", "data": { "text": "hi" } },
            ]),
            json!([edge("e1", "note1", "inst1")]),
        );
        let graph = compile(&flow).unwrap();
        assert!(graph.nodes.is_empty());
    }
}
