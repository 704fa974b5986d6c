//! Shared helpers for engine integration tests: flow document builders, a
//! loopback-backed engine, and event collection.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use sipflow_engine::testkit::{LoopbackNetwork, MemoryScenarioStore};
use sipflow_engine::{ChannelEventSink, Engine, EngineEvent};

pub const SCENARIO_ID: &str = "s1";

pub fn instance(id: &str, dn: &str) -> Value {
    json!({
        "id": id,
        "type": "sipInstance",
        "data": { "label": id, "dn": dn }
    })
}

pub fn instance_with_codecs(id: &str, dn: &str, codecs: &[&str]) -> Value {
    json!({
        "id": id,
        "type": "sipInstance",
        "data": { "label": id, "dn": dn, "codecs": codecs }
    })
}

pub fn command(id: &str, instance: &str, name: &str, extra: Value) -> Value {
    let mut data = json!({ "sipInstanceId": instance, "command": name });
    merge(&mut data, extra);
    json!({ "id": id, "type": "command", "data": data })
}

pub fn event(id: &str, instance: &str, name: &str, extra: Value) -> Value {
    let mut data = json!({ "sipInstanceId": instance, "event": name });
    merge(&mut data, extra);
    json!({ "id": id, "type": "event", "data": data })
}

pub fn edge(id: &str, source: &str, target: &str) -> Value {
    json!({ "id": id, "source": source, "target": target })
}

pub fn failure_edge(id: &str, source: &str, target: &str) -> Value {
    json!({ "id": id, "source": source, "target": target, "sourceHandle": "failure" })
}

pub fn flow(nodes: Vec<Value>, edges: Vec<Value>) -> String {
    json!({ "nodes": nodes, "edges": edges }).to_string()
}

fn merge(data: &mut Value, extra: Value) {
    if let (Some(map), Some(extra_map)) = (data.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_map {
            map.insert(k.clone(), v.clone());
        }
    }
}

/// Build an engine over the loopback network with the flow stored under
/// [`SCENARIO_ID`]. Each test gets its own base port so ports never clash
/// across concurrently running tests.
pub fn harness(flow_data: &str, base_port: u16) -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
    let store = Arc::new(MemoryScenarioStore::new());
    store.insert(SCENARIO_ID, "test scenario", flow_data);
    let (sink, events) = ChannelEventSink::new();
    let engine = Engine::with_base_port(
        store,
        Arc::new(LoopbackNetwork::new()),
        Arc::new(sink),
        base_port,
    );
    (engine, events)
}

/// Drain events until a terminal lifecycle event arrives. Panics if none
/// shows up within the deadline.
pub async fn collect_run(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    deadline: Duration,
) -> Vec<EngineEvent> {
    let mut collected = Vec::new();
    let collect = async {
        while let Some(event) = events.recv().await {
            let terminal = matches!(
                event,
                EngineEvent::ScenarioCompleted { .. }
                    | EngineEvent::ScenarioFailed { .. }
                    | EngineEvent::ScenarioStopped { .. }
            );
            collected.push(event);
            if terminal {
                break;
            }
        }
    };
    tokio::time::timeout(deadline, collect)
        .await
        .expect("run did not reach a terminal event in time");
    collected
}

pub fn event_names(events: &[EngineEvent]) -> Vec<&'static str> {
    events.iter().map(EngineEvent::name).collect()
}

pub fn count_named(events: &[EngineEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

/// Positions of node-state transitions as (nodeId, previous, new).
pub fn node_transitions(events: &[EngineEvent]) -> Vec<(String, String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::NodeStateChanged {
                node_id,
                previous,
                state,
                ..
            } => Some((
                node_id.to_string(),
                previous.as_str().to_string(),
                state.as_str().to_string(),
            )),
            _ => None,
        })
        .collect()
}
