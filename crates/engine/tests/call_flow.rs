//! End-to-end call flows over the loopback network.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use sipflow_engine::EngineEvent;

const RUN_DEADLINE: Duration = Duration::from_secs(10);

fn all_terminal_states_completed(events: &[EngineEvent]) -> bool {
    node_transitions(events)
        .iter()
        .filter(|(_, _, new)| new != "running")
        .all(|(_, _, new)| new == "completed")
}

/// Caller places a call, sends a digit, and releases; callee answers,
/// expects the digit, and observes the disconnect.
#[tokio::test]
async fn basic_call_with_dtmf() {
    let callee_port = 42002;
    let flow = flow(
        vec![
            instance("a", "1000"),
            instance("b", "2000"),
            command(
                "make",
                "a",
                "MakeCall",
                json!({ "targetUri": format!("sip:2000@127.0.0.1:{callee_port}") }),
            ),
            command("dtmf", "a", "SendDTMF", json!({ "digits": "1", "intervalMs": 50 })),
            event("settle", "a", "TIMEOUT", json!({ "timeout": 300 })),
            command("rel", "a", "Release", json!({})),
            event("inc", "b", "INCOMING", json!({ "timeout": 5000 })),
            command("ans", "b", "Answer", json!({})),
            event(
                "recv",
                "b",
                "DTMFReceived",
                json!({ "expectedDigit": "1", "timeout": 5000 }),
            ),
            event("disc", "b", "DISCONNECTED", json!({ "timeout": 5000 })),
        ],
        vec![
            edge("e1", "a", "make"),
            edge("e2", "make", "dtmf"),
            edge("e3", "dtmf", "settle"),
            edge("e4", "settle", "rel"),
            edge("e5", "b", "inc"),
            edge("e6", "inc", "ans"),
            edge("e7", "ans", "recv"),
            edge("e8", "recv", "disc"),
        ],
    );
    let (engine, mut events) = harness(&flow, 42000);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:completed"), 1);
    assert_eq!(count_named(&collected, "scenario:failed"), 0);
    assert!(all_terminal_states_completed(&collected));

    // The INVITE leaves a protocol-annotated log line behind.
    let has_invite_log = collected.iter().any(|event| match event {
        EngineEvent::ActionLog { sip_message, .. } => sip_message
            .as_ref()
            .is_some_and(|sip| sip.method == "INVITE"),
        _ => false,
    });
    assert!(has_invite_log);
}

/// Caller holds then retrieves; callee observes HELD and RETRIEVED through
/// the SIP event bus, then the disconnect.
#[tokio::test]
async fn hold_and_retrieve_flow() {
    let callee_port = 42102;
    let flow = flow(
        vec![
            instance("a", "1000"),
            instance("b", "2000"),
            command(
                "make",
                "a",
                "MakeCall",
                json!({ "targetUri": format!("sip:2000@127.0.0.1:{callee_port}") }),
            ),
            event("settle1", "a", "TIMEOUT", json!({ "timeout": 300 })),
            command("hold", "a", "Hold", json!({})),
            event("settle2", "a", "TIMEOUT", json!({ "timeout": 300 })),
            command("retr", "a", "Retrieve", json!({})),
            event("settle3", "a", "TIMEOUT", json!({ "timeout": 200 })),
            command("rel", "a", "Release", json!({})),
            event("inc", "b", "INCOMING", json!({ "timeout": 5000 })),
            command("ans", "b", "Answer", json!({})),
            event("held", "b", "HELD", json!({ "timeout": 5000 })),
            event("retrieved", "b", "RETRIEVED", json!({ "timeout": 5000 })),
            event("disc", "b", "DISCONNECTED", json!({ "timeout": 5000 })),
        ],
        vec![
            edge("e1", "a", "make"),
            edge("e2", "make", "settle1"),
            edge("e3", "settle1", "hold"),
            edge("e4", "hold", "settle2"),
            edge("e5", "settle2", "retr"),
            edge("e6", "retr", "settle3"),
            edge("e7", "settle3", "rel"),
            edge("e8", "b", "inc"),
            edge("e9", "inc", "ans"),
            edge("e10", "ans", "held"),
            edge("e11", "held", "retrieved"),
            edge("e12", "retrieved", "disc"),
        ],
    );
    let (engine, mut events) = harness(&flow, 42100);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:completed"), 1);
    assert_eq!(count_named(&collected, "scenario:failed"), 0);
    assert!(all_terminal_states_completed(&collected));

    let messages: Vec<String> = collected
        .iter()
        .filter_map(|event| match event {
            EngineEvent::ActionLog { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert!(messages.iter().any(|m| m == "Call HELD by remote party"));
    assert!(messages.iter().any(|m| m == "Call RETRIEVED by remote party"));
}

/// Blind transfer: the transferring leg sends REFER and drops; the callee
/// observes TRANSFERRED and then the disconnect.
#[tokio::test]
async fn blind_transfer_flow() {
    let callee_port = 42202;
    let flow = flow(
        vec![
            instance("a", "1000"),
            instance("b", "2000"),
            command(
                "make",
                "a",
                "MakeCall",
                json!({ "targetUri": format!("sip:2000@127.0.0.1:{callee_port}") }),
            ),
            event("settle", "a", "TIMEOUT", json!({ "timeout": 300 })),
            command(
                "xfer",
                "a",
                "BlindTransfer",
                json!({ "targetUser": "3000", "targetHost": "127.0.0.1" }),
            ),
            event("inc", "b", "INCOMING", json!({ "timeout": 5000 })),
            command("ans", "b", "Answer", json!({})),
            event("xferred", "b", "TRANSFERRED", json!({ "timeout": 5000 })),
            event("disc", "b", "DISCONNECTED", json!({ "timeout": 5000 })),
        ],
        vec![
            edge("e1", "a", "make"),
            edge("e2", "make", "settle"),
            edge("e3", "settle", "xfer"),
            edge("e4", "b", "inc"),
            edge("e5", "inc", "ans"),
            edge("e6", "ans", "xferred"),
            edge("e7", "xferred", "disc"),
        ],
    );
    let (engine, mut events) = harness(&flow, 42200);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:completed"), 1);
    assert_eq!(count_named(&collected, "scenario:failed"), 0);

    let has_refer_log = collected.iter().any(|event| match event {
        EngineEvent::ActionLog { sip_message, .. } => sip_message
            .as_ref()
            .is_some_and(|sip| sip.method == "REFER"),
        _ => false,
    });
    assert!(has_refer_log);
}

/// Disjoint codec sets: the answer fails negotiation on both legs and the
/// run fails exactly once.
#[tokio::test]
async fn codec_mismatch_fails_the_run() {
    let callee_port = 42302;
    let flow = flow(
        vec![
            instance_with_codecs("a", "1000", &["PCMU"]),
            instance_with_codecs("b", "2000", &["G722"]),
            command(
                "make",
                "a",
                "MakeCall",
                json!({ "targetUri": format!("sip:2000@127.0.0.1:{callee_port}") }),
            ),
            event("inc", "b", "INCOMING", json!({ "timeout": 5000 })),
            command("ans", "b", "Answer", json!({})),
        ],
        vec![
            edge("e1", "a", "make"),
            edge("e2", "b", "inc"),
            edge("e3", "inc", "ans"),
        ],
    );
    let (engine, mut events) = harness(&flow, 42300);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:failed"), 1);
    assert_eq!(count_named(&collected, "scenario:completed"), 0);

    let failed = collected
        .iter()
        .find(|e| e.name() == "scenario:failed")
        .unwrap();
    let error = failed.payload()["error"].as_str().unwrap().to_lowercase();
    assert!(error.contains("negotiat"), "error was: {error}");
}

/// Caller plays an audio file into an answered call. The playback log
/// reports exactly the file's size in bytes.
#[tokio::test]
async fn play_audio_streams_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let audio_path = dir.path().join("prompt.pcmu");
    std::fs::write(&audio_path, vec![0u8; 1600]).unwrap();

    let callee_port = 42402;
    let flow = flow(
        vec![
            instance("a", "1000"),
            instance("b", "2000"),
            command(
                "make",
                "a",
                "MakeCall",
                json!({ "targetUri": format!("sip:2000@127.0.0.1:{callee_port}") }),
            ),
            command(
                "play",
                "a",
                "PlayAudio",
                json!({ "filePath": audio_path.to_str().unwrap() }),
            ),
            command("rel", "a", "Release", json!({})),
            event("inc", "b", "INCOMING", json!({ "timeout": 5000 })),
            command("ans", "b", "Answer", json!({})),
            event("disc", "b", "DISCONNECTED", json!({ "timeout": 5000 })),
        ],
        vec![
            edge("e1", "a", "make"),
            edge("e2", "make", "play"),
            edge("e3", "play", "rel"),
            edge("e4", "b", "inc"),
            edge("e5", "inc", "ans"),
            edge("e6", "ans", "disc"),
        ],
    );
    let (engine, mut events) = harness(&flow, 42400);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:completed"), 1);
    assert!(all_terminal_states_completed(&collected));

    let messages: Vec<String> = collected
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ActionLog { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert!(
        messages.iter().any(|m| m == "Playback completed (1600 bytes)"),
        "messages were: {messages:?}"
    );
}

/// PlayAudio checks the file before looking for a dialog, so a missing
/// file fails the run even with no call in progress.
#[tokio::test]
async fn play_audio_missing_file_fails_the_run() {
    let flow = flow(
        vec![
            instance("a", "1000"),
            command(
                "play",
                "a",
                "PlayAudio",
                json!({ "filePath": "/nonexistent/prompt.pcmu" }),
            ),
        ],
        vec![edge("e1", "a", "play")],
    );
    let (engine, mut events) = harness(&flow, 42500);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:failed"), 1);
    assert_eq!(count_named(&collected, "scenario:completed"), 0);

    let failed = collected
        .iter()
        .find(|e| e.name() == "scenario:failed")
        .unwrap();
    let error = failed.payload()["error"].as_str().unwrap().to_string();
    assert!(error.contains("audio file not found"), "error was: {error}");
    assert!(error.contains("/nonexistent/prompt.pcmu"), "error was: {error}");
}

/// Release with no active dialog succeeds: the call may already be torn
/// down by the remote side, which is not an error.
#[tokio::test]
async fn release_without_dialog_is_a_no_op() {
    let flow = flow(
        vec![
            instance("a", "1000"),
            command("rel", "a", "Release", json!({})),
        ],
        vec![edge("e1", "a", "rel")],
    );
    let (engine, mut events) = harness(&flow, 42600);

    engine.start_scenario(SCENARIO_ID).await.unwrap();
    let collected = collect_run(&mut events, RUN_DEADLINE).await;

    assert_eq!(count_named(&collected, "scenario:completed"), 1);
    assert_eq!(count_named(&collected, "scenario:failed"), 0);

    let messages: Vec<String> = collected
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ActionLog { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect();
    assert!(
        messages
            .iter()
            .any(|m| m == "No active dialog to release (already terminated)"),
        "messages were: {messages:?}"
    );
}
