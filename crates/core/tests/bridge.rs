mod common;

use base64::Engine;
use common::{ScriptedConnector, TestClient, supervisor};
use live_bridge_core::{
    CloseReason, ConnectError, ConnectParams, ModalitySet, SessionPolicy, SessionState,
    TranslatorDefaults, UpstreamEvent, UpstreamInput,
    upstream::{FunctionCall, FunctionResult, Severity, Turn},
};
use serde_json::json;
use std::time::Duration;

fn kinds(envelopes: &[serde_json::Value]) -> Vec<&str> {
    envelopes.iter().map(|e| e["type"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn test_config_then_message_gets_ack_and_response() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"kind": "config", "model": "m1", "modalities": ["TEXT"]}));
    let ack = client.next_envelope().await;
    assert_eq!(ack["type"], "config_success");
    assert_eq!(ack["message"], "Configuration acknowledged");
    assert_eq!(ack["applied"], true);
    assert_eq!(ack["client_id"], "203.0.113.7");
    assert_eq!(ack["ip"], "203.0.113.7");

    client.send(json!({"kind": "message", "text": "Hello"}));
    let response = client.next_envelope().await;
    assert_eq!(response, json!({"type": "response", "text": "echo: Hello", "turn": 1}));
    assert_eq!(
        client.next_envelope().await,
        json!({"type": "turn_complete", "turn": 1})
    );

    assert_eq!(client.session.state(), SessionState::Active);
    let handle = connector.handle();
    assert_eq!(handle.params.model, "m1");
    assert_eq!(handle.params.modalities, ModalitySet::TEXT_ONLY);
    assert_eq!(handle.sent(), vec![UpstreamInput::Turn(Turn::complete("Hello"))]);
}

#[tokio::test]
async fn test_malformed_frame_is_reported_and_session_survives() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send_raw("{not json");
    let error = client.next_envelope().await;
    assert_eq!(error["type"], "error");
    assert!(error["data"].as_str().unwrap().starts_with("Invalid message format"));
    assert_eq!(client.session.state(), SessionState::Init);

    client.send(json!({"type": "message", "data": "still here?"}));
    let replies = client.until("turn_complete").await;
    assert_eq!(kinds(&replies), ["response", "turn_complete"]);
    assert_eq!(replies[0]["text"], "echo: still here?");
    assert_eq!(client.session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_malformed_frame_on_open_channel_keeps_session_active() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");
    assert_eq!(client.session.state(), SessionState::Active);

    client.send_raw("{bad");
    let error = client.next_envelope().await;
    assert_eq!(error["type"], "error");
    assert!(error["data"].as_str().unwrap().starts_with("Invalid message format"));
    assert_eq!(client.session.state(), SessionState::Active);
    assert_eq!(connector.handle().close_calls(), 0);

    client.send(json!({"type": "message", "data": "after garbage"}));
    let replies = client.until("turn_complete").await;
    assert_eq!(kinds(&replies), ["response", "turn_complete"]);
    assert_eq!(replies[0]["text"], "echo: after garbage");
    assert_eq!(connector.opens(), 1);
    assert_eq!(
        connector.handle().sent(),
        vec![UpstreamInput::Turn(Turn::complete("after garbage"))]
    );
}

#[tokio::test]
async fn test_dual_modality_turn_has_text_and_audio() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1", "modalities": ["TEXT", "AUDIO"]}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");

    client.send(json!({"type": "message", "data": "Speak"}));
    let replies = client.until("turn_complete").await;
    assert_eq!(kinds(&replies), ["audio", "response", "turn_complete"]);
    assert_eq!(replies[0]["data"], "AAECAw==");
    assert_eq!(replies[0]["format"], "pcm16");
    assert_eq!(replies[0]["sampleRate"], 24_000);
    assert!(replies.iter().all(|e| e["turn"] == 1));
}

#[tokio::test]
async fn test_message_without_config_opens_text_only_default() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "text", "data": "first"}));
    client.send(json!({"type": "message", "data": "second"}));
    let mut replies = client.until("turn_complete").await;
    replies.extend(client.until("turn_complete").await);

    assert_eq!(
        kinds(&replies),
        ["response", "turn_complete", "response", "turn_complete"]
    );
    assert_eq!(replies[2]["turn"], 2);
    assert_eq!(connector.opens(), 1);
    assert_eq!(
        connector.handle().params,
        ConnectParams::lazy_default(&TranslatorDefaults::default())
    );
}

#[tokio::test]
async fn test_upstream_fault_reports_one_error_and_closes() {
    let connector = ScriptedConnector::silent();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");
    client.send(json!({"type": "message", "data": "Hello"}));

    let handle = connector.handle();
    handle.push(UpstreamEvent::TextDelta("partial".into()));
    handle.push(UpstreamEvent::ErrorNotice {
        message: "socket reset".into(),
        severity: Severity::Fatal,
    });

    let rest = client.until_closed().await;
    assert_eq!(
        rest,
        vec![
            json!({"type": "response", "text": "partial", "turn": 1}),
            json!({"type": "error", "data": "socket reset"}),
        ]
    );
    client.closed().await;
    assert_eq!(handle.close_calls(), 1);
    assert_eq!(client.session.state(), SessionState::Closed);
    assert_eq!(
        client.session.close_reason(),
        Some(CloseReason::UpstreamFault("socket reset".into()))
    );
}

#[tokio::test]
async fn test_concurrent_close_triggers_tear_down_once() {
    let connector = ScriptedConnector::silent();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");

    let handle = connector.handle();
    handle.push(UpstreamEvent::ErrorNotice {
        message: "socket reset".into(),
        severity: Severity::Fatal,
    });
    client.disconnect();

    let rest = client.until_closed().await;
    let errors = kinds(&rest).iter().filter(|k| **k == "error").count();
    client.closed().await;
    assert_eq!(client.session.state(), SessionState::Closed);
    assert_eq!(handle.close_calls(), 1);
    match client.session.close_reason() {
        Some(CloseReason::UpstreamFault(message)) => {
            assert_eq!(message, "socket reset");
            assert_eq!(errors, 1);
        }
        Some(CloseReason::ClientDisconnected) => assert_eq!(errors, 0),
        other => panic!("unexpected close reason {other:?}"),
    }
    assert_eq!(supervisor.live_sessions(), 0);
}

#[tokio::test]
async fn test_messages_are_forwarded_in_arrival_order() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    let expected: Vec<String> = (0..20).map(|i| format!("message {i}")).collect();
    for text in &expected {
        client.send(json!({"type": "message", "data": text}));
    }

    assert_eq!(client.next_envelope().await["type"], "config_success");
    for (i, text) in expected.iter().enumerate() {
        let replies = client.until("turn_complete").await;
        assert_eq!(replies[0]["text"], format!("echo: {text}"));
        assert_eq!(replies[0]["turn"], i as u64 + 1);
    }

    let forwarded: Vec<String> = connector
        .handle()
        .sent()
        .into_iter()
        .map(|input| match input {
            UpstreamInput::Turn(turn) => {
                assert!(turn.end_of_turn);
                turn.content
            }
            other => panic!("unexpected upstream input {other:?}"),
        })
        .collect();
    assert_eq!(forwarded, expected);
}

#[tokio::test]
async fn test_function_call_round_trip() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1", "enable_code_execution": true}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");
    let handle = connector.handle();
    assert!(handle.params.tools.code_execution);

    handle.push(UpstreamEvent::FunctionCall(FunctionCall {
        id: Some("call-1".into()),
        name: "lookup".into(),
        args: json!({"q": "rust"}),
    }));
    assert_eq!(
        client.next_envelope().await,
        json!({
            "type": "function_call",
            "data": {"id": "call-1", "name": "lookup", "args": {"q": "rust"}},
            "turn": 1
        })
    );

    client.send(json!({
        "type": "function_result",
        "data": {"id": "call-1", "name": "lookup", "response": {"hits": 3}}
    }));
    let replies = client.until("turn_complete").await;
    assert_eq!(replies[0]["text"], "result from lookup");
    assert_eq!(
        handle.sent(),
        vec![UpstreamInput::FunctionResult(FunctionResult {
            id: Some("call-1".into()),
            name: "lookup".into(),
            response: json!({"hits": 3}),
        })]
    );
}

#[tokio::test]
async fn test_function_result_without_channel_is_rejected() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "function_result", "data": {"name": "lookup"}}));
    assert_eq!(
        client.next_envelope().await,
        json!({"type": "error", "data": "No active upstream session for function result"})
    );
    assert_eq!(connector.opens(), 0);
    assert_eq!(client.session.state(), SessionState::Init);
}

#[tokio::test]
async fn test_audio_input_variants() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "audio", "data": {"data": "AAA=", "format": "webm"}}));
    assert_eq!(
        client.next_envelope().await,
        json!({"type": "system", "data": "Audio requires PCM format - webm is not supported"})
    );

    client.send(json!({"type": "audio", "data": "%%%"}));
    let error = client.next_envelope().await;
    assert_eq!(error["type"], "error");
    assert!(error["data"].as_str().unwrap().contains("not valid base64"));
    assert_eq!(connector.opens(), 0);

    let pcm = base64::engine::general_purpose::STANDARD.encode([1u8, 0, 2, 0]);
    client.send(json!({"type": "audio", "data": {"data": pcm, "mime_type": "audio/pcm;rate=16000"}}));
    client.send(json!({"type": "message", "data": "done"}));
    client.until("turn_complete").await;

    let sent = connector.handle().sent();
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        UpstreamInput::Audio { data, mime_type } => {
            assert_eq!(data.as_ref(), &[1, 0, 2, 0]);
            assert_eq!(mime_type, "audio/pcm;rate=16000");
        }
        other => panic!("expected audio, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_config_is_acknowledged_but_not_applied() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["applied"], true);

    client.send(json!({"type": "config", "data": {"model": "m2", "client_id": "kiosk-4"}}));
    let ack = client.next_envelope().await;
    assert_eq!(ack["type"], "config_success");
    assert_eq!(ack["applied"], false);
    assert_eq!(ack["client_id"], "kiosk-4");

    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.handle().params.model, "m1");
}

#[tokio::test]
async fn test_invalid_config_keeps_session_open() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"modalities": ["TEXT"], "voice": "Zephyr"}}));
    let error = client.next_envelope().await;
    assert_eq!(error["type"], "error");
    assert!(error["data"].as_str().unwrap().starts_with("Invalid configuration"));
    assert_eq!(client.session.state(), SessionState::Init);
    assert_eq!(connector.opens(), 0);

    client.send(json!({"type": "config", "data": {"modalities": ["TEXT", "AUDIO"], "voice": "Zephyr"}}));
    assert_eq!(client.next_envelope().await["applied"], true);
    assert_eq!(connector.handle().params.voice.as_deref(), Some("Zephyr"));
}

#[tokio::test]
async fn test_unknown_and_server_kinds_are_protocol_errors() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "bogus"}));
    assert_eq!(
        client.next_envelope().await,
        json!({"type": "error", "data": "Unknown message type 'bogus'"})
    );
    client.send(json!({"type": "response", "text": "hi"}));
    assert_eq!(
        client.next_envelope().await,
        json!({"type": "error", "data": "'response' messages are not accepted from clients"})
    );
    assert_eq!(client.session.state(), SessionState::Init);
}

#[tokio::test]
async fn test_connect_failure_closes_session() {
    let connector = ScriptedConnector::new();
    connector.fail_next(ConnectError::Rejected("API key not valid".into()));
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    let rest = client.until_closed().await;
    assert_eq!(kinds(&rest), ["error"]);
    assert!(rest[0]["data"].as_str().unwrap().contains("API key not valid"));

    client.closed().await;
    assert!(matches!(
        client.session.close_reason(),
        Some(CloseReason::ConnectFailed(_))
    ));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn test_recoverable_upstream_error_keeps_session_active() {
    let connector = ScriptedConnector::silent();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");

    connector.handle().push(UpstreamEvent::ErrorNotice {
        message: "rate limited".into(),
        severity: Severity::Recoverable,
    });
    connector
        .handle()
        .push(UpstreamEvent::SystemNotice("Server will disconnect in 10s".into()));

    assert_eq!(
        client.next_envelope().await,
        json!({"type": "error", "data": "rate limited"})
    );
    assert_eq!(client.next_envelope().await["type"], "system");
    assert_eq!(client.session.state(), SessionState::Active);
}

#[tokio::test]
async fn test_client_close_releases_upstream() {
    let connector = ScriptedConnector::silent();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");
    client.send_close();

    assert!(client.until_closed().await.is_empty());
    client.closed().await;
    assert_eq!(connector.handle().close_calls(), 1);
    assert_eq!(client.session.close_reason(), Some(CloseReason::ClientClosed));
}

#[tokio::test]
async fn test_transport_error_closes_without_envelope() {
    let connector = ScriptedConnector::silent();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "message", "data": "hi"}));
    client.fail_transport();

    assert!(client.until_closed().await.is_empty());
    client.closed().await;
    assert_eq!(connector.handle().close_calls(), 1);
    assert!(matches!(
        client.session.close_reason(),
        Some(CloseReason::Transport(_))
    ));
}

#[tokio::test]
async fn test_upstream_close_ends_session_quietly() {
    let connector = ScriptedConnector::silent();
    let supervisor = supervisor(&connector, SessionPolicy::default());
    let mut client = TestClient::connect(&supervisor);

    client.send(json!({"type": "config", "data": {"model": "m1"}}));
    assert_eq!(client.next_envelope().await["type"], "config_success");
    connector.handle().push(UpstreamEvent::Closed);

    assert!(client.until_closed().await.is_empty());
    client.closed().await;
    assert_eq!(connector.handle().close_calls(), 1);
    assert_eq!(client.session.close_reason(), Some(CloseReason::UpstreamClosed));
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_closed() {
    let connector = ScriptedConnector::new();
    let supervisor = supervisor(
        &connector,
        SessionPolicy {
            idle_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        },
    );
    let mut client = TestClient::connect(&supervisor);

    let rest = client.until_closed().await;
    assert_eq!(
        rest,
        vec![json!({"type": "error", "data": "Connection closed due to inactivity"})]
    );
    client.closed().await;
    assert_eq!(client.session.close_reason(), Some(CloseReason::IdleTimeout));
    assert_eq!(connector.opens(), 0);
}
