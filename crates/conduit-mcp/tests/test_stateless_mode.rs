mod common;

use common::{ACCEPT_BOTH, first_message_event, start_streamable_server};
use conduit_mcp::{
    model::JsonRpcMessage, transport::streamable_http_server::StreamableHttpServerConfig,
};
use reqwest::StatusCode;
use serde_json::{Value, json};

fn stateless_config() -> StreamableHttpServerConfig {
    StreamableHttpServerConfig {
        stateful_mode: false,
        ..Default::default()
    }
}

async fn stateless_initialize(client: &reqwest::Client, url: &str) -> String {
    let response = client
        .post(url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "stateless-client", "version": "2.0.0"}
            }
        }))
        .send()
        .await
        .expect("POST initialize");
    assert!(response.status().is_success());
    let envelope = response
        .headers()
        .get("Mcp-Session-Id")
        .expect("envelope header")
        .to_str()
        .expect("header value")
        .to_string();
    let body = response.bytes().await.expect("body");
    let JsonRpcMessage::Response(init) = first_message_event(&body) else {
        panic!("expected an initialize response");
    };
    assert_eq!(init.result["serverInfo"]["name"], "test-server");
    envelope
}

#[tokio::test]
async fn test_initialize_issues_an_encrypted_envelope() {
    let server = start_streamable_server(stateless_config()).await;
    let client = reqwest::Client::new();

    let envelope = stateless_initialize(&client, &server.url).await;
    // opaque, but must not be trivially readable
    assert!(envelope.len() > 32);
    assert!(!envelope.contains("stateless-client"));

    server.ct.cancel();
}

#[tokio::test]
async fn test_request_with_envelope_reconstructs_a_session() {
    let server = start_streamable_server(stateless_config()).await;
    let client = reqwest::Client::new();

    let envelope = stateless_initialize(&client, &server.url).await;
    let response = client
        .post(&server.url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", &envelope)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "stateless"}}
        }))
        .send()
        .await
        .expect("POST tools/call");
    assert!(response.status().is_success());
    let body = response.bytes().await.expect("body");
    let JsonRpcMessage::Response(reply) = first_message_event(&body) else {
        panic!("expected a response");
    };
    assert_eq!(reply.result["content"][0]["text"], "stateless");

    server.ct.cancel();
}

#[tokio::test]
async fn test_tampered_envelope_is_404_session_not_found() {
    let server = start_streamable_server(stateless_config()).await;
    let client = reqwest::Client::new();

    let envelope = stateless_initialize(&client, &server.url).await;
    let mut tampered = envelope.into_bytes();
    let last = tampered.len() - 1;
    tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(tampered).expect("ascii");

    let response = client
        .post(&server.url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .header("Mcp-Session-Id", &tampered)
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .send()
        .await
        .expect("POST");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["code"], -32001);

    server.ct.cancel();
}

#[tokio::test]
async fn test_get_and_delete_are_not_exposed() {
    let server = start_streamable_server(stateless_config()).await;
    let client = reqwest::Client::new();

    let envelope = stateless_initialize(&client, &server.url).await;

    let response = client
        .get(&server.url)
        .header("Accept", "text/event-stream")
        .header("Mcp-Session-Id", &envelope)
        .send()
        .await
        .expect("GET");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = client
        .delete(&server.url)
        .header("Mcp-Session-Id", &envelope)
        .send()
        .await
        .expect("DELETE");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    server.ct.cancel();
}

#[tokio::test]
async fn test_request_without_envelope_is_rejected() {
    let server = start_streamable_server(stateless_config()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(&server.url)
        .header("Accept", ACCEPT_BOTH)
        .header("Content-Type", "application/json")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .expect("POST");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.ct.cancel();
}

#[tokio::test]
async fn test_no_server_state_is_retained() {
    let server = start_streamable_server(stateless_config()).await;
    let client = reqwest::Client::new();

    stateless_initialize(&client, &server.url).await;
    assert!(server.registry.is_empty().await);

    server.ct.cancel();
}
