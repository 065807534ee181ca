//! End-to-end tests: the real axum app on a loopback port, driven by a
//! WebSocket client, with the channel engine standing in for the hosted one.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use voxrelay_engine::{ChannelConnector, ChannelEngineHandle, EngineEvent, EngineRequest};
use voxrelay_server::config::Config;
use voxrelay_server::registry::SessionRegistry;
use voxrelay_server::{app, AppState};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    connector: Arc<ChannelConnector>,
    engines: mpsc::UnboundedReceiver<ChannelEngineHandle>,
    sessions: SessionRegistry,
}

async fn start_server(config: Config) -> TestServer {
    let (connector, engines) = ChannelConnector::new();
    let connector = Arc::new(connector);
    let state = AppState::new(&config, connector.clone());
    let sessions = state.sessions.clone();
    let app = app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        connector,
        engines,
        sessions,
    }
}

impl TestServer {
    async fn connect(&self) -> Client {
        let url = format!("ws://{}/ws", self.addr);
        let (ws, _) = connect_async(url).await.expect("failed to connect");
        ws
    }

    /// Engine handle for the next session, with its greeting consumed.
    async fn next_engine(&mut self) -> ChannelEngineHandle {
        let mut engine = timeout(WAIT, self.engines.recv())
            .await
            .expect("no engine session opened")
            .unwrap();
        assert_eq!(
            next_request(&mut engine).await,
            EngineRequest::Text {
                text: "Hello".to_string(),
                end_of_turn: true
            }
        );
        engine
    }

    async fn sessions_json(&self) -> Value {
        let url = format!("http://{}/api/sessions", self.addr);
        let body = http_get(&url).await;
        serde_json::from_str(&body).unwrap()
    }

    async fn wait_for_no_sessions(&self) {
        timeout(WAIT, async {
            while !self.sessions.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was never removed from the registry");
    }
}

/// Minimal HTTP/1.1 GET over a raw socket.
async fn http_get(url: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let without_scheme = url.trim_start_matches("http://");
    let (host, path) = without_scheme.split_once('/').unwrap();
    let mut stream = TcpStream::connect(host).await.unwrap();
    let request = format!("GET /{path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (_, body) = response.split_once("\r\n\r\n").unwrap();
    body.to_string()
}

async fn next_request(engine: &mut ChannelEngineHandle) -> EngineRequest {
    timeout(WAIT, engine.next_request())
        .await
        .expect("timed out waiting for an engine request")
        .expect("engine sink dropped")
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON message, or `None` once the server closed the socket.
async fn recv_json(ws: &mut Client) -> Option<Value> {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for the server");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn recv_type(ws: &mut Client, kind: &str) -> Value {
    loop {
        let msg = recv_json(ws).await.expect("socket closed early");
        if msg["type"] == kind {
            return msg;
        }
    }
}

async fn collect_until_close(ws: &mut Client) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Some(msg) = recv_json(ws).await {
        messages.push(msg);
    }
    messages
}

#[tokio::test]
async fn full_conversation_round_trip() {
    let mut server = start_server(Config::default()).await;
    let mut ws = server.connect().await;
    let mut engine = server.next_engine().await;

    // Engine greets the user.
    engine.emit(EngineEvent::Text("Hi! How can I help?".to_string()));
    engine.emit(EngineEvent::Audio(Bytes::from_static(&[1, 0, 2, 0])));
    engine.emit(EngineEvent::TurnComplete);

    assert_eq!(
        recv_json(&mut ws).await.unwrap(),
        json!({ "type": "text", "text": "Hi! How can I help?" })
    );
    assert_eq!(
        recv_json(&mut ws).await.unwrap(),
        json!({ "type": "audio", "data": STANDARD.encode([1, 0, 2, 0]) })
    );
    assert_eq!(recv_json(&mut ws).await.unwrap(), json!({ "type": "turn_complete" }));

    // The human speaks, then hands the floor back.
    let pcm = vec![0x10u8; 640];
    send_json(
        &mut ws,
        json!({ "type": "audio_continuous", "data": STANDARD.encode(&pcm) }),
    )
    .await;
    ws.send(Message::Binary(Bytes::from_static(&[0x20; 320]))).await.unwrap();
    send_json(&mut ws, json!({ "type": "stop_listening" })).await;

    assert_eq!(next_request(&mut engine).await, EngineRequest::Audio(Bytes::from(pcm)));
    assert_eq!(
        next_request(&mut engine).await,
        EngineRequest::Audio(Bytes::from_static(&[0x20; 320]))
    );
    assert_eq!(next_request(&mut engine).await, EngineRequest::EndTurn);

    let listing = server.sessions_json().await;
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["sessions"][0]["turn"], "AGENT");
    assert_eq!(listing["sessions"][0]["phase"], "ACTIVE");
    assert!(listing["sessions"][0]["remote_addr"]
        .as_str()
        .unwrap()
        .starts_with("127.0.0.1:"));

    send_json(&mut ws, json!({ "type": "stop" })).await;
    assert!(collect_until_close(&mut ws).await.is_empty());
    assert_eq!(next_request(&mut engine).await, EngineRequest::Close);
    server.wait_for_no_sessions().await;
}

#[tokio::test]
async fn text_turn_scenario() {
    let mut server = start_server(Config::default()).await;
    let mut ws = server.connect().await;
    let mut engine = server.next_engine().await;

    engine.emit(EngineEvent::TurnComplete);
    recv_type(&mut ws, "turn_complete").await;

    send_json(&mut ws, json!({ "type": "text", "text": "hello" })).await;
    assert_eq!(
        next_request(&mut engine).await,
        EngineRequest::Text {
            text: "hello".to_string(),
            end_of_turn: true
        }
    );

    engine.emit(EngineEvent::Text("Hello back".to_string()));
    engine.emit(EngineEvent::TurnComplete);
    let reply = recv_json(&mut ws).await.unwrap();
    assert!(reply["type"] == "text" || reply["type"] == "audio");
    assert_eq!(recv_json(&mut ws).await.unwrap()["type"], "turn_complete");
}

#[tokio::test]
async fn client_heartbeat_is_acknowledged() {
    let mut server = start_server(Config::default()).await;
    let mut ws = server.connect().await;
    let _engine = server.next_engine().await;

    send_json(&mut ws, json!({ "type": "heartbeat" })).await;
    assert_eq!(recv_json(&mut ws).await.unwrap(), json!({ "type": "heartbeat_ack" }));
}

#[tokio::test]
async fn malformed_and_oversized_messages_keep_the_session() {
    let mut config = Config::default();
    config.server.max_message_bytes = 1024;
    let mut server = start_server(config).await;
    let mut ws = server.connect().await;
    let _engine = server.next_engine().await;

    ws.send(Message::Text("definitely not json".to_string().into())).await.unwrap();
    assert_eq!(recv_json(&mut ws).await.unwrap()["type"], "error");

    send_json(
        &mut ws,
        json!({ "type": "audio_chunk", "data": STANDARD.encode(vec![0u8; 2048]) }),
    )
    .await;
    let notice = recv_json(&mut ws).await.unwrap();
    assert_eq!(notice["type"], "error");
    assert!(notice["message"].as_str().unwrap().contains("exceeds"));

    send_json(&mut ws, json!({ "type": "heartbeat" })).await;
    assert_eq!(recv_json(&mut ws).await.unwrap()["type"], "heartbeat_ack");
}

#[tokio::test]
async fn engine_setup_failure_notifies_and_closes() {
    let server = start_server(Config::default()).await;
    server
        .connector
        .set_connect_error(Some("invalid api key".to_string()));

    let mut ws = server.connect().await;
    let messages = collect_until_close(&mut ws).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "error");
    assert!(!messages[0]["message"].as_str().unwrap().contains("api key"));
    server.wait_for_no_sessions().await;
}

#[tokio::test]
async fn engine_drop_mid_turn_sends_exactly_one_error() {
    let mut server = start_server(Config::default()).await;
    let mut ws = server.connect().await;
    let engine = server.next_engine().await;

    engine.emit(EngineEvent::Audio(Bytes::from_static(&[4; 200])));
    drop(engine);

    let messages = collect_until_close(&mut ws).await;
    let errors: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m["type"] == "error")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(errors.len(), 1, "messages: {messages:?}");
    assert!(messages[errors[0] + 1..].iter().all(|m| m["type"] != "audio"));
    server.wait_for_no_sessions().await;
}

#[tokio::test]
async fn client_disconnect_closes_the_engine() {
    let mut server = start_server(Config::default()).await;
    let ws = server.connect().await;
    let mut engine = server.next_engine().await;

    drop(ws);
    assert_eq!(next_request(&mut engine).await, EngineRequest::Close);
    server.wait_for_no_sessions().await;
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let mut server = start_server(Config::default()).await;
    let mut first = server.connect().await;
    let mut first_engine = server.next_engine().await;
    let mut second = server.connect().await;
    let mut second_engine = server.next_engine().await;
    assert_eq!(server.sessions.len().await, 2);

    assert_eq!(server.sessions.shutdown_all().await, 2);

    assert!(collect_until_close(&mut first).await.is_empty());
    assert!(collect_until_close(&mut second).await.is_empty());
    assert_eq!(next_request(&mut first_engine).await, EngineRequest::Close);
    assert_eq!(next_request(&mut second_engine).await, EngineRequest::Close);
    server.wait_for_no_sessions().await;
}

#[tokio::test]
async fn sessions_are_isolated() {
    let mut server = start_server(Config::default()).await;
    let mut a = server.connect().await;
    let mut engine_a = server.next_engine().await;
    let mut b = server.connect().await;
    let engine_b = server.next_engine().await;

    engine_a.emit(EngineEvent::TurnComplete);
    recv_type(&mut a, "turn_complete").await;

    // Only session A holds a human turn; B's audio is dropped.
    send_json(&mut b, json!({ "type": "audio_chunk", "data": STANDARD.encode([1u8; 320]) })).await;
    send_json(&mut a, json!({ "type": "audio_chunk", "data": STANDARD.encode([2u8; 320]) })).await;
    assert_eq!(
        next_request(&mut engine_a).await,
        EngineRequest::Audio(Bytes::from(vec![2u8; 320]))
    );

    engine_b.emit(EngineEvent::Text("only for b".to_string()));
    assert_eq!(recv_type(&mut b, "text").await["text"], "only for b");
}
