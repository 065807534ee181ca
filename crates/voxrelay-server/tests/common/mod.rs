//! Shared harness: a relay session wired to a channel engine and an
//! in-memory client.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use voxrelay_engine::{
    ChannelConnector, ChannelEngineHandle, EngineConfig, EngineConnector, EngineEvent,
    EngineRequest,
};
use voxrelay_server::codec::ServerMessage;
use voxrelay_server::registry::SessionHandle;
use voxrelay_server::session::{
    ClientFrame, ClientSender, CloseReason, Outbound, RelaySettings, SessionRelay,
    OUTBOUND_CAPACITY,
};
use voxrelay_server::turn::TurnTaking;
use voxrelay_types::TurnOwner;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct RelayHarness {
    pub client: mpsc::UnboundedSender<ClientFrame>,
    pub outbound: mpsc::Receiver<Outbound>,
    pub engine: ChannelEngineHandle,
    pub turn: watch::Receiver<TurnOwner>,
    pub handle: Arc<SessionHandle>,
    pub task: JoinHandle<CloseReason>,
}

/// 16-bit PCM loud enough to count as speech.
pub fn speech(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| {
            let s: i16 = if i % 2 == 0 { 12_000 } else { -12_000 };
            s.to_le_bytes()
        })
        .collect()
}

pub fn silence(bytes: usize) -> Vec<u8> {
    vec![0; bytes]
}

impl RelayHarness {
    pub async fn start(settings: RelaySettings) -> Self {
        let (connector, mut handles) = ChannelConnector::new();
        let session = connector.connect(&EngineConfig::default()).await.unwrap();
        let engine = handles.recv().await.unwrap();

        let turn = Arc::new(TurnTaking::new());
        let turn_rx = turn.subscribe();
        let handle = Arc::new(SessionHandle::new(None, turn.subscribe()));

        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let incoming = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();
        let (sender, outbound) = ClientSender::channel(OUTBOUND_CAPACITY);

        let relay = SessionRelay::new(Arc::clone(&handle), turn, settings);
        let task = tokio::spawn(relay.run(session, incoming, sender));

        Self {
            client: client_tx,
            outbound,
            engine,
            turn: turn_rx,
            handle,
            task,
        }
    }

    /// Starts a session and consumes the greeting.
    pub async fn start_greeted(settings: RelaySettings) -> Self {
        let mut harness = Self::start(settings).await;
        assert_eq!(
            harness.request().await,
            EngineRequest::Text {
                text: "Hello".to_string(),
                end_of_turn: true
            }
        );
        harness
    }

    /// Starts a session and hands the floor to the human.
    pub async fn start_human(settings: RelaySettings) -> Self {
        let mut harness = Self::start_greeted(settings).await;
        harness.emit(EngineEvent::TurnComplete);
        assert_eq!(harness.recv().await, ServerMessage::TurnComplete);
        harness.wait_turn(TurnOwner::Human).await;
        harness
    }

    pub fn send_json(&self, value: Value) {
        self.client
            .send(ClientFrame::Text(value.to_string()))
            .unwrap();
    }

    pub fn send_audio(&self, pcm: &[u8]) {
        self.send_json(json!({ "type": "audio_chunk", "data": STANDARD.encode(pcm) }));
    }

    pub fn send_control(&self, kind: &str) {
        self.send_json(json!({ "type": kind }));
    }

    pub fn emit(&self, event: EngineEvent) {
        assert!(self.engine.emit(event), "relay stopped reading engine events");
    }

    /// Next message for the client, confirming delivery like a writer would.
    pub async fn recv(&mut self) -> ServerMessage {
        let outbound = timeout(WAIT, self.outbound.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("client queue closed");
        if let Some(ack) = outbound.delivered {
            let _ = ack.send(());
        }
        outbound.message
    }

    /// Every remaining client message until the relay drops its sender.
    pub async fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Some(outbound) = timeout(WAIT, self.outbound.recv())
            .await
            .expect("client queue never closed")
        {
            if let Some(ack) = outbound.delivered {
                let _ = ack.send(());
            }
            messages.push(outbound.message);
        }
        messages
    }

    pub async fn request(&mut self) -> EngineRequest {
        timeout(WAIT, self.engine.next_request())
            .await
            .expect("timed out waiting for an engine request")
            .expect("engine sink dropped")
    }

    /// Every remaining engine request until the relay drops its sink.
    pub async fn remaining_requests(&mut self) -> Vec<EngineRequest> {
        let mut requests = Vec::new();
        while let Some(request) = timeout(WAIT, self.engine.next_request())
            .await
            .expect("engine sink never dropped")
        {
            requests.push(request);
        }
        requests
    }

    pub async fn wait_turn(&mut self, owner: TurnOwner) {
        timeout(WAIT, self.turn.wait_for(|current| *current == owner))
            .await
            .expect("timed out waiting for turn owner")
            .expect("turn machine dropped");
    }

    /// Round-trips a client heartbeat, proving every earlier client frame
    /// has been processed. Returns the client messages seen before the ack.
    pub async fn sync_client(&mut self) -> Vec<ServerMessage> {
        self.send_control("heartbeat");
        let mut before = Vec::new();
        loop {
            match self.recv().await {
                ServerMessage::HeartbeatAck => return before,
                other => before.push(other),
            }
        }
    }

    pub async fn outcome(self) -> CloseReason {
        timeout(WAIT, self.task)
            .await
            .expect("relay did not finish")
            .expect("relay task panicked")
    }
}
