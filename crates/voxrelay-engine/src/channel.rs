//! In-process engine backed by channels.
//!
//! Every successful `connect` hands a [`ChannelEngineHandle`] to whoever
//! holds the connector's handle receiver. The handle sees every request the
//! relay sends upstream and scripts the events the relay receives back.
//! Dropping the handle's event sender ends the event stream, which the relay
//! observes as the engine hanging up.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::session::{EngineConnector, EngineSession, EngineSink};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use voxrelay_types::AudioFrame;

/// What the relay sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    Audio(Bytes),
    Text { text: String, end_of_turn: bool },
    EndTurn,
    Close,
}

/// Test-side end of one channel engine session.
#[derive(Debug)]
pub struct ChannelEngineHandle {
    /// Requests from the relay, in send order.
    pub requests: mpsc::UnboundedReceiver<EngineRequest>,
    /// Events delivered to the relay.
    pub events: mpsc::UnboundedSender<Result<EngineEvent, EngineError>>,
}

impl ChannelEngineHandle {
    /// Delivers an event to the relay. Returns false once the relay is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.events.send(Ok(event)).is_ok()
    }

    /// Delivers a transport failure to the relay.
    pub fn fail(&self, error: EngineError) -> bool {
        self.events.send(Err(error)).is_ok()
    }

    /// Waits for the next request, `None` once the relay dropped its sink.
    pub async fn next_request(&mut self) -> Option<EngineRequest> {
        self.requests.recv().await
    }
}

#[derive(Debug)]
pub struct ChannelConnector {
    handles: mpsc::UnboundedSender<ChannelEngineHandle>,
    connect_error: Mutex<Option<String>>,
}

impl ChannelConnector {
    /// Creates a connector and the receiver that yields one handle per
    /// session it opens.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelEngineHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                handles: tx,
                connect_error: Mutex::new(None),
            },
            rx,
        )
    }

    /// Makes every following `connect` fail with `message`; `None` restores
    /// normal behaviour.
    pub fn set_connect_error(&self, message: Option<String>) {
        if let Ok(mut slot) = self.connect_error.lock() {
            *slot = message;
        }
    }
}

#[async_trait]
impl EngineConnector for ChannelConnector {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn connect(&self, _config: &EngineConfig) -> Result<EngineSession, EngineError> {
        let injected = self
            .connect_error
            .lock()
            .map_err(|_| EngineError::Connect("connector state poisoned".to_string()))?
            .clone();
        if let Some(message) = injected {
            return Err(EngineError::Connect(message));
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        self.handles
            .send(ChannelEngineHandle {
                requests: request_rx,
                events: event_tx,
            })
            .map_err(|_| EngineError::Connect("no engine handle receiver".to_string()))?;

        let events = futures_util::stream::unfold(event_rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();

        Ok(EngineSession::new(
            Box::new(ChannelSink {
                requests: request_tx,
                closed: false,
            }),
            events,
        ))
    }
}

struct ChannelSink {
    requests: mpsc::UnboundedSender<EngineRequest>,
    closed: bool,
}

impl ChannelSink {
    fn push(&self, request: EngineRequest) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.requests.send(request).map_err(|_| EngineError::Closed)
    }
}

#[async_trait]
impl EngineSink for ChannelSink {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), EngineError> {
        self.push(EngineRequest::Audio(frame.data().clone()))
    }

    async fn send_text(&mut self, text: &str, end_of_turn: bool) -> Result<(), EngineError> {
        self.push(EngineRequest::Text {
            text: text.to_string(),
            end_of_turn,
        })
    }

    async fn end_turn(&mut self) -> Result<(), EngineError> {
        self.push(EngineRequest::EndTurn)
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if !self.closed {
            // The handle may already be gone; closing is still complete.
            let _ = self.requests.send(EngineRequest::Close);
            self.closed = true;
        }
        Ok(())
    }
}
