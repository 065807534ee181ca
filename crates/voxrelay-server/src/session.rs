//! Duplex relay between one client and one engine session.
//!
//! A live session runs three tasks:
//!
//! - the client pump decodes client frames, gates audio on the turn owner,
//!   runs the VAD and forwards to the engine sink;
//! - the engine pump reads engine events, shapes audio through the combiner
//!   and queues messages for the client;
//! - the heartbeat loop probes the client socket.
//!
//! Messages for the client go through a [`ClientSender`] to a single writer
//! that owns the socket. The first task to finish cancels the others; the
//! relay then tears the turn machine down and, for fatal errors the client
//! should know about, queues exactly one `error` message.

use crate::codec::{ClientMessage, FrameCodec, ServerMessage};
use crate::error::RelayError;
use crate::heartbeat::{heartbeat_loop, HeartbeatSettings};
use crate::registry::SessionHandle;
use crate::turn::TurnTaking;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use voxrelay_audio::{
    sleep_until_deadline, AudioCombiner, CombinerConfig, VadConfig, VadEvent,
    VoiceActivityDetector,
};
use voxrelay_engine::{EngineConfig, EngineError, EngineEvent, EngineSink, EventStream};
use voxrelay_types::{AudioFormat, AudioFrame, ConnectionPhase, ControlKind, TurnOwner};

/// Queue depth between the relay and the client writer.
pub const OUTBOUND_CAPACITY: usize = 256;

/// A frame read from the client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
    Close,
}

/// A message queued for the client writer. When `delivered` is set the
/// writer signals it once the socket accepted the message.
#[derive(Debug)]
pub struct Outbound {
    pub message: ServerMessage,
    pub delivered: Option<oneshot::Sender<()>>,
}

/// Queues messages for the task that owns the client socket.
#[derive(Debug, Clone)]
pub struct ClientSender {
    tx: mpsc::Sender<Outbound>,
}

impl ClientSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, message: ServerMessage) -> Result<(), RelayError> {
        self.tx
            .send(Outbound {
                message,
                delivered: None,
            })
            .await
            .map_err(|_| RelayError::TransportClosed)
    }

    /// Resolves once the writer has handed the message to the socket.
    pub async fn send_confirmed(&self, message: ServerMessage) -> Result<(), RelayError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound {
                message,
                delivered: Some(ack_tx),
            })
            .await
            .map_err(|_| RelayError::TransportClosed)?;
        ack_rx.await.map_err(|_| RelayError::TransportClosed)
    }
}

/// Per-session knobs, resolved once from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub codec: FrameCodec,
    pub combiner: CombinerConfig,
    pub vad: VadConfig,
    pub heartbeat: HeartbeatSettings,
    pub input_format: AudioFormat,
    pub output_format: AudioFormat,
    /// Bound on every upstream send.
    pub request_timeout: Duration,
    /// Bound on waiting for the engine while it holds the floor.
    pub response_timeout: Duration,
    pub greeting: Option<String>,
}

impl RelaySettings {
    pub fn new(
        engine: &EngineConfig,
        codec: FrameCodec,
        combiner: CombinerConfig,
        vad: VadConfig,
        heartbeat: HeartbeatSettings,
    ) -> Self {
        Self {
            codec,
            combiner,
            vad,
            heartbeat,
            input_format: engine.input_format(),
            output_format: engine.output_format(),
            request_timeout: engine.request_timeout(),
            response_timeout: engine.response_timeout(),
            greeting: engine.greeting.clone(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::new(
            &EngineConfig::default(),
            FrameCodec::new(crate::config::DEFAULT_MAX_MESSAGE_BYTES),
            CombinerConfig::default(),
            VadConfig::default(),
            HeartbeatSettings::default(),
        )
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The client sent `stop`.
    ClientStop,
    /// The client socket closed.
    ClientClosed,
    /// The server cancelled the session.
    Shutdown,
    Failed(RelayError),
}

impl CloseReason {
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::ClientStop => "client_stop",
            CloseReason::ClientClosed => "client_closed",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Failed(_) => "failed",
        }
    }
}

/// Why a single relay task returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    ClientStop,
    ClientClosed,
    Cancelled,
}

#[derive(Clone)]
struct PumpContext {
    handle: Arc<SessionHandle>,
    turn: Arc<TurnTaking>,
    client: ClientSender,
    cancel: CancellationToken,
    settings: Arc<RelaySettings>,
}

impl PumpContext {
    fn session_id(&self) -> Uuid {
        self.handle.id()
    }

    /// Runs one upstream send under the request timeout.
    async fn upstream<F>(&self, send: F) -> Result<(), RelayError>
    where
        F: Future<Output = Result<(), EngineError>>,
    {
        upstream_call(self.settings.request_timeout, send).await
    }
}

async fn upstream_call<F>(limit: Duration, send: F) -> Result<(), RelayError>
where
    F: Future<Output = Result<(), EngineError>>,
{
    match timeout(limit, send).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::UpstreamStream(e.to_string())),
        Err(_) => Err(RelayError::UpstreamStream(format!(
            "engine send timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

async fn close_sink(sink: &mut dyn EngineSink, limit: Duration, session_id: Uuid) {
    match timeout(limit, sink.close()).await {
        Ok(Ok(())) => tracing::debug!(session_id = %session_id, "engine connection closed"),
        Ok(Err(e)) => {
            tracing::debug!(session_id = %session_id, error = %e, "engine close failed")
        }
        Err(_) => tracing::warn!(session_id = %session_id, "engine close timed out"),
    }
}

/// Drives one session from activation to teardown.
pub struct SessionRelay {
    handle: Arc<SessionHandle>,
    turn: Arc<TurnTaking>,
    settings: Arc<RelaySettings>,
}

impl SessionRelay {
    pub fn new(handle: Arc<SessionHandle>, turn: Arc<TurnTaking>, settings: RelaySettings) -> Self {
        Self {
            handle,
            turn,
            settings: Arc::new(settings),
        }
    }

    /// Activates the session and relays until either side ends it. The
    /// engine session is always closed before this returns.
    pub async fn run<S>(
        self,
        engine: voxrelay_engine::EngineSession,
        incoming: S,
        client: ClientSender,
    ) -> CloseReason
    where
        S: Stream<Item = ClientFrame> + Send + Unpin + 'static,
    {
        let session_id = self.handle.id();
        let voxrelay_engine::EngineSession { mut sink, events } = engine;

        self.handle.advance(ConnectionPhase::Active);
        self.turn.activate();
        tracing::info!(session_id = %session_id, "session active");

        let first = match self.greet(sink.as_mut()).await {
            Ok(()) => self.relay(sink, events, incoming, client.clone()).await,
            Err(e) => {
                close_sink(sink.as_mut(), self.settings.request_timeout, session_id).await;
                Err(e)
            }
        };

        self.finish(first, &client).await
    }

    async fn greet(&self, sink: &mut dyn EngineSink) -> Result<(), RelayError> {
        let Some(greeting) = self.settings.greeting.as_deref() else {
            return Ok(());
        };
        tracing::debug!(session_id = %self.handle.id(), "sending greeting");
        // On cancellation the relay starts with a cancelled token and exits at once.
        tokio::select! {
            biased;
            () = self.handle.cancel_token().cancelled() => Ok(()),
            sent = upstream_call(self.settings.request_timeout, sink.send_text(greeting, true)) => sent,
        }
    }

    async fn relay<S>(
        &self,
        sink: Box<dyn EngineSink>,
        events: EventStream,
        incoming: S,
        client: ClientSender,
    ) -> Result<PumpExit, RelayError>
    where
        S: Stream<Item = ClientFrame> + Send + Unpin + 'static,
    {
        let cancel = self.handle.cancel_token().child_token();
        let ctx = PumpContext {
            handle: Arc::clone(&self.handle),
            turn: Arc::clone(&self.turn),
            client,
            cancel: cancel.clone(),
            settings: Arc::clone(&self.settings),
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(client_pump(incoming, sink, ctx.clone()));
        tasks.spawn(engine_pump(events, ctx.clone()));
        tasks.spawn(heartbeat_loop(
            ctx.session_id(),
            ctx.client.clone(),
            self.settings.heartbeat,
            cancel.clone(),
        ));
        drop(ctx);

        let first = match tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(RelayError::Internal(format!("relay task failed: {e}"))),
            None => Ok(PumpExit::Cancelled),
        };

        cancel.cancel();
        self.handle.advance(ConnectionPhase::Draining);
        while let Some(rest) = tasks.join_next().await {
            match rest {
                Ok(Err(e)) => tracing::debug!(
                    session_id = %self.handle.id(),
                    error = %e,
                    "relay task ended with error during teardown"
                ),
                Err(e) => tracing::error!(
                    session_id = %self.handle.id(),
                    "relay task failed during teardown: {}",
                    e
                ),
                Ok(Ok(_)) => {}
            }
        }
        first
    }

    async fn finish(
        &self,
        first: Result<PumpExit, RelayError>,
        client: &ClientSender,
    ) -> CloseReason {
        let session_id = self.handle.id();
        self.turn.teardown();
        self.handle.advance(ConnectionPhase::Draining);

        let reason = match first {
            Ok(PumpExit::ClientStop) => CloseReason::ClientStop,
            Ok(PumpExit::ClientClosed) | Err(RelayError::TransportClosed) => {
                CloseReason::ClientClosed
            }
            Ok(PumpExit::Cancelled) => CloseReason::Shutdown,
            Err(e) => CloseReason::Failed(e),
        };

        match &reason {
            CloseReason::Failed(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "session failed");
                if let Some(notice) = e.client_notice() {
                    if client.send(ServerMessage::Error(notice)).await.is_err() {
                        tracing::debug!(session_id = %session_id, "client gone before error notice");
                    }
                }
            }
            other => {
                tracing::info!(session_id = %session_id, reason = other.label(), "session ending")
            }
        }
        reason
    }
}

async fn client_pump<S>(
    mut incoming: S,
    mut sink: Box<dyn EngineSink>,
    ctx: PumpContext,
) -> Result<PumpExit, RelayError>
where
    S: Stream<Item = ClientFrame> + Send + Unpin + 'static,
{
    let mut vad = VoiceActivityDetector::new(ctx.settings.vad.clone());
    let mut turn_rx = ctx.turn.subscribe();

    let result = loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break Ok(PumpExit::Cancelled),
            changed = turn_rx.changed() => {
                if changed.is_ok() && *turn_rx.borrow_and_update() == TurnOwner::Human {
                    vad.reset();
                }
            }
            frame = incoming.next() => {
                let decoded = match frame {
                    None | Some(ClientFrame::Close) => break Ok(PumpExit::ClientClosed),
                    Some(ClientFrame::Text(text)) => {
                        ctx.settings.codec.decode_client_message(text.as_bytes())
                    }
                    Some(ClientFrame::Binary(payload)) => ctx.settings.codec.decode_binary(payload),
                };
                ctx.handle.touch();

                // A stalled upstream send must not hold up teardown.
                let handled = async {
                    match decoded {
                        Ok(message) => handle_client_message(message, sink.as_mut(), &mut vad, &ctx).await,
                        Err(e) => reject_client_message(RelayError::from(e), &ctx).await,
                    }
                };
                let step = tokio::select! {
                    biased;
                    () = ctx.cancel.cancelled() => Ok(Some(PumpExit::Cancelled)),
                    step = handled => step,
                };
                match step {
                    Ok(None) => {}
                    Ok(Some(exit)) => break Ok(exit),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    close_sink(sink.as_mut(), ctx.settings.request_timeout, ctx.session_id()).await;
    result
}

async fn reject_client_message(
    error: RelayError,
    ctx: &PumpContext,
) -> Result<Option<PumpExit>, RelayError> {
    if error.is_fatal() {
        return Err(error);
    }
    tracing::warn!(session_id = %ctx.session_id(), error = %error, "dropping client message");
    if let Some(notice) = error.client_notice() {
        ctx.client.send(ServerMessage::Error(notice)).await?;
    }
    Ok(None)
}

async fn handle_client_message(
    message: ClientMessage,
    sink: &mut dyn EngineSink,
    vad: &mut VoiceActivityDetector,
    ctx: &PumpContext,
) -> Result<Option<PumpExit>, RelayError> {
    let session_id = ctx.session_id();
    match message {
        ClientMessage::AudioChunk(pcm) => {
            let frame = AudioFrame::inbound(pcm, ctx.settings.input_format);
            if !ctx.turn.admits_audio() {
                tracing::trace!(
                    session_id = %session_id,
                    bytes = frame.len(),
                    duration_ms = frame.duration().as_millis() as u64,
                    turn = %ctx.turn.current(),
                    "dropping client audio outside the human turn"
                );
                return Ok(None);
            }

            let outcome = vad.process(&frame);
            // Empty chunks carry no samples; they only advance the VAD.
            if !frame.is_empty() {
                ctx.upstream(sink.send_audio(&frame)).await?;
            }

            if let Some(VadEvent::EndOfUtterance {
                speech_frames,
                silence,
            }) = outcome.event
            {
                if ctx.turn.end_of_utterance().is_some() {
                    tracing::info!(
                        session_id = %session_id,
                        speech_frames,
                        silence_ms = silence.as_millis() as u64,
                        "human turn ended by silence"
                    );
                    ctx.upstream(sink.end_turn()).await?;
                }
            }
        }
        ClientMessage::Text(text) => {
            ctx.turn.client_text();
            tracing::info!(session_id = %session_id, chars = text.chars().count(), "client text turn");
            ctx.upstream(sink.send_text(&text, true)).await?;
        }
        ClientMessage::Control(ControlKind::StopListening) => {
            if ctx.turn.stop_listening().is_some() {
                tracing::debug!(session_id = %session_id, "client stopped listening");
                ctx.upstream(sink.end_turn()).await?;
            }
        }
        ClientMessage::Control(ControlKind::StartListening) => {
            if ctx.turn.current() == TurnOwner::Human {
                vad.reset();
                tracing::debug!(session_id = %session_id, "client started listening");
            } else {
                tracing::debug!(session_id = %session_id, "start_listening ignored outside the human turn");
            }
        }
        ClientMessage::Control(ControlKind::Heartbeat) => {
            ctx.client.send(ServerMessage::HeartbeatAck).await?;
        }
        ClientMessage::Control(ControlKind::HeartbeatAck) => {}
        ClientMessage::Control(ControlKind::Stop) => {
            tracing::info!(session_id = %session_id, "client requested stop");
            return Ok(Some(PumpExit::ClientStop));
        }
        ClientMessage::Control(ControlKind::TurnComplete) => {
            tracing::debug!(session_id = %session_id, "ignoring turn_complete from client");
        }
    }
    Ok(None)
}

async fn engine_pump(mut events: EventStream, ctx: PumpContext) -> Result<PumpExit, RelayError> {
    let mut combiner = AudioCombiner::new(ctx.settings.combiner.clone(), ctx.settings.output_format);
    let result = engine_loop(&mut events, &mut combiner, &ctx).await;
    if result.is_err() {
        // Nothing buffered may reach the client after a failure.
        let dropped = combiner.discard();
        if dropped > 0 {
            tracing::debug!(session_id = %ctx.session_id(), bytes = dropped, "discarded buffered engine audio");
        }
        ctx.turn.teardown();
    }
    result
}

async fn engine_loop(
    events: &mut EventStream,
    combiner: &mut AudioCombiner,
    ctx: &PumpContext,
) -> Result<PumpExit, RelayError> {
    let session_id = ctx.session_id();
    let response_timeout = ctx.settings.response_timeout;
    let mut turn_rx = ctx.turn.subscribe();
    let mut turn_open = true;

    loop {
        let deadline = combiner.deadline();
        let agent_speaking = ctx.turn.current() == TurnOwner::Agent;
        // Rebuilt on every pass, so a handover to the agent restarts the
        // wait under the response timeout.
        let next_event = async {
            if agent_speaking {
                timeout(response_timeout, events.next()).await.ok()
            } else {
                Some(events.next().await)
            }
        };

        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                if !combiner.is_empty() {
                    tracing::debug!(
                        session_id = %session_id,
                        bytes = combiner.queued_bytes(),
                        "dropping buffered engine audio on cancel"
                    );
                    combiner.discard();
                }
                return Ok(PumpExit::Cancelled);
            }
            changed = turn_rx.changed(), if turn_open => {
                if changed.is_err() {
                    turn_open = false;
                }
            }
            () = sleep_until_deadline(deadline) => {
                if let Some(frame) = combiner.flush() {
                    ctx.client.send(ServerMessage::Audio(frame.into_data())).await?;
                }
            }
            next = next_event => {
                let event = match next {
                    None => {
                        return Err(RelayError::UpstreamStream(format!(
                            "no engine response within {}ms",
                            response_timeout.as_millis()
                        )))
                    }
                    Some(None) => {
                        return Err(RelayError::UpstreamStream(
                            "engine closed the connection".to_string(),
                        ))
                    }
                    Some(Some(Err(e))) => return Err(RelayError::UpstreamStream(e.to_string())),
                    Some(Some(Ok(event))) => event,
                };
                ctx.handle.touch();

                match event {
                    EngineEvent::Audio(pcm) => {
                        if let Some(frame) = combiner.push(AudioFrame::outbound(pcm, ctx.settings.output_format)) {
                            ctx.client.send(ServerMessage::Audio(frame.into_data())).await?;
                        }
                    }
                    EngineEvent::Text(text) => {
                        ctx.client.send(ServerMessage::Text(text)).await?;
                    }
                    EngineEvent::TurnComplete => {
                        if let Some(frame) = combiner.flush() {
                            ctx.client.send(ServerMessage::Audio(frame.into_data())).await?;
                        }
                        ctx.client.send(ServerMessage::TurnComplete).await?;
                        if ctx.turn.engine_turn_complete().is_some() {
                            tracing::info!(session_id = %session_id, "engine turn complete, human holds the floor");
                        }
                    }
                    EngineEvent::Error(message) => {
                        return Err(RelayError::UpstreamStream(message));
                    }
                }
            }
        }
    }
}
