//! Gemini Live transport.
//!
//! Speaks the `BidiGenerateContent` WebSocket protocol:
//!
//! 1. connect to the endpoint with the API key as a query parameter,
//! 2. send `setup` (model, AUDIO response modality, prebuilt voice, system
//!    instruction) and wait for `setupComplete`,
//! 3. stream microphone PCM as `realtimeInput.mediaChunks` and text turns as
//!    `clientContent`,
//! 4. read `serverContent` messages and map their parts onto [`EngineEvent`].
//!
//! The server may deliver JSON in either text or binary frames.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event::EngineEvent;
use crate::session::{EngineConnector, EngineSession, EngineSink, EventStream};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use voxrelay_types::{AudioFormat, AudioFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connector for the Gemini Live API.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiConnector;

#[async_trait]
impl EngineConnector for GeminiConnector {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn connect(&self, config: &EngineConfig) -> Result<EngineSession, EngineError> {
        if config.api_key.trim().is_empty() {
            return Err(EngineError::Config(
                "engine.api_key is required for the gemini provider".to_string(),
            ));
        }

        let url = format!("{}?key={}", config.endpoint, config.api_key);
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| EngineError::Connect(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        sink.send(Message::Text(setup_message(config).to_string().into()))
            .await?;
        wait_for_setup_complete(&mut source).await?;

        tracing::info!(model = %config.model, voice = %config.voice, "gemini session ready");

        Ok(EngineSession::new(
            Box::new(GeminiSink {
                sink,
                input_format: config.input_format(),
                closed: false,
            }),
            event_stream(source),
        ))
    }
}

/// Builds the `setup` message that opens a session.
pub fn setup_message(config: &EngineConfig) -> Value {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    let mut setup = json!({
        "model": model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": config.voice }
                }
            }
        },
        "systemInstruction": {
            "parts": [{ "text": config.system_prompt }]
        }
    });
    if config.transcribe_output {
        setup["outputAudioTranscription"] = json!({});
    }
    json!({ "setup": setup })
}

/// Builds a `realtimeInput` message carrying one PCM chunk.
pub fn audio_message(data: &[u8], format: AudioFormat) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": format.mime_type(),
                "data": BASE64.encode(data),
            }]
        }
    })
}

/// Builds a `clientContent` message carrying a user text turn.
pub fn text_message(text: &str, end_of_turn: bool) -> Value {
    json!({
        "clientContent": {
            "turns": [{ "role": "user", "parts": [{ "text": text }] }],
            "turnComplete": end_of_turn,
        }
    })
}

/// Builds a `clientContent` message that only closes the user's turn.
pub fn end_turn_message() -> Value {
    json!({ "clientContent": { "turnComplete": true } })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

/// Maps one server JSON message onto relay events, in part order.
///
/// Messages without any relay-relevant content yield no events.
pub fn parse_server_message(raw: &str) -> Result<Vec<EngineEvent>, EngineError> {
    let message: ServerMessage = serde_json::from_str(raw)?;
    let mut events = Vec::new();

    if let Some(go_away) = message.go_away {
        events.push(EngineEvent::Error(format!(
            "engine is going away (time left: {})",
            go_away.time_left.as_deref().unwrap_or("unknown")
        )));
        return Ok(events);
    }

    let Some(content) = message.server_content else {
        return Ok(events);
    };

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                let pcm = BASE64
                    .decode(inline.data.as_bytes())
                    .map_err(|e| EngineError::Protocol(format!("invalid audio payload: {}", e)))?;
                if !pcm.is_empty() {
                    events.push(EngineEvent::Audio(Bytes::from(pcm)));
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(EngineEvent::Text(text));
            }
        }
    }
    if let Some(text) = content
        .output_transcription
        .and_then(|t| t.text)
        .filter(|t| !t.is_empty())
    {
        events.push(EngineEvent::Text(text));
    }
    if content.turn_complete {
        events.push(EngineEvent::TurnComplete);
    }

    Ok(events)
}

fn frame_payload(message: Message) -> Option<Result<String, EngineError>> {
    match message {
        Message::Text(text) => Some(Ok(text.as_str().to_owned())),
        Message::Binary(bin) => Some(
            String::from_utf8(bin.to_vec())
                .map_err(|e| EngineError::Protocol(format!("non-UTF-8 frame: {}", e))),
        ),
        _ => None,
    }
}

async fn wait_for_setup_complete(source: &mut WsSource) -> Result<(), EngineError> {
    while let Some(frame) = source.next().await {
        let message = frame?;
        if let Message::Close(reason) = &message {
            return Err(EngineError::Connect(format!(
                "engine closed during setup: {:?}",
                reason
            )));
        }
        let Some(payload) = frame_payload(message) else {
            continue;
        };
        let parsed: ServerMessage = serde_json::from_str(&payload?)?;
        if parsed.setup_complete.is_some() {
            return Ok(());
        }
    }
    Err(EngineError::Connect(
        "engine closed before setup completed".to_string(),
    ))
}

fn event_stream(source: WsSource) -> EventStream {
    futures_util::stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        loop {
            match source.next().await {
                None => return None,
                Some(Err(e)) => return Some((vec![Err(EngineError::from(e))], None)),
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "gemini closed the connection");
                    return None;
                }
                Some(Ok(message)) => {
                    let Some(payload) = frame_payload(message) else {
                        continue;
                    };
                    let batch = match payload.and_then(|raw| parse_server_message(&raw)) {
                        Ok(events) if events.is_empty() => continue,
                        Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                        Err(e) => vec![Err(e)],
                    };
                    return Some((batch, Some(source)));
                }
            }
        }
    })
    .flat_map(futures_util::stream::iter)
    .boxed()
}

struct GeminiSink {
    sink: WsSink,
    input_format: AudioFormat,
    closed: bool,
}

impl GeminiSink {
    async fn send_json(&mut self, value: Value) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        self.sink
            .send(Message::Text(value.to_string().into()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EngineSink for GeminiSink {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), EngineError> {
        let message = audio_message(frame.data(), self.input_format);
        self.send_json(message).await
    }

    async fn send_text(&mut self, text: &str, end_of_turn: bool) -> Result<(), EngineError> {
        self.send_json(text_message(text, end_of_turn)).await
    }

    async fn end_turn(&mut self) -> Result<(), EngineError> {
        self.send_json(end_turn_message()).await
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close().await?;
        Ok(())
    }
}
