//! WebSocket handler and per-connection lifecycle.

use crate::codec::encode_server_message;
use crate::error::RelayError;
use crate::registry::SessionHandle;
use crate::session::{ClientFrame, ClientSender, Outbound, SessionRelay, OUTBOUND_CAPACITY};
use crate::turn::TurnTaking;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::{BoxStream, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;
use voxrelay_types::ConnectionPhase;

/// `GET /ws`: upgrades to a relay session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::debug!(remote_addr = %addr, "websocket upgrade requested");
    // Frames above the codec limit but below this one are rejected per
    // message; only grossly oversized frames break the connection.
    let socket_limit = state.relay.codec.max_frame_bytes().saturating_mul(2);
    ws.max_message_size(socket_limit)
        .max_frame_size(socket_limit)
        .on_upgrade(move |socket| serve_connection(socket, state, Some(addr)))
}

/// Runs one client connection: registers the session, opens the engine
/// connection, relays, and releases everything on every exit path.
pub async fn serve_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    remote_addr: Option<SocketAddr>,
) {
    let (ws_sink, ws_stream) = socket.split();
    let (client, outbound) = ClientSender::channel(OUTBOUND_CAPACITY);
    let mut writer = tokio::spawn(write_loop(ws_sink, outbound, state.send_timeout));

    let turn = Arc::new(TurnTaking::new());
    let handle = Arc::new(SessionHandle::new(remote_addr, turn.subscribe()));
    let session_id = handle.id();
    state.sessions.insert(Arc::clone(&handle)).await;

    let live_sessions = state.sessions.len().await;
    tracing::info!(
        session_id = %session_id,
        remote_addr = ?remote_addr,
        engine = state.connector.name(),
        live_sessions = live_sessions,
        "client connected"
    );

    let connect = tokio::select! {
        biased;
        () = handle.cancel_token().cancelled() => None,
        result = timeout(state.relay.request_timeout, state.connector.connect(&state.engine)) => Some(result),
    };

    match connect {
        Some(Ok(Ok(engine))) => {
            let relay = SessionRelay::new(Arc::clone(&handle), turn, state.relay.clone());
            let reason = relay.run(engine, client_frames(ws_stream), client).await;
            tracing::info!(session_id = %session_id, reason = reason.label(), "relay finished");
        }
        Some(Ok(Err(e))) => {
            reject_session(
                session_id,
                &handle,
                client,
                RelayError::UpstreamConnect(e.to_string()),
            )
            .await;
        }
        Some(Err(_)) => {
            let limit = state.relay.request_timeout;
            reject_session(
                session_id,
                &handle,
                client,
                RelayError::UpstreamConnect(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                )),
            )
            .await;
        }
        None => {
            tracing::info!(session_id = %session_id, "session cancelled before the engine connected");
            handle.advance(ConnectionPhase::Draining);
            drop(client);
        }
    }

    // Every client sender is gone now, so the writer drains and closes.
    match timeout(state.send_timeout, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(session_id = %session_id, "client writer task failed: {}", e),
        Err(_) => {
            tracing::warn!(session_id = %session_id, "client writer did not finish, aborting");
            writer.abort();
        }
    }

    if handle.close() {
        tracing::info!(session_id = %session_id, "session closed");
    }
    state.sessions.remove(session_id).await;
}

async fn reject_session(
    session_id: Uuid,
    handle: &SessionHandle,
    client: ClientSender,
    error: RelayError,
) {
    tracing::warn!(session_id = %session_id, error = %error, "engine setup failed");
    handle.advance(ConnectionPhase::Draining);
    if let Some(notice) = error.client_notice() {
        if client.send(crate::codec::ServerMessage::Error(notice)).await.is_err() {
            tracing::debug!(session_id = %session_id, "client gone before error notice");
        }
    }
}

/// Adapts the socket's read half to relay frames. Control frames are
/// answered by the socket itself and skipped here; a read error ends the
/// stream like a close frame.
fn client_frames(stream: SplitStream<WebSocket>) -> BoxStream<'static, ClientFrame> {
    stream
        .filter_map(|message| async move {
            match message {
                Ok(AxumMessage::Text(text)) => Some(ClientFrame::Text(text.as_str().to_owned())),
                Ok(AxumMessage::Binary(data)) => Some(ClientFrame::Binary(data)),
                Ok(AxumMessage::Close(_)) => Some(ClientFrame::Close),
                Ok(AxumMessage::Ping(_)) | Ok(AxumMessage::Pong(_)) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "client socket read failed");
                    Some(ClientFrame::Close)
                }
            }
        })
        .boxed()
}

/// Owns the socket's write half. Encodes queued messages in order, bounds
/// every write, and confirms delivery to callers that asked for it.
async fn write_loop(
    mut sink: SplitSink<WebSocket, AxumMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    send_timeout: Duration,
) {
    while let Some(Outbound { message, delivered }) = outbound.recv().await {
        let text = match encode_server_message(&message) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(kind = message.kind(), "failed to encode client message: {}", e);
                continue;
            }
        };

        match timeout(send_timeout, sink.send(AxumMessage::Text(text.into()))).await {
            Ok(Ok(())) => {
                if let Some(ack) = delivered {
                    let _ = ack.send(());
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(kind = message.kind(), error = %e, "client socket write failed");
                break;
            }
            Err(_) => {
                tracing::warn!(kind = message.kind(), "client socket write timed out");
                break;
            }
        }
    }

    // Fail any sender still waiting on the queue.
    outbound.close();
    let closing = async {
        let _ = sink.send(AxumMessage::Close(None)).await;
        let _ = sink.close().await;
    };
    if timeout(send_timeout, closing).await.is_err() {
        tracing::debug!("client socket close timed out");
    }
}
