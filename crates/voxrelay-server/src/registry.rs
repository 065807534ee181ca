//! Live session bookkeeping for diagnostics and shutdown.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use voxrelay_types::{ConnectionPhase, TurnOwner};

/// Shared view of one session. The relay drives it; the registry and the
/// diagnostics endpoint read it.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    remote_addr: Option<SocketAddr>,
    started_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    phase: AtomicU8,
    turn: watch::Receiver<TurnOwner>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(remote_addr: Option<SocketAddr>, turn: watch::Receiver<TurnOwner>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            started_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            phase: AtomicU8::new(ConnectionPhase::Connecting.as_u8()),
            turn,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::from_u8(self.phase.load(Ordering::Acquire))
            .unwrap_or(ConnectionPhase::Closed)
    }

    pub fn turn_owner(&self) -> TurnOwner {
        *self.turn.borrow()
    }

    /// Token cancelled when the session must stop.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Moves the phase forward to `to`. Phases never go backwards; returns
    /// false when the session is already at or past `to`.
    pub fn advance(&self, to: ConnectionPhase) -> bool {
        self.phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < to.as_u8()).then_some(to.as_u8())
            })
            .is_ok()
    }

    /// Marks the session closed and cancels its tasks. Exactly one caller
    /// gets `true`, however many race.
    pub fn close(&self) -> bool {
        let closed = self.advance(ConnectionPhase::Closed);
        if closed {
            self.cancel.cancel();
        }
        closed
    }

    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_activity_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.started_at)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            remote_addr: self.remote_addr.map(|addr| addr.to_string()),
            phase: self.phase().label(),
            turn: self.turn_owner(),
            started_at: self.started_at,
            last_activity: self.last_activity(),
        }
    }
}

/// Diagnostic row for `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub remote_addr: Option<String>,
    pub phase: &'static str,
    pub turn: TurnOwner,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// All live sessions, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: Arc<SessionHandle>) {
        self.sessions.write().await.insert(handle.id(), handle);
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshots ordered by start time.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut rows: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|handle| handle.snapshot())
            .collect();
        rows.sort_by_key(|row| row.started_at);
        rows
    }

    /// Cancels every live session. Each session removes itself once its
    /// teardown completes. Returns how many sessions were signalled.
    pub async fn shutdown_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            tracing::info!(session_id = %handle.id(), "cancelling session for shutdown");
            handle.cancel_token().cancel();
        }
        sessions.len()
    }
}
