//! WebSocket sessions and the registry that owns them

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use errors::{HeraldError, HeraldResult};

use crate::stomp::{Frame, StompCodec, StompVersion};

/// Session ID type
pub type SessionId = Uuid;

/// Write half of a client connection
#[async_trait]
pub trait FrameSink: Send {
    /// Write one encoded frame
    async fn send_frame(&mut self, frame: Bytes) -> HeraldResult<()>;
    async fn close(&mut self) -> HeraldResult<()>;
}

/// Write half of an upgraded axum WebSocket
pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Bytes) -> HeraldResult<()> {
        // STOMP is text framing; bodies that are not UTF-8 go out as binary
        let message = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(_) => Message::Binary(frame),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| HeraldError::DeliveryFailed(e.to_string()))
    }

    async fn close(&mut self) -> HeraldResult<()> {
        // The peer may already be gone
        let _ = self.inner.send(Message::Close(None)).await;
        self.inner
            .close()
            .await
            .map_err(|e| HeraldError::DeliveryFailed(e.to_string()))
    }
}

/// In-process sink feeding an mpsc channel, for embedding and tests
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ChannelSink {
    /// Returns the sink and the receiving end that observes written frames.
    /// The receiver yields `None` once the sink is closed.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: Bytes) -> HeraldResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| HeraldError::DeliveryFailed("sink closed".to_string()))?;
        tx.send(frame)
            .map_err(|_| HeraldError::DeliveryFailed("receiver dropped".to_string()))
    }

    async fn close(&mut self) -> HeraldResult<()> {
        self.tx = None;
        Ok(())
    }
}

#[derive(Debug)]
struct SessionState {
    username: String,
    authenticated: bool,
    version: StompVersion,
    /// sub_id -> registered destination
    subscriptions: HashMap<String, String>,
}

/// One client connection
///
/// Outbound frames are serialised by the writer mutex so a frame is never
/// interleaved with another on the wire.
pub struct Session {
    id: SessionId,
    connect_time: i64,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Box<dyn FrameSink>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connect_time", &self.connect_time)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(sink: Box<dyn FrameSink>, connect_time: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            connect_time,
            state: Mutex::new(SessionState {
                username: String::new(),
                authenticated: false,
                version: StompVersion::V1_2,
                subscriptions: HashMap::new(),
            }),
            writer: tokio::sync::Mutex::new(sink),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn connect_time(&self) -> i64 {
        self.connect_time
    }

    pub fn username(&self) -> String {
        self.state.lock().username.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    pub fn version(&self) -> StompVersion {
        self.state.lock().version
    }

    /// Cancelled when the session is torn down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn authenticate(&self, username: &str, version: StompVersion) {
        let mut state = self.state.lock();
        state.username = username.to_string();
        state.authenticated = true;
        state.version = version;
    }

    /// Record a subscription; false if the id is already taken
    pub(crate) fn add_subscription(&self, sub_id: &str, destination: &str) -> bool {
        let mut state = self.state.lock();
        if state.subscriptions.contains_key(sub_id) {
            return false;
        }
        state
            .subscriptions
            .insert(sub_id.to_string(), destination.to_string());
        true
    }

    pub(crate) fn remove_subscription(&self, sub_id: &str) -> Option<String> {
        self.state.lock().subscriptions.remove(sub_id)
    }

    pub(crate) fn take_subscriptions(&self) -> HashMap<String, String> {
        std::mem::take(&mut self.state.lock().subscriptions)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Encode `frame` for this session's version and write it within `timeout`
    pub async fn send(&self, frame: &Frame, timeout: Duration) -> HeraldResult<()> {
        let bytes = StompCodec::new(self.version(), usize::MAX).encode_to_bytes(frame);
        let written = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.send_frame(bytes).await
        })
        .await;
        written.map_err(|_| {
            HeraldError::DeliveryFailed(format!("write timed out after {:?}", timeout))
        })?
    }

    /// Stop the read loop and close the write half within `timeout`
    ///
    /// A peer that stopped reading can hold the writer indefinitely; past the
    /// deadline the sink is abandoned and dropped with the session.
    pub async fn close(&self, timeout: Duration) {
        self.shutdown.cancel();
        let closed = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {},
            Ok(Err(e)) => tracing::debug!(session_id = %self.id, "Close failed: {}", e),
            Err(_) => {
                tracing::debug!(session_id = %self.id, "Close timed out after {:?}", timeout)
            },
        }
    }
}

/// Snapshot entry for the online-users endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub username: String,
    pub session_id: String,
    /// Milliseconds since epoch
    pub connect_time: i64,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    user_sessions: HashMap<String, HashSet<SessionId>>,
}

/// Live sessions indexed by id and by username
///
/// One lock covers both indices; readers copy `Arc`s out before doing I/O.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        self.inner.lock().sessions.insert(session.id(), session);
    }

    /// Remove from both indices; returns the session if it was present
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.remove(&id)?;
        let username = session.username();
        if let Some(ids) = inner.user_sessions.get_mut(&username) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.user_sessions.remove(&username);
            }
        }
        Some(session)
    }

    /// Index an authenticated session under `username`
    pub fn bind(&self, id: SessionId, username: &str) -> HeraldResult<()> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&id) {
            return Err(HeraldError::SessionNotFound(id.to_string()));
        }
        inner
            .user_sessions
            .entry(username.to_string())
            .or_default()
            .insert(id);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(&id).cloned()
    }

    /// Resolve many ids under one lock, skipping those already gone
    pub fn get_many(&self, ids: impl IntoIterator<Item = SessionId>) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        ids.into_iter()
            .filter_map(|id| inner.sessions.get(&id).cloned())
            .collect()
    }

    pub fn sessions_for(&self, username: &str) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .user_sessions
            .get(username)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Authenticated sessions, oldest first
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let inner = self.inner.lock();
        let mut users: Vec<OnlineUser> = inner
            .user_sessions
            .iter()
            .flat_map(|(username, ids)| {
                ids.iter().filter_map(|id| {
                    inner.sessions.get(id).map(|s| OnlineUser {
                        username: username.clone(),
                        session_id: id.to_string(),
                        connect_time: s.connect_time(),
                    })
                })
            })
            .collect();
        users.sort_by(|a, b| {
            a.connect_time
                .cmp(&b.connect_time)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        users
    }

    /// Distinct users with at least one authenticated session
    pub fn online_count(&self) -> usize {
        self.inner.lock().user_sessions.len()
    }

    /// All sessions, authenticated or not
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }
}
