//! In-process STOMP broker
//!
//! The broker owns the session registry, the subscription table and the
//! app handler registry. Read loops hand it decoded frames by session id;
//! HTTP handlers and the background worker call the server-originated
//! publish methods. Fan-out snapshots the recipients under the table locks,
//! releases them, then writes to every recipient concurrently. A recipient
//! whose write fails is torn down without affecting the others.

pub mod handlers;
pub mod session;
pub mod subscription;

use bytes::Bytes;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use common::TimeProvider;
use errors::{HeraldError, HeraldResult};

use crate::auth::TokenAuthenticator;
use crate::config::BrokerConfig;
use crate::stomp::frame::{
    CONTENT_TYPE_JSON, HEADER_ACCEPT_VERSION, HEADER_AUTHORIZATION, HEADER_CONTENT_TYPE,
    HEADER_DESTINATION, HEADER_ID, HEADER_LOGIN, HEADER_PASSCODE, HEADER_RECEIPT,
};
use crate::stomp::{Command, Frame, StompVersion};

pub use handlers::{AppHandler, AppMessage, HandlerRegistry};
pub use session::{ChannelSink, FrameSink, OnlineUser, Session, SessionId, SessionRegistry, WsSink};
pub use subscription::{Destination, Subscriber, SubscriptionTable};

pub const NOTICE_TOPIC: &str = "/topic/notice";
pub const DICT_TOPIC: &str = "/topic/dict";
pub const GREETING_QUEUE: &str = "/queue/greeting";
pub const MESSAGE_QUEUE: &str = "/queue/message";

const AUTH_FAILED: &str = "Authentication failed";
const UNSUPPORTED_VERSION: &str = "Supported protocol versions are 1.0,1.1,1.2";

/// What the read loop should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Broker {
    registry: SessionRegistry,
    subscriptions: SubscriptionTable,
    handlers: HandlerRegistry,
    auth: Arc<TokenAuthenticator>,
    clock: Arc<dyn TimeProvider>,
    write_timeout: Duration,
    next_message_id: AtomicU64,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("sessions", &self.registry.len())
            .field("subscriptions", &self.subscriptions.subscription_count())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl Broker {
    pub fn new(
        auth: Arc<TokenAuthenticator>,
        clock: Arc<dyn TimeProvider>,
        config: &BrokerConfig,
    ) -> Self {
        Self::with_handlers(auth, clock, config, HandlerRegistry::with_defaults())
    }

    pub fn with_handlers(
        auth: Arc<TokenAuthenticator>,
        clock: Arc<dyn TimeProvider>,
        config: &BrokerConfig,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            subscriptions: SubscriptionTable::new(),
            handlers,
            auth,
            clock,
            write_timeout: config.write_timeout(),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.registry.online_users()
    }

    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Register a fresh, unauthenticated session
    pub fn open_session(&self, sink: Box<dyn FrameSink>) -> Arc<Session> {
        let session = Arc::new(Session::new(sink, self.clock.now_millis()));
        self.registry.add(session.clone());
        info!(session_id = %session.id(), "WebSocket session opened");
        session
    }

    /// Remove the session everywhere and close its socket. Idempotent.
    pub async fn close_session(&self, session_id: SessionId) {
        if let Some(session) = self.detach(session_id) {
            session.close(self.write_timeout).await;
        }
    }

    /// Drop the session from the registry and the subscription table,
    /// leaving its socket to the caller
    fn detach(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let session = self.registry.remove(session_id)?;
        session.shutdown_token().cancel();
        session.take_subscriptions();
        let dropped = self.subscriptions.remove_session(session_id);
        info!(
            session_id = %session_id,
            username = %session.username(),
            subscriptions = dropped,
            "WebSocket session closed"
        );
        Some(session)
    }

    /// Close every session, used at shutdown
    pub async fn close_all(&self) -> usize {
        let sessions = self.registry.snapshot();
        let count = sessions.len();
        for session in sessions {
            self.close_session(session.id()).await;
        }
        count
    }

    /// Send `ERROR` and ask the read loop to close
    pub async fn reject(&self, session_id: SessionId, message: &str, detail: Option<&str>) -> Flow {
        if let Some(session) = self.registry.get(session_id) {
            warn!(session_id = %session_id, detail = detail.unwrap_or(""), "STOMP error: {}", message);
            if let Err(e) = session
                .send(&Frame::error(message, detail), self.write_timeout)
                .await
            {
                debug!(session_id = %session_id, "ERROR frame not delivered: {}", e);
            }
        }
        Flow::Close
    }

    /// `ERROR message:Protocol error` carrying the failure as detail
    pub async fn protocol_error(&self, session_id: SessionId, err: HeraldError) -> Flow {
        let detail = match &err {
            HeraldError::StompProtocol(detail) => detail.clone(),
            other => other.to_string(),
        };
        self.reject(session_id, "Protocol error", Some(&detail)).await
    }

    // ========================================================================
    // Client frames
    // ========================================================================

    /// Process one client frame for `session_id`
    pub async fn handle_frame(&self, session_id: SessionId, frame: Frame) -> Flow {
        let Some(session) = self.registry.get(session_id) else {
            return Flow::Close;
        };

        let command = frame.command;
        if command.is_server_command() {
            return self
                .protocol_error(
                    session_id,
                    errors::protocol_error!(format!("{} is a server frame", command)),
                )
                .await;
        }

        let authenticated = session.is_authenticated();
        let result = match command {
            Command::Connect | Command::Stomp if authenticated => {
                Err(errors::protocol_error!("Already connected"))
            },
            Command::Connect | Command::Stomp => return self.handle_connect(&session, &frame).await,
            _ if !authenticated => Err(errors::protocol_error!(format!(
                "{} before CONNECT",
                command
            ))),
            Command::Subscribe => self.handle_subscribe(&session, &frame),
            Command::Unsubscribe => self.handle_unsubscribe(&session, &frame),
            Command::Send => self.handle_send(&session, &frame).await,
            Command::Disconnect => {
                self.send_receipt(&session, &frame).await;
                debug!(session_id = %session_id, "Client disconnected");
                return Flow::Close;
            },
            Command::Ack | Command::Nack | Command::Begin | Command::Commit | Command::Abort => {
                debug!(session_id = %session_id, "Ignoring {} frame", command);
                Ok(())
            },
            Command::Connected | Command::Message | Command::Receipt | Command::Error => {
                Err(errors::protocol_error!(format!("{} is a server frame", command)))
            },
        };

        match result {
            Ok(()) => {
                self.send_receipt(&session, &frame).await;
                Flow::Continue
            },
            Err(err) => self.protocol_error(session_id, err).await,
        }
    }

    async fn send_receipt(&self, session: &Session, frame: &Frame) {
        let Some(receipt) = frame.header(HEADER_RECEIPT) else {
            return;
        };
        if let Err(e) = session
            .send(&Frame::receipt(receipt), self.write_timeout)
            .await
        {
            warn!(session_id = %session.id(), "RECEIPT not delivered: {}", e);
        }
    }

    fn connect_token(frame: &Frame) -> Option<&str> {
        let bearer = frame.header(HEADER_AUTHORIZATION).map(|value| {
            value
                .strip_prefix("Bearer ")
                .unwrap_or(value)
                .trim()
        });
        [bearer, frame.header(HEADER_PASSCODE), frame.header(HEADER_LOGIN)]
            .into_iter()
            .flatten()
            .find(|token| !token.is_empty())
    }

    async fn handle_connect(&self, session: &Session, frame: &Frame) -> Flow {
        let session_id = session.id();
        let Some(version) = StompVersion::negotiate(frame.header(HEADER_ACCEPT_VERSION)) else {
            return self.reject(session_id, UNSUPPORTED_VERSION, None).await;
        };

        // Long-lived sessions only need a well-signed, unexpired token
        let claims = match Self::connect_token(frame).map(|token| self.auth.parse(token)) {
            Some(Ok(claims)) => claims,
            Some(Err(e)) => {
                warn!(session_id = %session_id, "STOMP CONNECT rejected: {}", e);
                return self.reject(session_id, AUTH_FAILED, None).await;
            },
            None => {
                warn!(session_id = %session_id, "STOMP CONNECT without credentials");
                return self.reject(session_id, AUTH_FAILED, None).await;
            },
        };

        session.authenticate(&claims.username, version);
        if let Err(e) = self.registry.bind(session_id, &claims.username) {
            warn!(session_id = %session_id, "Bind failed: {}", e);
            return Flow::Close;
        }

        let connected = Frame::connected(version, &session_id.to_string());
        if let Err(e) = session.send(&connected, self.write_timeout).await {
            warn!(session_id = %session_id, "CONNECTED not delivered: {}", e);
            return Flow::Close;
        }
        info!(
            session_id = %session_id,
            username = %claims.username,
            version = %version,
            "STOMP session authenticated"
        );
        self.send_receipt(session, frame).await;
        Flow::Continue
    }

    fn handle_subscribe(&self, session: &Session, frame: &Frame) -> HeraldResult<()> {
        let sub_id = frame
            .header(HEADER_ID)
            .ok_or_else(|| errors::protocol_error!("SUBSCRIBE requires an id header"))?;
        let destination = frame
            .header(HEADER_DESTINATION)
            .ok_or_else(|| errors::protocol_error!("SUBSCRIBE requires a destination header"))?;

        let key = match Destination::parse(destination) {
            Destination::Topic(d) | Destination::Queue(d) | Destination::UserQueue(d) => d,
            Destination::UserScoped { username, canonical } if username == session.username() => {
                canonical
            },
            other => {
                warn!(
                    session_id = %session.id(),
                    destination,
                    "Subscription dropped: {:?} is not subscribable by this session",
                    other
                );
                return Ok(());
            },
        };

        if !session.add_subscription(sub_id, &key) {
            return Err(errors::protocol_error!(format!(
                "duplicate subscription id '{}'",
                sub_id
            )));
        }
        self.subscriptions.add(&key, session.id(), sub_id);
        debug!(session_id = %session.id(), sub_id, destination = %key, "Subscribed");
        Ok(())
    }

    fn handle_unsubscribe(&self, session: &Session, frame: &Frame) -> HeraldResult<()> {
        let sub_id = frame
            .header(HEADER_ID)
            .ok_or_else(|| errors::protocol_error!("UNSUBSCRIBE requires an id header"))?;
        match session.remove_subscription(sub_id) {
            Some(destination) => {
                self.subscriptions.remove(&destination, session.id(), sub_id);
                debug!(session_id = %session.id(), sub_id, "Unsubscribed");
            },
            None => debug!(session_id = %session.id(), sub_id, "Unsubscribe for unknown id"),
        }
        Ok(())
    }

    async fn handle_send(&self, session: &Session, frame: &Frame) -> HeraldResult<()> {
        let destination = frame
            .header(HEADER_DESTINATION)
            .ok_or_else(|| errors::protocol_error!("SEND requires a destination header"))?;
        let content_type = frame.header(HEADER_CONTENT_TYPE).unwrap_or(CONTENT_TYPE_JSON);

        match Destination::parse(destination) {
            Destination::App(dest) => {
                self.dispatch_app(session, dest, frame.body.clone()).await;
            },
            Destination::Topic(dest) | Destination::Queue(dest) => {
                self.publish(&dest, content_type, frame.body.clone()).await;
            },
            Destination::UserScoped { username, canonical } => {
                self.deliver_to_user(&username, &canonical, destination, content_type, frame.body.clone())
                    .await;
            },
            Destination::UserQueue(dest) | Destination::Other(dest) => {
                warn!(session_id = %session.id(), destination = %dest, "SEND to unroutable destination dropped");
            },
        }
        Ok(())
    }

    async fn dispatch_app(&self, session: &Session, destination: String, body: Bytes) {
        let Some((handler, params)) = self.handlers.resolve(&destination) else {
            let err = HeraldError::UnknownAppDestination(destination);
            warn!(session_id = %session.id(), "{}; message dropped", err);
            return;
        };
        let message = AppMessage {
            session_id: session.id(),
            sender: session.username(),
            destination,
            params,
            body,
        };
        let destination = message.destination.clone();
        if let Err(e) = handler.handle(self, message).await {
            warn!(session_id = %session.id(), destination = %destination, "App handler failed: {}", e);
        }
    }

    // ========================================================================
    // Server-originated publishing
    // ========================================================================

    fn next_message_id(&self) -> String {
        self.next_message_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Fan `body` out to every subscriber of `destination`. Returns the
    /// number of successful deliveries.
    pub async fn broadcast_topic(&self, destination: &str, body: Bytes) -> usize {
        self.publish(destination, CONTENT_TYPE_JSON, body).await
    }

    async fn publish(&self, destination: &str, content_type: &str, body: Bytes) -> usize {
        let subscribers = self.subscriptions.subscribers(destination);
        self.deliver(subscribers, destination, content_type, body).await
    }

    /// Deliver to `recipient`'s sessions subscribed to `/user{queue}`,
    /// labelled `/user/{recipient}{queue}`
    pub async fn send_to_user_destination(&self, recipient: &str, queue: &str, body: Bytes) -> usize {
        let canonical = subscription::user_queue(queue);
        let labelled = subscription::user_destination(recipient, queue);
        self.deliver_to_user(recipient, &canonical, &labelled, CONTENT_TYPE_JSON, body)
            .await
    }

    /// Private greeting from `sender` to `recipient`
    pub async fn send_to_user(&self, sender: &str, recipient: &str, body: Bytes) -> usize {
        let delivered = self
            .send_to_user_destination(recipient, GREETING_QUEUE, body)
            .await;
        debug!(sender, recipient, delivered, "Direct message sent");
        delivered
    }

    pub async fn broadcast_notice(&self, body: Bytes) -> usize {
        self.broadcast_topic(NOTICE_TOPIC, body).await
    }

    /// Publish `{"dictCode": code}` on `/topic/dict`
    pub async fn broadcast_dict_change(&self, dict_code: &str) -> HeraldResult<usize> {
        let body = serde_json::to_vec(&serde_json::json!({ "dictCode": dict_code }))?;
        Ok(self.broadcast_topic(DICT_TOPIC, Bytes::from(body)).await)
    }

    async fn deliver_to_user(
        &self,
        recipient: &str,
        canonical: &str,
        labelled: &str,
        content_type: &str,
        body: Bytes,
    ) -> usize {
        let owned: HashSet<SessionId> = self
            .registry
            .sessions_for(recipient)
            .iter()
            .map(|s| s.id())
            .collect();
        if owned.is_empty() {
            debug!(recipient, "No sessions for recipient");
            return 0;
        }
        let subscribers = self
            .subscriptions
            .subscribers(canonical)
            .into_iter()
            .filter(|s| owned.contains(&s.session_id))
            .collect();
        self.deliver(subscribers, labelled, content_type, body).await
    }

    async fn deliver(
        &self,
        subscribers: Vec<Subscriber>,
        destination: &str,
        content_type: &str,
        body: Bytes,
    ) -> usize {
        if subscribers.is_empty() {
            return 0;
        }
        let sessions: HashMap<SessionId, Arc<Session>> = self
            .registry
            .get_many(subscribers.iter().map(|s| s.session_id))
            .into_iter()
            .map(|s| (s.id(), s))
            .collect();
        let targets: Vec<(Arc<Session>, String)> = subscribers
            .into_iter()
            .filter_map(|sub| {
                sessions
                    .get(&sub.session_id)
                    .map(|s| (s.clone(), sub.sub_id))
            })
            .collect();

        let writes = targets.iter().map(|(session, sub_id)| {
            let frame = Frame::message(
                destination,
                sub_id,
                &self.next_message_id(),
                content_type,
                body.clone(),
            );
            async move {
                let result = session.send(&frame, self.write_timeout).await;
                (session.id(), result)
            }
        });

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (session_id, result) in join_all(writes).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(session_id = %session_id, destination, "Delivery failed: {}", e);
                    failed.push(session_id);
                },
            }
        }
        // Unreachable recipients leave the tables now; their sockets are
        // closed off the publish path
        for session_id in failed {
            if let Some(session) = self.detach(session_id) {
                let timeout = self.write_timeout;
                tokio::spawn(async move { session.close(timeout).await });
            }
        }
        debug!(destination, delivered, "Message fanned out");
        delivered
    }
}
