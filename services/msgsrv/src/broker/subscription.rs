//! Destination parsing and the subscription table

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::session::SessionId;

pub const TOPIC_PREFIX: &str = "/topic/";
pub const QUEUE_PREFIX: &str = "/queue/";
pub const USER_PREFIX: &str = "/user/";
pub const USER_QUEUE_PREFIX: &str = "/user/queue/";
pub const APP_PREFIX: &str = "/app/";

/// A STOMP destination classified by prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `/topic/*`
    Topic(String),
    /// `/queue/*`
    Queue(String),
    /// `/user/queue/*`, the form private subscriptions are registered under
    UserQueue(String),
    /// `/user/{username}/queue/*`
    UserScoped { username: String, canonical: String },
    /// `/app/*`
    App(String),
    Other(String),
}

fn has_name(raw: &str, prefix: &str) -> bool {
    raw.len() > prefix.len() && raw.starts_with(prefix)
}

impl Destination {
    pub fn parse(raw: &str) -> Self {
        if has_name(raw, TOPIC_PREFIX) {
            return Self::Topic(raw.to_string());
        }
        if has_name(raw, QUEUE_PREFIX) {
            return Self::Queue(raw.to_string());
        }
        if has_name(raw, USER_QUEUE_PREFIX) {
            return Self::UserQueue(raw.to_string());
        }
        if has_name(raw, APP_PREFIX) {
            return Self::App(raw.to_string());
        }
        if let Some(rest) = raw.strip_prefix(USER_PREFIX) {
            if let Some((username, queue)) = rest.split_once('/') {
                let queue = format!("/{}", queue);
                if !username.is_empty() && has_name(&queue, QUEUE_PREFIX) {
                    return Self::UserScoped {
                        username: username.to_string(),
                        canonical: user_queue(&queue),
                    };
                }
            }
        }
        Self::Other(raw.to_string())
    }
}

/// `/queue/x` -> `/user/queue/x`
pub fn user_queue(queue: &str) -> String {
    format!("/user{}", queue)
}

/// `/queue/x` for `alice` -> `/user/alice/queue/x`
pub fn user_destination(username: &str, queue: &str) -> String {
    format!("{}{}{}", USER_PREFIX, username, queue)
}

/// One subscriber of a destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub session_id: SessionId,
    pub sub_id: String,
}

/// destination -> subscribers
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    inner: Mutex<HashMap<String, HashSet<Subscriber>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, destination: &str, session_id: SessionId, sub_id: &str) {
        self.inner
            .lock()
            .entry(destination.to_string())
            .or_default()
            .insert(Subscriber {
                session_id,
                sub_id: sub_id.to_string(),
            });
    }

    pub fn remove(&self, destination: &str, session_id: SessionId, sub_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(subscribers) = inner.get_mut(destination) else {
            return false;
        };
        let removed = subscribers.remove(&Subscriber {
            session_id,
            sub_id: sub_id.to_string(),
        });
        if subscribers.is_empty() {
            inner.remove(destination);
        }
        removed
    }

    /// Drop every entry held by `session_id`; returns how many were removed
    pub fn remove_session(&self, session_id: SessionId) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        inner.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| s.session_id != session_id);
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    /// Copy of the current subscribers of `destination`
    pub fn subscribers(&self, destination: &str) -> Vec<Subscriber> {
        self.inner
            .lock()
            .get(destination)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn destination_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().values().map(HashSet::len).sum()
    }
}
