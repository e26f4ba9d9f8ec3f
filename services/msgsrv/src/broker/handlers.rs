//! Server-side handlers for `/app/*` destinations

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use errors::{HeraldError, HeraldResult};

use super::session::SessionId;
use super::Broker;

/// A client `SEND` routed to an app handler
#[derive(Debug, Clone)]
pub struct AppMessage {
    pub session_id: SessionId,
    /// Username bound to the sending session
    pub sender: String,
    pub destination: String,
    /// Values captured by `{name}` segments
    pub params: HashMap<String, String>,
    pub body: Bytes,
}

impl AppMessage {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait AppHandler: Send + Sync {
    async fn handle(&self, broker: &Broker, message: AppMessage) -> HeraldResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

/// `/app/sendToUser/{username}` style pattern
#[derive(Debug, Clone)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> HeraldResult<Self> {
        if !pattern.starts_with('/') {
            return Err(HeraldError::Validation(format!(
                "route pattern must start with '/': {}",
                pattern
            )));
        }
        let segments = pattern[1..]
            .split('/')
            .map(|seg| match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) if !name.is_empty() => Ok(Segment::Capture(name.to_string())),
                Some(_) => Err(HeraldError::Validation(format!(
                    "empty capture in route pattern: {}",
                    pattern
                ))),
                None => Ok(Segment::Literal(seg.to_string())),
            })
            .collect::<HeraldResult<Vec<_>>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Captured parameters when `destination` matches
    pub fn matches(&self, destination: &str) -> Option<HashMap<String, String>> {
        let rest = destination.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {},
                Segment::Literal(_) => return None,
                Segment::Capture(_) if part.is_empty() => return None,
                Segment::Capture(name) => {
                    params.insert(name.clone(), part.to_string());
                },
            }
        }
        Some(params)
    }
}

/// App destination -> handler, first registered match wins
#[derive(Default)]
pub struct HandlerRegistry {
    routes: Vec<(RoutePattern, Arc<dyn AppHandler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `/app/sendToAll` and `/app/sendToUser/{username}`
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        // Patterns are static and known to be well-formed
        for (pattern, handler) in [
            ("/app/sendToAll", Arc::new(SendToAllHandler) as Arc<dyn AppHandler>),
            ("/app/sendToUser/{username}", Arc::new(SendToUserHandler)),
        ] {
            if let Ok(pattern) = RoutePattern::parse(pattern) {
                registry.routes.push((pattern, handler));
            }
        }
        registry
    }

    pub fn register(&mut self, pattern: &str, handler: Arc<dyn AppHandler>) -> HeraldResult<()> {
        let pattern = RoutePattern::parse(pattern)?;
        debug!(pattern = pattern.as_str(), "App handler registered");
        self.routes.push((pattern, handler));
        Ok(())
    }

    pub fn resolve(
        &self,
        destination: &str,
    ) -> Option<(Arc<dyn AppHandler>, HashMap<String, String>)> {
        self.routes.iter().find_map(|(pattern, handler)| {
            pattern
                .matches(destination)
                .map(|params| (handler.clone(), params))
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Valid JSON passes through, anything else becomes a JSON string
pub fn json_payload(body: &[u8]) -> Bytes {
    if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
        return Bytes::copy_from_slice(body);
    }
    let text = String::from_utf8_lossy(body);
    serde_json::to_vec(&text)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::copy_from_slice(body))
}

/// `/app/sendToAll`: rebroadcast to `/topic/notice`
pub struct SendToAllHandler;

#[async_trait]
impl AppHandler for SendToAllHandler {
    async fn handle(&self, broker: &Broker, message: AppMessage) -> HeraldResult<()> {
        broker.broadcast_notice(json_payload(&message.body)).await;
        Ok(())
    }
}

/// `/app/sendToUser/{username}`: private greeting to one user
pub struct SendToUserHandler;

#[async_trait]
impl AppHandler for SendToUserHandler {
    async fn handle(&self, broker: &Broker, message: AppMessage) -> HeraldResult<()> {
        let recipient = message
            .param("username")
            .ok_or_else(|| HeraldError::BadRequest("missing recipient".to_string()))?;
        broker
            .send_to_user(&message.sender, recipient, json_payload(&message.body))
            .await;
        Ok(())
    }
}
