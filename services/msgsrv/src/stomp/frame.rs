//! STOMP frame model
//!
//! `COMMAND\n(header:value\n)*\n body \0`

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

pub const HEADER_ACCEPT_VERSION: &str = "accept-version";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_DESTINATION: &str = "destination";
pub const HEADER_ID: &str = "id";
pub const HEADER_LOGIN: &str = "login";
pub const HEADER_MESSAGE: &str = "message";
pub const HEADER_MESSAGE_ID: &str = "message-id";
pub const HEADER_PASSCODE: &str = "passcode";
pub const HEADER_RECEIPT: &str = "receipt";
pub const HEADER_RECEIPT_ID: &str = "receipt-id";
pub const HEADER_SESSION: &str = "session";
pub const HEADER_SUBSCRIPTION: &str = "subscription";
pub const HEADER_VERSION: &str = "version";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// STOMP commands, client and server side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Frames whose headers are never escaped
    pub fn is_connect_family(&self) -> bool {
        matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }

    /// Commands only a server may send
    pub fn is_server_command(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Message | Self::Receipt | Self::Error
        )
    }
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(other.to_string()),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version, ordered oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StompVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl StompVersion {
    pub const SUPPORTED: [StompVersion; 3] = [Self::V1_0, Self::V1_1, Self::V1_2];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
            Self::V1_2 => "1.2",
        }
    }

    /// Header values are escaped from 1.1 on
    pub fn escapes_headers(&self) -> bool {
        *self >= Self::V1_1
    }

    /// Highest version present in both the client's `accept-version` list
    /// and ours. A client that sends no list accepts any of ours.
    pub fn negotiate(accept_version: Option<&str>) -> Option<Self> {
        let Some(list) = accept_version else {
            return Some(Self::V1_2);
        };
        list.split(',')
            .filter_map(|v| v.trim().parse::<Self>().ok())
            .max()
    }
}

impl FromStr for StompVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(Self::V1_0),
            "1.1" => Ok(Self::V1_1),
            "1.2" => Ok(Self::V1_2),
            _ => Err(()),
        }
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame
///
/// Headers keep their wire order; repeated names are preserved and
/// [`Frame::header`] returns the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `CONNECTED` reply for a successful handshake
    pub fn connected(version: StompVersion, session_id: &str) -> Self {
        Self::new(Command::Connected)
            .with_header(HEADER_VERSION, version.as_str())
            .with_header(HEADER_SESSION, session_id)
    }

    /// `MESSAGE` delivery; always carries content-type and content-length
    pub fn message(
        destination: &str,
        subscription: &str,
        message_id: &str,
        content_type: &str,
        body: Bytes,
    ) -> Self {
        Self::new(Command::Message)
            .with_header(HEADER_DESTINATION, destination)
            .with_header(HEADER_SUBSCRIPTION, subscription)
            .with_header(HEADER_MESSAGE_ID, message_id)
            .with_header(HEADER_CONTENT_TYPE, content_type)
            .with_header(HEADER_CONTENT_LENGTH, body.len().to_string())
            .with_body(body)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Self::new(Command::Receipt).with_header(HEADER_RECEIPT_ID, receipt_id)
    }

    /// `ERROR` frame; a detail, when given, becomes a text body
    pub fn error(message: &str, detail: Option<&str>) -> Self {
        let frame = Self::new(Command::Error).with_header(HEADER_MESSAGE, message);
        match detail {
            Some(detail) => frame
                .with_header(HEADER_CONTENT_TYPE, "text/plain")
                .with_header(HEADER_CONTENT_LENGTH, detail.len().to_string())
                .with_body(Bytes::copy_from_slice(detail.as_bytes())),
            None => frame,
        }
    }
}

/// Escape a header name or value (STOMP 1.1+)
pub fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape_header`]; an undefined escape is an error
pub fn unescape_header(escaped: &str) -> Result<String, String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some(other) => return Err(format!("undefined escape sequence \\{}", other)),
            None => return Err("dangling escape at end of header".to_string()),
        }
    }
    Ok(out)
}
