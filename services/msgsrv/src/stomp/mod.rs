//! STOMP 1.0 / 1.1 / 1.2 framing

pub mod codec;
pub mod frame;

pub use codec::{FrameError, StompCodec};
pub use frame::{Command, Frame, StompVersion};

/// WebSocket subprotocols offered on `/ws`, preferred first
pub const SUBPROTOCOLS: [&str; 3] = ["v12.stomp", "v11.stomp", "v10.stomp"];
