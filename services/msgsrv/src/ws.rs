//! `GET /ws`: WebSocket upgrade and the per-session read loop

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use bytes::BytesMut;
use futures::stream::SplitStream;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use errors::HeraldError;

use crate::app_state::AppState;
use crate::broker::{Broker, Flow, SessionId, WsSink};
use crate::stomp::{StompCodec, StompVersion, SUBPROTOCOLS};
use crate::tx_scope::panic_message;

const CONNECT_TIMEOUT: &str = "Connect timeout";

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_frame_bytes = state.config.broker.max_frame_bytes;
    ws.protocols(SUBPROTOCOLS)
        .max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| run_session(state, socket))
}

/// Drive one connection until EOF, protocol error, or teardown
///
/// The loop holds only the session id; the registry owns the session.
pub async fn run_session(state: AppState, socket: WebSocket) {
    let broker = state.broker.clone();
    let (sink, stream) = socket.split();

    let (session_id, shutdown) = {
        let session = broker.open_session(Box::new(WsSink::new(sink)));
        (session.id(), session.shutdown_token())
    };

    with_teardown(
        &broker,
        session_id,
        read_loop(&state, session_id, shutdown, stream),
    )
    .await;
}

/// Run `session_loop`, then tear the session down however the loop ended
pub async fn with_teardown<F>(broker: &Broker, session_id: SessionId, session_loop: F)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(session_loop).catch_unwind().await {
        error!(
            session_id = %session_id,
            "Session read loop panicked: {}",
            panic_message(payload.as_ref())
        );
    }
    broker.close_session(session_id).await;
}

async fn read_loop(
    state: &AppState,
    session_id: SessionId,
    shutdown: CancellationToken,
    mut stream: SplitStream<WebSocket>,
) {
    let broker = &state.broker;
    let mut codec = StompCodec::new(StompVersion::V1_2, state.config.broker.max_frame_bytes);
    let mut buffer = BytesMut::new();
    let mut authenticated = false;
    let connect_deadline = tokio::time::sleep(state.config.broker.connect_timeout());
    tokio::pin!(connect_deadline);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut connect_deadline, if !authenticated => {
                broker.reject(session_id, CONNECT_TIMEOUT, None).await;
                break;
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => buffer.extend_from_slice(text.as_str().as_bytes()),
                    Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    // Ping/pong are answered by the transport
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, "WebSocket read failed: {}", e);
                        break;
                    }
                }
                if process_buffer(broker, session_id, &mut codec, &mut buffer).await == Flow::Close {
                    break;
                }
                if !authenticated {
                    authenticated = broker
                        .registry()
                        .get(session_id)
                        .is_some_and(|s| s.is_authenticated());
                }
            }
        }
    }
}

/// Decode and dispatch every complete frame in `buffer`
async fn process_buffer(
    broker: &Arc<Broker>,
    session_id: SessionId,
    codec: &mut StompCodec,
    buffer: &mut BytesMut,
) -> Flow {
    loop {
        match codec.decode(buffer) {
            Ok(Some(frame)) => {
                let is_connect = frame.command.is_connect_family();
                if broker.handle_frame(session_id, frame).await == Flow::Close {
                    return Flow::Close;
                }
                // Later frames are decoded with the negotiated escaping rules
                if is_connect {
                    if let Some(session) = broker.registry().get(session_id) {
                        codec.set_version(session.version());
                    }
                }
            },
            Ok(None) => return Flow::Continue,
            Err(e) => {
                let err: HeraldError = e.into();
                return broker.protocol_error(session_id, err).await;
            },
        }
    }
}
