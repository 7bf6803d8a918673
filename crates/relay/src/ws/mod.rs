// Collaboration Relay socket handling.
//
// `GET /{document}?token=...` upgrades to a WebSocket. The connection is
// authorized after the upgrade and before it joins any session, so a
// rejected peer only ever sees the close frame.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use notesync_common::protocol::CloseReason;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{authorize_connection, AccessVerifier};
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope, ErrorCode, RelayError};
use crate::session::{
    CollabSession, ConnectionContext, ConnectionId, OutboundFrame, SessionError, SessionRegistry,
};
use crate::shutdown::ShutdownCoordinator;

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const MAX_FRAME_BYTES: usize = 262_144;

/// Shared state for the relay listener.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<SessionRegistry>,
    pub verifier: Arc<AccessVerifier>,
    pub shutdown: ShutdownCoordinator,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

impl RelayState {
    pub fn new(verifier: AccessVerifier) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            verifier: Arc::new(verifier),
            shutdown: ShutdownCoordinator::new(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
    document: Option<String>,
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(ws_root_upgrade))
        .route("/{document}", get(ws_document_upgrade))
        .with_state(state)
}

async fn ws_document_upgrade(
    Path(document): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, document, query.token, &headers, ws)
}

/// Clients that put the document name in the query instead of the path.
async fn ws_root_upgrade(
    Query(query): Query<ConnectQuery>,
    State(state): State<RelayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, query.document.unwrap_or_default(), query.token, &headers, ws)
}

fn upgrade(
    state: RelayState,
    document: String,
    token: Option<String>,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_draining() {
        return RelayError::from_code(ErrorCode::ShuttingDown).into_response();
    }

    let request_id = request_id_from_headers_or_generate(headers);
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(
                request_id.clone(),
                handle_socket(socket, state, document, token, request_id),
            )
            .await;
        },
    )
}

async fn handle_socket(
    mut socket: WebSocket,
    state: RelayState,
    document: String,
    token: Option<String>,
    request_id: String,
) {
    let (name, identity) =
        match authorize_connection(&state.verifier, token.as_deref(), &document).await {
            Ok(authorized) => authorized,
            Err(error) => {
                info!(request_id = %request_id, document = %document, %error, "connection refused");
                send_close(&mut socket, error.reason).await;
                return;
            }
        };

    if state.shutdown.is_draining() {
        send_close(&mut socket, CloseReason::ServerShuttingDown).await;
        return;
    }

    let connection_id = state.registry.next_connection_id();
    let note_id = name.note_id();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let context = ConnectionContext { connection_id, identity, document: name, request_id };
    let (session, greeting) = state.registry.attach(context, outbound_tx).await;

    let mut close_reason = None;
    let mut greeted = true;
    for frame in greeting {
        if socket.send(Message::Binary(frame.into())).await.is_err() {
            greeted = false;
            break;
        }
    }
    if greeted {
        close_reason =
            run_connection(&mut socket, &session, connection_id, &mut outbound_rx, state.heartbeat)
                .await;
    }

    state.registry.detach(note_id, connection_id).await;
    if let Some(reason) = close_reason {
        send_close(&mut socket, reason).await;
    }
}

/// Pump frames until the peer leaves or the relay closes the connection.
/// Returns the reason to put in our close frame, if we are the closing side.
async fn run_connection(
    socket: &mut WebSocket,
    session: &CollabSession,
    connection_id: ConnectionId,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    heartbeat: HeartbeatConfig,
) -> Option<CloseReason> {
    let mut heartbeat_interval =
        tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_wait = sleep_until_or_forever(pong_deadline);

        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if pong_deadline.is_none() {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return None;
                    }
                    pong_deadline = Some(Instant::now() + heartbeat.timeout);
                }
            }
            _ = pong_wait => {
                warn!(connection_id, note_id = %session.note_id(), "heartbeat timeout, disconnecting");
                return Some(CloseReason::HeartbeatTimeout);
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(OutboundFrame::Binary(frame)) => {
                        if socket.send(Message::Binary(frame.into())).await.is_err() {
                            return None;
                        }
                    }
                    Some(OutboundFrame::Close(reason)) => return Some(reason),
                    None => return None,
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else {
                    return None;
                };
                match message {
                    Message::Binary(payload) => {
                        match session.handle_frame(connection_id, payload.as_ref()).await {
                            Ok(_) => {}
                            Err(SessionError::NotAttached(_)) => return None,
                            Err(error) => {
                                warn!(connection_id, note_id = %session.note_id(), %error, "dropping malformed frame");
                            }
                        }
                    }
                    Message::Pong(_) => pong_deadline = None,
                    Message::Ping(_) => {}
                    Message::Text(_) => debug!(connection_id, "ignoring text frame"),
                    Message::Close(_) => return None,
                }
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn send_close(socket: &mut WebSocket, reason: CloseReason) {
    let code = match reason {
        CloseReason::ServerShuttingDown => close_code::AWAY,
        other => other.close_code(),
    };
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.as_str().to_string().into() })))
        .await;
}
