// Session Registry: one collaboration session per note, alive exactly while
// at least one authorized connection is attached.
//
// The registry map lock is never held while waiting for a session lock,
// so a busy session never stalls attach or detach on other notes. A
// session emptied by detach is marked closed before it leaves the map, and
// attach replaces a closed session it finds instead of joining it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use notesync_common::document::DocumentName;
use notesync_common::protocol::CloseReason;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::audit::{self, AuditEvent, AuditEventType};
use crate::auth::Identity;
use crate::metrics;

pub type ConnectionId = u64;
type AwarenessClientId = u64;

/// Immutable per-connection facts fixed at authorization time.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub document: DocumentName,
    pub request_id: String,
}

/// What a socket task is asked to write to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Binary(Vec<u8>),
    Close(CloseReason),
}

pub type Outbound = mpsc::UnboundedSender<OutboundFrame>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection {0} is not attached")]
    NotAttached(ConnectionId),
    #[error("failed to decode sync frame: {0}")]
    Decode(String),
    #[error("failed to apply sync message: {0}")]
    Apply(String),
}

struct Attachment {
    context: Arc<ConnectionContext>,
    outbound: Outbound,
    awareness_clients: HashSet<AwarenessClientId>,
}

struct SessionState {
    awareness: Awareness,
    connections: HashMap<ConnectionId, Attachment>,
    /// Set by the detach that empties the session. A closed session is
    /// never attached to again.
    closed: bool,
}

pub struct CollabSession {
    note_id: Uuid,
    created_at: Instant,
    state: Mutex<SessionState>,
}

/// Result of handling one inbound frame.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    /// Frames queued back to the sender.
    pub replies: usize,
    /// Frames queued to peers (each frame counted once per peer).
    pub forwarded: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DetachOutcome {
    pub removed_awareness_clients: Vec<AwarenessClientId>,
    /// Peers that received the awareness-removal frame.
    pub notified_peers: usize,
    pub session_destroyed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub note_id: Uuid,
    pub connections: usize,
    pub age_secs: u64,
}

impl CollabSession {
    fn new(note_id: Uuid) -> Self {
        Self {
            note_id,
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                awareness: Awareness::new(Doc::new()),
                connections: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    /// Decode and apply one frame from `sender`, answer it, and forward
    /// document and awareness changes to every other attached connection.
    ///
    /// A frame whose updates do not all decode is refused before anything
    /// is applied. If applying fails part way, whatever was applied is
    /// still forwarded before the error is returned.
    pub async fn handle_frame(
        &self,
        sender: ConnectionId,
        payload: &[u8],
    ) -> Result<FrameOutcome, SessionError> {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&sender) {
            return Err(SessionError::NotAttached(sender));
        }

        let messages = decode_messages(payload)?
            .into_iter()
            .map(|message| {
                let decoded = match &message {
                    Message::Sync(SyncMessage::SyncStep2(update) | SyncMessage::Update(update)) => {
                        Some(
                            Update::decode_v1(update)
                                .map_err(|err| SessionError::Decode(err.to_string()))?,
                        )
                    }
                    _ => None,
                };
                Ok((message, decoded))
            })
            .collect::<Result<Vec<_>, SessionError>>()?;
        let verbatim = (messages.len() == 1).then_some(payload);

        let mut applied = Applied::default();
        let mut failure = None;
        for (message, decoded) in messages {
            if let Err(err) = state.apply(message, decoded, verbatim, &mut applied) {
                failure = Some(err);
                break;
            }
        }

        if let Some(attachment) = state.connections.get_mut(&sender) {
            attachment.awareness_clients.extend(applied.claimed_clients);
            for reply in &applied.replies {
                let _ = attachment.outbound.send(OutboundFrame::Binary(reply.clone()));
            }
        }

        let mut forwarded = 0;
        for (kind, frame) in &applied.forwards {
            forwarded += broadcast_excluding(&state, sender, frame);
            metrics::record_frame_relayed(kind);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(FrameOutcome { replies: applied.replies.len(), forwarded }),
        }
    }

    /// Frames a freshly attached connection needs: our state vector and the
    /// presence of everyone already here.
    async fn greeting(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        let mut frames = Vec::with_capacity(2);
        let server_sv = state.awareness.doc().transact().state_vector();
        frames.push(Message::Sync(SyncMessage::SyncStep1(server_sv)).encode_v1());

        let has_peers_presence = state.awareness.iter().any(|(_, entry)| entry.data.is_some());
        if has_peers_presence {
            if let Ok(update) = state.awareness.update() {
                frames.push(Message::Awareness(update).encode_v1());
            }
        }
        frames
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn attached_users(&self) -> Vec<Identity> {
        self.state
            .lock()
            .await
            .connections
            .values()
            .map(|attachment| attachment.context.identity.clone())
            .collect()
    }

    /// Encoded full document state, for inspection.
    pub async fn encode_state(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        let txn = state.awareness.doc().transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    async fn close_all(&self, reason: CloseReason) -> usize {
        let state = self.state.lock().await;
        for attachment in state.connections.values() {
            let _ = attachment.outbound.send(OutboundFrame::Close(reason));
        }
        state.connections.len()
    }
}

#[derive(Default)]
struct Applied {
    replies: Vec<Vec<u8>>,
    forwards: Vec<(&'static str, Vec<u8>)>,
    claimed_clients: Vec<AwarenessClientId>,
}

impl SessionState {
    /// Apply one message. `verbatim` is the whole frame when it held only
    /// this message, and is forwarded as received.
    fn apply(
        &mut self,
        message: Message,
        decoded: Option<Update>,
        verbatim: Option<&[u8]>,
        applied: &mut Applied,
    ) -> Result<(), SessionError> {
        let protocol = DefaultProtocol;
        match (message, decoded) {
            (Message::Sync(SyncMessage::SyncStep1(state_vector)), _) => {
                if let Some(reply) = protocol
                    .handle_sync_step1(&self.awareness, state_vector)
                    .map_err(|err| SessionError::Apply(err.to_string()))?
                {
                    applied.replies.push(reply.encode_v1());
                }
                let server_sv = self.awareness.doc().transact().state_vector();
                applied.replies.push(Message::Sync(SyncMessage::SyncStep1(server_sv)).encode_v1());
            }
            (Message::Sync(SyncMessage::SyncStep2(update)), Some(decoded)) => {
                protocol
                    .handle_sync_step2(&self.awareness, decoded)
                    .map_err(|err| SessionError::Apply(err.to_string()))?;
                // Handshake payloads reach peers as plain updates.
                applied
                    .forwards
                    .push(("update", Message::Sync(SyncMessage::Update(update)).encode_v1()));
            }
            (Message::Sync(SyncMessage::Update(update)), Some(decoded)) => {
                protocol
                    .handle_update(&self.awareness, decoded)
                    .map_err(|err| SessionError::Apply(err.to_string()))?;
                let frame = match verbatim {
                    Some(payload) => payload.to_vec(),
                    None => Message::Sync(SyncMessage::Update(update)).encode_v1(),
                };
                applied.forwards.push(("update", frame));
            }
            (Message::Awareness(update), _) => {
                let clients: Vec<AwarenessClientId> = update.clients.keys().copied().collect();
                self.awareness
                    .apply_update_summary(update)
                    .map_err(|err| SessionError::Apply(err.to_string()))?;
                let frame = match verbatim {
                    Some(payload) => payload.to_vec(),
                    None => {
                        let update = self
                            .awareness
                            .update_with_clients(clients.clone())
                            .map_err(|err| SessionError::Apply(err.to_string()))?;
                        Message::Awareness(update).encode_v1()
                    }
                };
                applied.claimed_clients.extend(clients);
                applied.forwards.push(("awareness", frame));
            }
            (Message::AwarenessQuery, _) => {
                if let Some(reply) = protocol
                    .handle_awareness_query(&self.awareness)
                    .map_err(|err| SessionError::Apply(err.to_string()))?
                {
                    applied.replies.push(reply.encode_v1());
                }
            }
            (other, _) => {
                if let Some(reply) = protocol
                    .handle_message(&self.awareness, other)
                    .map_err(|err| SessionError::Apply(err.to_string()))?
                {
                    applied.replies.push(reply.encode_v1());
                }
            }
        }
        Ok(())
    }
}

fn decode_messages(payload: &[u8]) -> Result<Vec<Message>, SessionError> {
    let mut decoder = DecoderV1::new(Cursor::new(payload));
    let mut reader = MessageReader::new(&mut decoder);
    let mut messages = Vec::new();
    while let Some(next) = reader.next() {
        messages.push(next.map_err(|err| SessionError::Decode(err.to_string()))?);
    }
    Ok(messages)
}

fn broadcast_excluding(state: &SessionState, sender: ConnectionId, frame: &[u8]) -> usize {
    let mut delivered = 0;
    for (connection_id, attachment) in &state.connections {
        if *connection_id == sender {
            continue;
        }
        if attachment.outbound.send(OutboundFrame::Binary(frame.to_vec())).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

/// Process-wide table of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<CollabSession>>>,
    next_connection_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Attach an authorized connection, creating the session on first use.
    /// Returns the session and the greeting frames to send first.
    pub async fn attach(
        &self,
        context: ConnectionContext,
        outbound: Outbound,
    ) -> (Arc<CollabSession>, Vec<Vec<u8>>) {
        let note_id = context.document.note_id();
        let document = context.document.to_string();

        let session = loop {
            let session = self
                .sessions
                .write()
                .await
                .entry(note_id)
                .or_insert_with(|| {
                    audit::emit(AuditEvent::session(AuditEventType::SessionCreated, note_id));
                    Arc::new(CollabSession::new(note_id))
                })
                .clone();

            let mut state = session.state.lock().await;
            if state.closed {
                // Emptied between lookup and lock.
                drop(state);
                self.forget(&session).await;
                continue;
            }
            tracing::info!(
                note_id = %note_id,
                connection_id = context.connection_id,
                user = %context.identity.email,
                peers = state.connections.len(),
                "connection attached"
            );
            state.connections.insert(
                context.connection_id,
                Attachment {
                    context: Arc::new(context),
                    outbound,
                    awareness_clients: HashSet::new(),
                },
            );
            break session.clone();
        };
        metrics::record_connection_opened(&document);

        let greeting = session.greeting().await;
        (session, greeting)
    }

    /// Detach a connection. Removes its presence, tells remaining peers once,
    /// and destroys the session when nobody is left. `None` when the
    /// connection was not attached (double detach).
    pub async fn detach(&self, note_id: Uuid, connection_id: ConnectionId) -> Option<DetachOutcome> {
        let session = self.get(note_id).await?;
        let mut state = session.state.lock().await;
        let attachment = state.connections.remove(&connection_id)?;

        let mut removed: Vec<AwarenessClientId> =
            attachment.awareness_clients.iter().copied().collect();
        removed.sort_unstable();
        let mut notified_peers = 0;
        if !removed.is_empty() {
            for client_id in &removed {
                state.awareness.remove_state(*client_id);
            }
            if !state.connections.is_empty() {
                match state.awareness.update_with_clients(removed.clone()) {
                    Ok(update) => {
                        let frame = Message::Awareness(update).encode_v1();
                        notified_peers = broadcast_excluding(&state, connection_id, &frame);
                    }
                    Err(err) => {
                        tracing::warn!(note_id = %note_id, ?err, "failed to encode awareness removal");
                    }
                }
            }
        }

        let session_destroyed = state.connections.is_empty();
        state.closed = session_destroyed;
        drop(state);
        if session_destroyed {
            self.forget(&session).await;
            audit::emit(AuditEvent::session(AuditEventType::SessionDestroyed, note_id));
        }

        metrics::record_connection_closed(&attachment.context.document.to_string());
        tracing::info!(
            note_id = %note_id,
            connection_id,
            user = %attachment.context.identity.email,
            session_destroyed,
            "connection detached"
        );

        Some(DetachOutcome { removed_awareness_clients: removed, notified_peers, session_destroyed })
    }

    /// Drop a closed session from the map unless it was already replaced.
    async fn forget(&self, session: &Arc<CollabSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&session.note_id).is_some_and(|current| Arc::ptr_eq(current, session)) {
            sessions.remove(&session.note_id);
        }
    }

    pub async fn get(&self, note_id: Uuid) -> Option<Arc<CollabSession>> {
        self.sessions.read().await.get(&note_id).cloned()
    }

    pub async fn contains(&self, note_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&note_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<CollabSession>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(SessionSummary {
                note_id: session.note_id,
                connections: session.connection_count().await,
                age_secs: session.created_at.elapsed().as_secs(),
            });
        }
        out.sort_by_key(|summary| summary.note_id);
        out
    }

    /// Ask every attached socket to close. Sockets detach themselves.
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let sessions: Vec<Arc<CollabSession>> = self.sessions.read().await.values().cloned().collect();
        let mut signalled = 0;
        for session in sessions {
            signalled += session.close_all(reason).await;
        }
        signalled
    }
}
