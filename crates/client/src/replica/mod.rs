// Client Replica Manager: one CRDT document and one relay connection for
// the note currently open in the editor.
//
// The connection loop runs as a background task per replica. It owns the
// handshake, applies remote frames, and reconnects with backoff on
// transient closes. Definitive rejections stop the loop.

pub mod transport;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use notesync_common::awareness::{AwarenessState, AwarenessUser, CursorState};
use notesync_common::document::DocumentName;
use notesync_common::protocol::CloseReason;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, TextRef, Transact, Transaction, TransactionMut, Update};

use crate::api::{ApiError, CredentialSource};
use crate::config::ReconnectPolicy;
use crate::presence::PresenceRoster;

pub use transport::{ConnectError, FrameChannel, RelayConnector, RelayFrame, WsConnector, ABNORMAL_CLOSE};

/// Root text type holding the note body inside the shared document.
pub const CONTENT_FIELD: &str = "content";

// ── Public types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaStatus {
    Connecting,
    Synced,
    Disconnected { reason: String },
    Rejected { reason: CloseReason },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("replica is not synced yet")]
    NotSynced,
    #[error("relay rejected the connection: {0}")]
    Rejected(CloseReason),
    #[error("timed out waiting for the initial sync")]
    Timeout,
    #[error("replica is closed")]
    Closed,
    #[error("failed to encode replica state: {0}")]
    Encode(String),
}

/// Outcome of opening a note for collaborative editing.
#[derive(Clone)]
pub enum Collaboration {
    Enabled(ReplicaHandle),
    /// No relay connection was attempted. The editor stays single-user and
    /// shows the reason.
    Disabled { reason: String },
}

impl Collaboration {
    pub fn handle(&self) -> Option<&ReplicaHandle> {
        match self {
            Self::Enabled(handle) => Some(handle),
            Self::Disabled { .. } => None,
        }
    }
}

// ── Replica handle ──────────────────────────────────────────────────

struct ReplicaShared {
    note_id: Uuid,
    awareness: Mutex<Awareness>,
    local: Mutex<AwarenessState>,
    status: watch::Sender<ReplicaStatus>,
    presence: watch::Sender<PresenceRoster>,
    revision: watch::Sender<u64>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicaShared {
    fn set_status(&self, status: ReplicaStatus) {
        debug!(note_id = %self.note_id, ?status, "replica status changed");
        self.status.send_replace(status);
    }

    fn publish_presence(&self, awareness: &Awareness) {
        self.presence.send_replace(PresenceRoster::from_awareness(awareness));
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), ReplicaError> {
        let outbound = self.outbound.lock().expect("replica outbound lock poisoned");
        let sender = outbound.as_ref().ok_or(ReplicaError::Closed)?;
        sender.send(frame).map_err(|_| ReplicaError::Closed)
    }
}

/// Cheap to clone; every clone drives the same replica.
#[derive(Clone)]
pub struct ReplicaHandle {
    shared: Arc<ReplicaShared>,
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("note_id", &self.shared.note_id)
            .field("status", &*self.shared.status.borrow())
            .finish()
    }
}

impl ReplicaHandle {
    fn spawn(
        note_id: Uuid,
        user: AwarenessUser,
        token: String,
        connector: Arc<dyn RelayConnector>,
        credentials: Arc<dyn CredentialSource>,
        policy: ReconnectPolicy,
    ) -> Result<Self, ReplicaError> {
        let awareness = Awareness::new(Doc::new());
        let local = AwarenessState { user: Some(user), cursor: None };
        awareness.set_local_state(&local).map_err(|err| ReplicaError::Encode(err.to_string()))?;
        let roster = PresenceRoster::from_awareness(&awareness);

        let shared = Arc::new(ReplicaShared {
            note_id,
            awareness: Mutex::new(awareness),
            local: Mutex::new(local),
            status: watch::Sender::new(ReplicaStatus::Connecting),
            presence: watch::Sender::new(roster),
            revision: watch::Sender::new(0),
            outbound: Mutex::new(None),
            shutdown: watch::Sender::new(false),
            task: Mutex::new(None),
        });

        let runner = ConnectionLoop {
            shared: Arc::clone(&shared),
            document: DocumentName::for_note(note_id),
            connector,
            credentials,
            policy,
        };
        let task = tokio::spawn(runner.run(token));
        *shared.task.lock().expect("replica task lock poisoned") = Some(task);

        Ok(Self { shared })
    }

    pub fn note_id(&self) -> Uuid {
        self.shared.note_id
    }

    pub fn status(&self) -> watch::Receiver<ReplicaStatus> {
        self.shared.status.subscribe()
    }

    pub fn current_status(&self) -> ReplicaStatus {
        self.shared.status.borrow().clone()
    }

    /// Immutable roster snapshots, republished on every awareness change.
    pub fn presence(&self) -> watch::Receiver<PresenceRoster> {
        self.shared.presence.subscribe()
    }

    /// Bumped whenever a remote change lands in the document.
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Resolve once the first SyncStep2 has been applied.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<(), ReplicaError> {
        let mut status = self.shared.status.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|status| {
                matches!(status, ReplicaStatus::Synced | ReplicaStatus::Rejected { .. })
            }),
        )
        .await;

        match waited {
            Err(_) => Err(ReplicaError::Timeout),
            Ok(Err(_)) => Err(ReplicaError::Closed),
            Ok(Ok(status)) => match &*status {
                ReplicaStatus::Rejected { reason } => Err(ReplicaError::Rejected(*reason)),
                _ => Ok(()),
            },
        }
    }

    /// Apply a local edit and ship it to the relay. Refused until the
    /// replica has synced so local state never races the initial merge.
    pub fn edit<R>(
        &self,
        edit: impl FnOnce(&TextRef, &mut TransactionMut) -> R,
    ) -> Result<R, ReplicaError> {
        match self.current_status() {
            ReplicaStatus::Synced => {}
            ReplicaStatus::Rejected { reason } => return Err(ReplicaError::Rejected(reason)),
            _ => return Err(ReplicaError::NotSynced),
        }

        let (result, update) = {
            let awareness = self.shared.awareness.lock().expect("replica awareness lock poisoned");
            let text = awareness.doc().get_or_insert_text(CONTENT_FIELD);
            let mut txn = awareness.doc().transact_mut();
            let result = edit(&text, &mut txn);
            let update = txn.encode_update_v1();
            (result, update)
        };

        self.shared.send(Message::Sync(SyncMessage::Update(update)).encode_v1())?;
        Ok(result)
    }

    pub fn read<R>(&self, read: impl FnOnce(&TextRef, &Transaction) -> R) -> R {
        let awareness = self.shared.awareness.lock().expect("replica awareness lock poisoned");
        let text = awareness.doc().get_or_insert_text(CONTENT_FIELD);
        let txn = awareness.doc().transact();
        read(&text, &txn)
    }

    pub fn text(&self) -> String {
        self.read(|text, txn| text.get_string(txn))
    }

    /// Publish the local selection. Sent right away when connected, and
    /// with the full local state on the next handshake otherwise.
    pub fn set_cursor(&self, cursor: Option<CursorState>) -> Result<(), ReplicaError> {
        let frame = {
            let mut local = self.shared.local.lock().expect("replica local state lock poisoned");
            local.cursor = cursor;
            let awareness = self.shared.awareness.lock().expect("replica awareness lock poisoned");
            awareness.set_local_state(&*local).map_err(|err| ReplicaError::Encode(err.to_string()))?;
            self.shared.publish_presence(&awareness);
            let update = awareness
                .update_with_clients([awareness.client_id()])
                .map_err(|err| ReplicaError::Encode(err.to_string()))?;
            Message::Awareness(update).encode_v1()
        };

        match self.shared.send(frame) {
            Ok(()) | Err(ReplicaError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .task
            .lock()
            .expect("replica task lock poisoned")
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Stop the connection loop, close the socket and wait for the task.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let task = self.shared.task.lock().expect("replica task lock poisoned").take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(note_id = %self.shared.note_id, error = %err, "replica task ended abnormally");
            }
        }
    }
}

// ── Connection loop ─────────────────────────────────────────────────

enum SessionEnd {
    Shutdown,
    Closed { code: u16, reason: String, synced: bool },
}

struct ConnectionLoop {
    shared: Arc<ReplicaShared>,
    document: DocumentName,
    connector: Arc<dyn RelayConnector>,
    credentials: Arc<dyn CredentialSource>,
    policy: ReconnectPolicy,
}

impl ConnectionLoop {
    async fn run(self, first_token: String) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut token = Some(first_token);
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.shared.set_status(ReplicaStatus::Connecting);

            let credential = match token.take() {
                Some(credential) => credential,
                None => match self.credentials.collaboration_token().await {
                    Ok(credential) => credential,
                    Err(err @ (ApiError::SessionExpired | ApiError::NotAuthenticated)) => {
                        self.shared.set_status(ReplicaStatus::Disconnected { reason: err.to_string() });
                        break;
                    }
                    Err(err) => {
                        self.shared.set_status(ReplicaStatus::Disconnected { reason: err.to_string() });
                        if !self.back_off(&mut failures, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let channel = match self.connector.connect(&self.document, &credential).await {
                Ok(channel) => channel,
                Err(err @ ConnectError::InvalidUrl(_)) => {
                    self.shared.set_status(ReplicaStatus::Disconnected { reason: err.to_string() });
                    break;
                }
                Err(err) => {
                    warn!(document = %self.document, error = %err, "relay connection failed");
                    self.shared.set_status(ReplicaStatus::Disconnected { reason: err.to_string() });
                    if !self.back_off(&mut failures, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let end = self.run_session(channel, &mut shutdown).await;
            self.forget_remote_peers();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Closed { code, reason, synced } => {
                    let parsed = reason
                        .parse::<CloseReason>()
                        .ok()
                        .or_else(|| CloseReason::from_close_code(code));
                    if let Some(rejection) = parsed.filter(|reason| reason.is_auth_rejection()) {
                        info!(document = %self.document, reason = %rejection, "relay rejected replica");
                        self.shared.set_status(ReplicaStatus::Rejected { reason: rejection });
                        break;
                    }
                    if synced {
                        failures = 0;
                    }
                    let reason = parsed.map(|r| r.to_string()).unwrap_or(reason);
                    info!(document = %self.document, code, %reason, "relay connection closed");
                    self.shared.set_status(ReplicaStatus::Disconnected { reason });
                    if !self.back_off(&mut failures, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if !matches!(
            *self.shared.status.borrow(),
            ReplicaStatus::Rejected { .. } | ReplicaStatus::Disconnected { .. }
        ) {
            self.shared.set_status(ReplicaStatus::Disconnected { reason: "closed".to_string() });
        }
        debug!(document = %self.document, "replica loop stopped");
    }

    /// Sleep before the next attempt. False when retries are exhausted or
    /// the replica is shutting down.
    async fn back_off(&self, failures: &mut u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.policy.delay_for(*failures);
        *failures = failures.saturating_add(1);
        if !self.policy.should_retry(*failures) {
            return false;
        }
        let slept = tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.wait_for(|stopped| *stopped) => false,
        };
        slept && !*shutdown.borrow()
    }

    async fn run_session(
        &self,
        channel: FrameChannel,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let FrameChannel { outbound, mut inbound } = channel;

        let hello = {
            let awareness = self.shared.awareness.lock().expect("replica awareness lock poisoned");
            let state_vector = awareness.doc().transact().state_vector();
            let mut frames = vec![Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()];
            match awareness.update() {
                Ok(update) => frames.push(Message::Awareness(update).encode_v1()),
                Err(err) => warn!(document = %self.document, error = %err, "failed to encode local awareness"),
            }
            frames
        };
        for frame in hello {
            if outbound.send(frame).is_err() {
                return SessionEnd::Closed {
                    code: ABNORMAL_CLOSE,
                    reason: "connection lost".to_string(),
                    synced: false,
                };
            }
        }
        *self.shared.outbound.lock().expect("replica outbound lock poisoned") = Some(outbound);

        let mut synced = false;
        let end = loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => break SessionEnd::Shutdown,
                frame = inbound.recv() => match frame {
                    Some(RelayFrame::Binary(payload)) => {
                        match self.apply_frame(&payload) {
                            Ok(reached_sync) => {
                                if reached_sync && !synced {
                                    synced = true;
                                    info!(document = %self.document, "replica synced");
                                    self.shared.set_status(ReplicaStatus::Synced);
                                }
                            }
                            Err(err) => warn!(document = %self.document, error = %err, "dropping bad relay frame"),
                        }
                    }
                    Some(RelayFrame::Closed { code, reason }) => {
                        break SessionEnd::Closed { code, reason, synced };
                    }
                    None => {
                        break SessionEnd::Closed {
                            code: ABNORMAL_CLOSE,
                            reason: "connection lost".to_string(),
                            synced,
                        };
                    }
                },
            }
        };

        // Dropping the last sender closes the socket.
        self.shared.outbound.lock().expect("replica outbound lock poisoned").take();
        end
    }

    /// Apply one relay frame. Returns true when it carried a SyncStep2.
    fn apply_frame(&self, payload: &[u8]) -> Result<bool, String> {
        let protocol = DefaultProtocol;
        let messages = decode_messages(payload)?;
        let awareness = self.shared.awareness.lock().expect("replica awareness lock poisoned");
        let mut replies = Vec::new();
        let mut reached_sync = false;
        let mut doc_changed = false;
        let mut roster_changed = false;

        for message in messages {
            match message {
                Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                    if let Some(reply) = protocol
                        .handle_sync_step1(&awareness, state_vector)
                        .map_err(|err| err.to_string())?
                    {
                        replies.push(reply.encode_v1());
                    }
                }
                Message::Sync(SyncMessage::SyncStep2(update)) => {
                    let update = Update::decode_v1(&update).map_err(|err| err.to_string())?;
                    protocol.handle_sync_step2(&awareness, update).map_err(|err| err.to_string())?;
                    reached_sync = true;
                    doc_changed = true;
                }
                Message::Sync(SyncMessage::Update(update)) => {
                    let update = Update::decode_v1(&update).map_err(|err| err.to_string())?;
                    protocol.handle_update(&awareness, update).map_err(|err| err.to_string())?;
                    doc_changed = true;
                }
                Message::Awareness(update) => {
                    awareness.apply_update_summary(update).map_err(|err| err.to_string())?;
                    roster_changed = true;
                }
                other => {
                    if let Some(reply) =
                        protocol.handle_message(&awareness, other).map_err(|err| err.to_string())?
                    {
                        replies.push(reply.encode_v1());
                    }
                }
            }
        }

        if roster_changed {
            self.shared.publish_presence(&awareness);
        }
        drop(awareness);

        if doc_changed {
            self.shared.revision.send_modify(|revision| *revision += 1);
        }
        for reply in replies {
            // A closed outbound surfaces as a Closed frame on the next recv.
            let _ = self.shared.send(reply);
        }
        Ok(reached_sync)
    }

    /// Remote awareness entries belong to the old connection's session.
    fn forget_remote_peers(&self) {
        let awareness = self.shared.awareness.lock().expect("replica awareness lock poisoned");
        let local = awareness.client_id();
        let remote: Vec<u64> =
            awareness.iter().map(|(client_id, _)| client_id).filter(|id| *id != local).collect();
        for client_id in remote {
            awareness.remove_state(client_id);
        }
        self.shared.publish_presence(&awareness);
    }
}

fn decode_messages(payload: &[u8]) -> Result<Vec<Message>, String> {
    let mut decoder = DecoderV1::new(Cursor::new(payload));
    let mut reader = MessageReader::new(&mut decoder);
    let mut messages = Vec::new();
    while let Some(next) = reader.next() {
        messages.push(next.map_err(|err| err.to_string())?);
    }
    Ok(messages)
}

// ── Manager ─────────────────────────────────────────────────────────

/// Keeps at most one live replica: the note open in the editor.
pub struct ReplicaManager {
    connector: Arc<dyn RelayConnector>,
    credentials: Arc<dyn CredentialSource>,
    policy: ReconnectPolicy,
    active: tokio::sync::Mutex<Option<ReplicaHandle>>,
}

impl ReplicaManager {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        credentials: Arc<dyn CredentialSource>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self { connector, credentials, policy, active: tokio::sync::Mutex::new(None) }
    }

    /// Open `note_id` for collaborative editing. Re-opening the live note
    /// returns the same handle; any other replica is torn down first.
    pub async fn open(&self, note_id: Uuid, user: AwarenessUser) -> Collaboration {
        let mut active = self.active.lock().await;

        if let Some(handle) = active.as_ref() {
            let rejected = matches!(handle.current_status(), ReplicaStatus::Rejected { .. });
            if handle.note_id() == note_id && !rejected && !handle.is_finished() {
                return Collaboration::Enabled(handle.clone());
            }
        }
        if let Some(previous) = active.take() {
            debug!(note_id = %previous.note_id(), "tearing down previous replica");
            previous.shutdown().await;
        }

        let token = match self.credentials.collaboration_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(%note_id, error = %err, "collaboration disabled: no relay credential");
                return Collaboration::Disabled { reason: err.to_string() };
            }
        };

        match ReplicaHandle::spawn(
            note_id,
            user,
            token,
            Arc::clone(&self.connector),
            Arc::clone(&self.credentials),
            self.policy.clone(),
        ) {
            Ok(handle) => {
                *active = Some(handle.clone());
                Collaboration::Enabled(handle)
            }
            Err(err) => Collaboration::Disabled { reason: err.to_string() },
        }
    }

    pub async fn active(&self) -> Option<ReplicaHandle> {
        self.active.lock().await.clone()
    }

    /// Tear down the replica for `note_id` if it is the live one.
    pub async fn close(&self, note_id: Uuid) -> bool {
        let mut active = self.active.lock().await;
        if active.as_ref().map(ReplicaHandle::note_id) != Some(note_id) {
            return false;
        }
        if let Some(handle) = active.take() {
            handle.shutdown().await;
        }
        true
    }

    pub async fn close_all(&self) {
        if let Some(handle) = self.active.lock().await.take() {
            handle.shutdown().await;
        }
    }
}
