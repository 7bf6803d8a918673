// Replicas talking to a real relay over loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notesync_client::api::{ApiError, CredentialSource};
use notesync_client::config::ReconnectPolicy;
use notesync_client::replica::{Collaboration, ReplicaError, ReplicaHandle, ReplicaManager, WsConnector};
use notesync_common::awareness::AwarenessUser;
use notesync_common::protocol::CloseReason;
use notesync_relay::app;
use notesync_relay::auth::{AccessVerifier, Identity};
use notesync_relay::ws::RelayState;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;
use uuid::Uuid;
use yrs::Text;

const ANN_TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJhbm4ifQ.c2ln";
const BOB_TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJib2IifQ.c2ln";

struct StaticToken(&'static str);

#[async_trait]
impl CredentialSource for StaticToken {
    async fn collaboration_token(&self) -> Result<String, ApiError> {
        Ok(self.0.to_string())
    }
}

struct Relay {
    url: Url,
    state: RelayState,
    stop: Option<oneshot::Sender<()>>,
}

impl Relay {
    async fn start() -> Self {
        let state = RelayState::new(AccessVerifier::memory());
        let relay_listener = TcpListener::bind("127.0.0.1:0").await.expect("relay should bind");
        let health_listener = TcpListener::bind("127.0.0.1:0").await.expect("health should bind");
        let url = Url::parse(&format!("ws://{}", relay_listener.local_addr().unwrap())).unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(app::serve(
            relay_listener,
            health_listener,
            state.clone(),
            Duration::from_millis(200),
            async move {
                let _ = stopped.await;
            },
        ));
        Self { url, state, stop: Some(stop) }
    }

    async fn grant_all(&self, token: &str, email: &str, name: &str) {
        let memory = self.state.verifier.as_memory().expect("memory verifier");
        memory.grant_all(token, Identity::new(email, name)).await;
    }

    async fn grant(&self, token: &str, email: &str, name: &str, note: Uuid) {
        let memory = self.state.verifier.as_memory().expect("memory verifier");
        memory.grant(token, Identity::new(email, name), note).await;
    }

    fn manager(&self, token: &'static str) -> ReplicaManager {
        ReplicaManager::new(
            Arc::new(WsConnector::new(self.url.clone())),
            Arc::new(StaticToken(token)),
            ReconnectPolicy { base_delay_ms: 20, max_delay_ms: 200, max_attempts: u32::MAX },
        )
    }

    async fn wait_for_sessions(&self, wanted: impl Fn(&[Uuid]) -> bool) {
        for _ in 0..100 {
            let live: Vec<Uuid> =
                self.state.registry.summaries().await.into_iter().map(|s| s.note_id).collect();
            if wanted(&live) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("relay sessions never reached the expected state");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn user(name: &str, email: &str) -> AwarenessUser {
    AwarenessUser {
        name: Some(name.to_string()),
        email: Some(email.to_string()),
        color: Some("#46c02c".to_string()),
    }
}

async fn open_synced(manager: &ReplicaManager, note: Uuid, who: AwarenessUser) -> ReplicaHandle {
    let handle = match manager.open(note, who).await {
        Collaboration::Enabled(handle) => handle,
        Collaboration::Disabled { reason } => panic!("collaboration disabled: {reason}"),
    };
    handle.wait_synced(Duration::from_secs(5)).await.expect("replica should sync with the relay");
    handle
}

async fn wait_for_text(handle: &ReplicaHandle, expected: &str) {
    let mut revisions = handle.revisions();
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while handle.text() != expected {
            if revisions.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "text should converge to {expected:?}, got {:?}", handle.text());
}

#[tokio::test]
async fn two_replicas_converge_through_the_relay() {
    let relay = Relay::start().await;
    relay.grant_all(ANN_TOKEN, "ann@example.com", "Ann").await;
    relay.grant_all(BOB_TOKEN, "bob@example.com", "Bob").await;
    let note = Uuid::new_v4();

    let ann = relay.manager(ANN_TOKEN);
    let bob = relay.manager(BOB_TOKEN);
    let ann_doc = open_synced(&ann, note, user("Ann", "ann@example.com")).await;
    let bob_doc = open_synced(&bob, note, user("Bob", "bob@example.com")).await;

    ann_doc.edit(|text, txn| text.insert(txn, 0, "hello")).expect("ann should edit");
    wait_for_text(&bob_doc, "hello").await;

    bob_doc.edit(|text, txn| text.push(txn, " world")).expect("bob should edit");
    wait_for_text(&ann_doc, "hello world").await;

    let mut presence = ann_doc.presence();
    let roster = tokio::time::timeout(Duration::from_secs(5), presence.wait_for(|r| r.len() == 2))
        .await
        .expect("bob should show up in ann's roster")
        .unwrap()
        .clone();
    let peers = roster.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].name(), "Bob");

    ann.close_all().await;
    bob.close_all().await;
    relay.wait_for_sessions(|live| live.is_empty()).await;
}

#[tokio::test]
async fn late_joiner_receives_existing_content() {
    let relay = Relay::start().await;
    relay.grant_all(ANN_TOKEN, "ann@example.com", "Ann").await;
    relay.grant_all(BOB_TOKEN, "bob@example.com", "Bob").await;
    let note = Uuid::new_v4();

    let ann = relay.manager(ANN_TOKEN);
    let ann_doc = open_synced(&ann, note, user("Ann", "ann@example.com")).await;
    ann_doc.edit(|text, txn| text.insert(txn, 0, "draft")).unwrap();
    // Let the update reach the relay before Bob's handshake.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bob = relay.manager(BOB_TOKEN);
    let bob_doc = open_synced(&bob, note, user("Bob", "bob@example.com")).await;
    wait_for_text(&bob_doc, "draft").await;
}

#[tokio::test]
async fn unshared_note_is_rejected_without_retry() {
    let relay = Relay::start().await;
    let shared = Uuid::new_v4();
    relay.grant(BOB_TOKEN, "bob@example.com", "Bob", shared).await;

    let bob = relay.manager(BOB_TOKEN);
    let other = Uuid::new_v4();
    let handle = match bob.open(other, user("Bob", "bob@example.com")).await {
        Collaboration::Enabled(handle) => handle,
        Collaboration::Disabled { reason } => panic!("credential was available: {reason}"),
    };

    let waited = handle.wait_synced(Duration::from_secs(5)).await;
    assert_eq!(waited, Err(ReplicaError::Rejected(CloseReason::Unauthorized)));
    assert!(!relay.state.registry.contains(other).await);

    // The shared note still works for the same credential.
    open_synced(&bob, shared, user("Bob", "bob@example.com")).await;
}

#[tokio::test]
async fn switching_notes_leaves_the_old_session() {
    let relay = Relay::start().await;
    relay.grant_all(ANN_TOKEN, "ann@example.com", "Ann").await;
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    let ann = relay.manager(ANN_TOKEN);
    open_synced(&ann, first, user("Ann", "ann@example.com")).await;
    relay.wait_for_sessions(|live| live == [first]).await;

    open_synced(&ann, second, user("Ann", "ann@example.com")).await;
    relay.wait_for_sessions(|live| live == [second]).await;
}
