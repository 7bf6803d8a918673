// Authenticated client session.
//
// Holds the long-lived bearer credential and the signed-in user's profile.
// Any call that comes back 401 expires the session; the host listens for
// `SessionEvent::Expired` and sends the user back to sign-in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use notesync_common::awareness::AwarenessUser;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::presence::user_color;

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl UserProfile {
    /// The awareness identity this user publishes to peers.
    pub fn awareness_user(&self) -> AwarenessUser {
        let name = self.username.clone().filter(|name| !name.is_empty()).unwrap_or_else(|| self.email.clone());
        let color = self.color.clone().unwrap_or_else(|| user_color(Some(&self.email)));
        AwarenessUser { name: Some(name), email: Some(self.email.clone()), color: Some(color) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { email: String },
    Expired,
}

#[derive(Debug, Clone)]
struct Credentials {
    token: String,
    user: UserProfile,
}

pub struct AuthSession {
    credentials: RwLock<Option<Credentials>>,
    expired: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { credentials: RwLock::new(None), expired: AtomicBool::new(false), events }
    }

    /// Install a credential. Re-arms the expiry notification.
    pub fn sign_in(&self, token: impl Into<String>, user: UserProfile) {
        let email = user.email.clone();
        *self.credentials.write().expect("session lock poisoned") =
            Some(Credentials { token: token.into(), user });
        self.expired.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::SignedIn { email });
    }

    pub fn token(&self) -> Option<String> {
        self.credentials.read().expect("session lock poisoned").as_ref().map(|c| c.token.clone())
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.credentials.read().expect("session lock poisoned").as_ref().map(|c| c.user.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.read().expect("session lock poisoned").is_some()
    }

    /// Drop the credential without announcing an expiry (user sign-out).
    pub fn clear(&self) {
        *self.credentials.write().expect("session lock poisoned") = None;
    }

    /// Drop the credential after a 401. Returns true for the call that
    /// actually announced the expiry; later calls are silent until the next
    /// [`sign_in`](Self::sign_in).
    pub fn expire(&self) -> bool {
        self.clear();
        if self.expired.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("session expired, re-authentication required");
        let _ = self.events.send(SessionEvent::Expired);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
