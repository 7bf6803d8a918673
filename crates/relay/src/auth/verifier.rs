// Access checks against the notes store.
//
// `AccessVerifier` follows the store-enum layout: the HTTP variant talks to
// the real store, the memory variant answers from a grant table for local
// runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use notesync_common::document::DocumentName;
use notesync_common::protocol::verify::{VerifyRequest, VerifyResponse, VERIFY_PATH};
use notesync_common::protocol::CloseReason;
use serde::Serialize;
use tokio::sync::RwLock;
use url::Url;
use uuid::Uuid;

use crate::error::AuthError;

pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(100);
pub const BACKEND_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const BACKEND_PROBE_PATH: &str = "/actuator/health";

/// Identity resolved by a successful access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(email: &str, name: &str) -> Self {
        Self { id: email.to_string(), name: name.to_string(), email: email.to_string() }
    }
}

pub enum AccessVerifier {
    Http(HttpVerifier),
    Memory(MemoryVerifier),
}

impl AccessVerifier {
    pub fn http(backend_url: &Url, timeout: Duration, retries: u32) -> Result<Self, reqwest::Error> {
        HttpVerifier::new(backend_url, timeout, retries).map(Self::Http)
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryVerifier::default())
    }

    pub fn as_memory(&self) -> Option<&MemoryVerifier> {
        match self {
            Self::Memory(memory) => Some(memory),
            Self::Http(_) => None,
        }
    }

    /// Ask the store whether `token` may open `document`. Holds no relay
    /// lock; the caller attaches only after this returns.
    pub async fn authorize(&self, token: &str, document: &DocumentName) -> Result<Identity, AuthError> {
        match self {
            Self::Http(http) => http.authorize(token, document.note_id()).await,
            Self::Memory(memory) => memory.authorize(token, document.note_id()).await,
        }
    }
}

pub struct HttpVerifier {
    client: reqwest::Client,
    verify_url: Url,
    retries: u32,
    retry_base: Duration,
}

impl HttpVerifier {
    pub fn new(backend_url: &Url, timeout: Duration, retries: u32) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            verify_url: join_backend_path(backend_url, VERIFY_PATH),
            retries,
            retry_base: DEFAULT_RETRY_BASE,
        })
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    pub async fn authorize(&self, token: &str, note_id: Uuid) -> Result<Identity, AuthError> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(token, note_id).await {
                Ok(identity) => return Ok(identity),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    let delay = self.retry_base.saturating_mul(2u32.saturating_pow(attempt));
                    tracing::warn!(
                        note_id = %note_id,
                        attempt = attempt + 1,
                        reason = err.reason.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "access check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, token: &str, note_id: Uuid) -> Result<Identity, AuthError> {
        let response = self
            .client
            .post(self.verify_url.clone())
            .bearer_auth(token)
            .json(&VerifyRequest { note_id })
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::new(CloseReason::Unauthorized, format!("store answered {status}")));
        }
        if status.is_server_error() {
            return Err(AuthError::new(CloseReason::BackendError, format!("store answered {status}")));
        }
        if !status.is_success() {
            return Err(AuthError::new(
                CloseReason::AuthenticationFailed,
                format!("store answered {status}"),
            ));
        }

        let body: VerifyResponse = response.json().await.map_err(|err| {
            AuthError::new(CloseReason::BackendInvalidResponse, format!("unreadable verify body: {err}"))
        })?;
        identity_from_response(body)
    }
}

/// Map a verify body to an identity or a definitive rejection.
pub fn identity_from_response(body: VerifyResponse) -> Result<Identity, AuthError> {
    match body.decision() {
        None => Err(AuthError::new(
            CloseReason::BackendInvalidResponse,
            "verify response has no boolean `allowed`",
        )),
        Some(false) => Err(AuthError::new(CloseReason::Unauthorized, "access denied by store")),
        Some(true) => {
            let email = body.email.filter(|e| !e.trim().is_empty()).ok_or_else(|| {
                AuthError::new(CloseReason::BackendInvalidResponse, "verify response has no email")
            })?;
            let name = body.username.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| email.clone());
            Ok(Identity::new(&email, &name))
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::new(CloseReason::BackendTimeout, format!("store did not answer in time: {err}"))
    } else {
        AuthError::new(CloseReason::BackendUnavailable, format!("store unreachable: {err}"))
    }
}

fn join_backend_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url
}

#[derive(Debug, Clone)]
struct MemoryGrant {
    identity: Identity,
    notes: Option<HashSet<Uuid>>,
}

/// Grant table keyed by token. Unknown tokens are unauthorized.
#[derive(Default)]
pub struct MemoryVerifier {
    grants: RwLock<HashMap<String, MemoryGrant>>,
    failure: RwLock<Option<CloseReason>>,
    calls: AtomicU64,
}

impl MemoryVerifier {
    /// Allow `token` on a single note.
    pub async fn grant(&self, token: &str, identity: Identity, note_id: Uuid) {
        let mut grants = self.grants.write().await;
        let entry = grants
            .entry(token.to_string())
            .or_insert_with(|| MemoryGrant { identity: identity.clone(), notes: Some(HashSet::new()) });
        entry.identity = identity;
        if let Some(notes) = entry.notes.as_mut() {
            notes.insert(note_id);
        }
    }

    /// Allow `token` on every note.
    pub async fn grant_all(&self, token: &str, identity: Identity) {
        self.grants
            .write()
            .await
            .insert(token.to_string(), MemoryGrant { identity, notes: None });
    }

    pub async fn revoke(&self, token: &str) {
        self.grants.write().await.remove(token);
    }

    /// Make every check fail with `reason` until cleared.
    pub async fn fail_with(&self, reason: Option<CloseReason>) {
        *self.failure.write().await = reason;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn authorize(&self, token: &str, note_id: Uuid) -> Result<Identity, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = *self.failure.read().await {
            return Err(AuthError::new(reason, "injected failure"));
        }
        let grants = self.grants.read().await;
        let grant = grants
            .get(token)
            .ok_or_else(|| AuthError::new(CloseReason::Unauthorized, "unknown token"))?;
        match &grant.notes {
            Some(notes) if !notes.contains(&note_id) => {
                Err(AuthError::new(CloseReason::Unauthorized, "note not shared with caller"))
            }
            _ => Ok(grant.identity.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendProbe {
    Reachable(u16),
    Unhealthy(u16),
    Unreachable(String),
}

/// Startup connectivity check: any answer below 500 counts as reachable.
pub async fn probe_backend(backend_url: &Url, timeout: Duration) -> BackendProbe {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => return BackendProbe::Unreachable(err.to_string()),
    };
    match client.get(join_backend_path(backend_url, BACKEND_PROBE_PATH)).send().await {
        Ok(response) if response.status().as_u16() < 500 => {
            BackendProbe::Reachable(response.status().as_u16())
        }
        Ok(response) => BackendProbe::Unhealthy(response.status().as_u16()),
        Err(err) => BackendProbe::Unreachable(err.to_string()),
    }
}
