// Structured audit events for connection authorization and session lifecycle.
//
// Events go to the `notesync_relay::audit` tracing target and feed the
// relay counters. Bearer credentials are never part of an event.

use notesync_common::protocol::CloseReason;
use uuid::Uuid;

use crate::error::current_request_id;
use crate::metrics::{global_metrics, RelayMetrics};

pub const AUDIT_TARGET: &str = "notesync_relay::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    AuthSucceeded,
    AuthFailed,
    SessionCreated,
    SessionDestroyed,
}

impl AuditEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthSucceeded => "auth_succeeded",
            Self::AuthFailed => "auth_failed",
            Self::SessionCreated => "session_created",
            Self::SessionDestroyed => "session_destroyed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub note_id: Option<Uuid>,
    pub actor_email: Option<String>,
    pub reason: Option<CloseReason>,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn auth_succeeded(note_id: Uuid, email: &str) -> Self {
        Self {
            event_type: AuditEventType::AuthSucceeded,
            note_id: Some(note_id),
            actor_email: Some(email.to_string()),
            reason: None,
            detail: None,
        }
    }

    pub fn auth_failed(note_id: Option<Uuid>, reason: CloseReason, detail: impl Into<String>) -> Self {
        Self {
            event_type: AuditEventType::AuthFailed,
            note_id,
            actor_email: None,
            reason: Some(reason),
            detail: Some(detail.into()),
        }
    }

    pub fn session(event_type: AuditEventType, note_id: Uuid) -> Self {
        Self { event_type, note_id: Some(note_id), actor_email: None, reason: None, detail: None }
    }
}

/// Log the event and bump the process-wide counters.
pub fn emit(event: AuditEvent) {
    record(&global_metrics(), event);
}

pub fn record(metrics: &RelayMetrics, event: AuditEvent) {
    match event.event_type {
        AuditEventType::AuthSucceeded => metrics.record_auth_success(),
        AuditEventType::AuthFailed => {
            if let Some(reason) = event.reason {
                metrics.record_auth_failure(reason);
            }
        }
        AuditEventType::SessionCreated | AuditEventType::SessionDestroyed => {}
    }

    let request_id = current_request_id();
    let note_id = event.note_id.map(|id| id.to_string());
    let reason = event.reason.map(CloseReason::as_str);
    match event.event_type {
        AuditEventType::AuthFailed => tracing::warn!(
            target: AUDIT_TARGET,
            event = event.event_type.as_str(),
            request_id = request_id.as_deref(),
            note_id = note_id.as_deref(),
            reason,
            detail = event.detail.as_deref(),
            "connection authorization failed"
        ),
        _ => tracing::info!(
            target: AUDIT_TARGET,
            event = event.event_type.as_str(),
            request_id = request_id.as_deref(),
            note_id = note_id.as_deref(),
            user = event.actor_email.as_deref(),
            "audit"
        ),
    }
}
