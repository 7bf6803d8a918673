// Connection Authorizer: token shape, document name, then the store check.

pub mod token;
pub mod verifier;

use notesync_common::document::DocumentName;

use crate::audit::{self, AuditEvent};
use crate::error::AuthError;

pub use token::check_token_shape;
pub use verifier::{AccessVerifier, Identity};

/// Validate and authorize one inbound connection. Emits one audit event
/// either way.
pub async fn authorize_connection(
    verifier: &AccessVerifier,
    token: Option<&str>,
    document: &str,
) -> Result<(DocumentName, Identity), AuthError> {
    let result = check_and_verify(verifier, token, document).await;
    match &result {
        Ok((name, identity)) => audit::emit(AuditEvent::auth_succeeded(name.note_id(), &identity.email)),
        Err(err) => {
            let note_id = document.parse::<DocumentName>().ok().map(|name| name.note_id());
            audit::emit(AuditEvent::auth_failed(note_id, err.reason, err.message.clone()));
        }
    }
    result
}

async fn check_and_verify(
    verifier: &AccessVerifier,
    token: Option<&str>,
    document: &str,
) -> Result<(DocumentName, Identity), AuthError> {
    let token = check_token_shape(token)?;
    let name: DocumentName = document
        .parse()
        .map_err(|err: notesync_common::document::DocumentNameError| {
            AuthError::new(err.close_reason(), err.to_string())
        })?;
    let identity = verifier.authorize(token, &name).await?;
    Ok((name, identity))
}
