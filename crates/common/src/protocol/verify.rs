// Collaboration access check: `POST /api/notes/collaboration/verify`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const VERIFY_PATH: &str = "/api/notes/collaboration/verify";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub note_id: Uuid,
}

/// Store decision. `allowed` is kept as raw JSON so a non-boolean value can
/// be reported as an invalid response instead of a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifyResponse {
    #[serde(default)]
    pub allowed: serde_json::Value,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl VerifyResponse {
    pub fn granted(email: &str, username: &str) -> Self {
        Self {
            allowed: serde_json::Value::Bool(true),
            email: Some(email.to_string()),
            username: Some(username.to_string()),
        }
    }

    pub fn denied() -> Self {
        Self { allowed: serde_json::Value::Bool(false), email: None, username: None }
    }

    /// `Some(decision)` when `allowed` is a JSON boolean.
    pub fn decision(&self) -> Option<bool> {
        self.allowed.as_bool()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case() {
        let id = Uuid::nil();
        let json = serde_json::to_value(VerifyRequest { note_id: id }).unwrap();
        assert_eq!(json, serde_json::json!({ "noteId": id.to_string() }));
    }

    #[test]
    fn non_boolean_allowed_has_no_decision() {
        let resp: VerifyResponse =
            serde_json::from_str(r#"{"allowed":"yes","email":"a@b.c"}"#).unwrap();
        assert_eq!(resp.decision(), None);

        let resp: VerifyResponse = serde_json::from_str(r#"{"email":"a@b.c"}"#).unwrap();
        assert_eq!(resp.decision(), None);
    }

    #[test]
    fn boolean_allowed_is_a_decision() {
        assert_eq!(VerifyResponse::granted("a@b.c", "ann").decision(), Some(true));
        assert_eq!(VerifyResponse::denied().decision(), Some(false));
    }
}
