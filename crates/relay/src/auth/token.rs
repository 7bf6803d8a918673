// Bearer credential shape checks done before any call to the notes store.
//
// The relay never validates signatures itself; it only refuses credentials
// that cannot possibly be a signed three-segment token.

use std::sync::OnceLock;

use notesync_common::protocol::CloseReason;
use regex::Regex;

use crate::error::AuthError;

fn token_shape() -> &'static Regex {
    static TOKEN_SHAPE: OnceLock<Regex> = OnceLock::new();
    TOKEN_SHAPE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+$")
            .expect("token shape regex is valid")
    })
}

/// Returns the trimmed token when it looks like a signed JWT.
pub fn check_token_shape(token: Option<&str>) -> Result<&str, AuthError> {
    let Some(token) = token else {
        return Err(AuthError::new(CloseReason::AuthTokenRequired, "authentication token required"));
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::new(CloseReason::InvalidToken, "authentication token is empty"));
    }
    if !token_shape().is_match(token) {
        return Err(AuthError::new(
            CloseReason::InvalidTokenFormat,
            "token must have three base64url segments",
        ));
    }
    jsonwebtoken::decode_header(token).map_err(|err| {
        AuthError::new(CloseReason::InvalidTokenFormat, format!("token header is not a JWT header: {err}"))
    })?;
    Ok(token)
}
