// Awareness payload published by every client in a session.

use serde::{Deserialize, Serialize};

pub const ANONYMOUS_NAME: &str = "Anonymous";
pub const DEFAULT_PEER_COLOR: &str = "#000000";

/// Identity shown to peers. Published under the `user` field of the
/// awareness state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwarenessUser {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl AwarenessUser {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.is_empty()).unwrap_or(ANONYMOUS_NAME)
    }

    pub fn display_color(&self) -> &str {
        self.color.as_deref().filter(|c| !c.is_empty()).unwrap_or(DEFAULT_PEER_COLOR)
    }
}

/// Text selection inside the shared document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorState {
    pub anchor: u32,
    pub head: u32,
}

/// Full awareness state of one client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AwarenessState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<AwarenessUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
}
