// Core note domain types shared by the relay and the client.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub const TEMP_ID_PREFIX: &str = "temp-";

static TEMP_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifier of a note: server-assigned, or a temporary client id for a
/// note whose create call has not completed yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NoteId {
    Temp(String),
    Server(Uuid),
}

impl NoteId {
    /// Mint a fresh temporary id (`temp-<millis>-<seq>`).
    pub fn new_temp() -> Self {
        let millis = Utc::now().timestamp_millis();
        let seq = TEMP_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        Self::Temp(format!("{TEMP_ID_PREFIX}{millis}-{seq}"))
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            Self::Server(id) => Some(*id),
            Self::Temp(_) => None,
        }
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temp(raw) => f.write_str(raw),
            Self::Server(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for NoteId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match Uuid::parse_str(s) {
            Ok(id) => Self::Server(id),
            Err(_) => Self::Temp(s.to_string()),
        })
    }
}

impl From<Uuid> for NoteId {
    fn from(id: Uuid) -> Self {
        Self::Server(id)
    }
}

impl Serialize for NoteId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_else(|never: std::convert::Infallible| match never {}))
    }
}

/// A user a note is shared with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collaborator {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A note as held by the local cache. The wire shape matches the notes
/// store's JSON; `sync_error` only ever exists locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "archiveFlag")]
    pub archived: bool,
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Collaborator>,
    #[serde(default, rename = "sharedWith")]
    pub collaborators: Vec<Collaborator>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(skip)]
    pub sync_error: Option<String>,
}

impl Note {
    /// A local note built from a draft, keyed by `id`.
    pub fn from_draft(id: NoteId, draft: NoteDraft) -> Self {
        Self {
            id,
            title: draft.title,
            content: draft.content,
            tags: normalize_tags(draft.tags),
            archived: draft.archived,
            owner_id: None,
            owner: None,
            collaborators: Vec::new(),
            created_at: Some(Utc::now().naive_utc()),
            sync_error: None,
        }
    }

    pub fn is_shared(&self) -> bool {
        !self.collaborators.is_empty()
    }

    /// The request body that would persist this note's editable fields.
    pub fn draft(&self) -> NoteDraft {
        NoteDraft {
            title: self.title.clone(),
            content: self.content.clone(),
            tags: self.tags.clone(),
            archived: self.archived,
        }
    }

    /// Whether the editable fields of two copies agree.
    pub fn same_fields(&self, other: &Note) -> bool {
        self.draft() == other.draft()
    }
}

/// Create/update request body for the notes store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoteDraft {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "archiveFlag")]
    pub archived: bool,
}

/// Trim, drop empties and duplicates while keeping first-seen order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.is_empty() || out.iter().any(|t| t == tag) {
            continue;
        }
        out.push(tag.to_string());
    }
    out
}
