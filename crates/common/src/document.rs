// Collaboration document names: `note-<uuid>`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::CloseReason;

pub const DOCUMENT_PREFIX: &str = "note-";

/// Name of the shared document a relay connection is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentName {
    note_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentNameError {
    #[error("document name must start with `{DOCUMENT_PREFIX}`")]
    MissingPrefix,
    #[error("document name has no note id after `{DOCUMENT_PREFIX}`")]
    MissingId,
    #[error("note id `{0}` is not a valid identifier")]
    InvalidNoteId(String),
}

impl DocumentNameError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::MissingPrefix => CloseReason::InvalidDocumentName,
            Self::MissingId => CloseReason::InvalidDocumentFormat,
            Self::InvalidNoteId(_) => CloseReason::InvalidNoteId,
        }
    }
}

impl DocumentName {
    pub fn for_note(note_id: Uuid) -> Self {
        Self { note_id }
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DOCUMENT_PREFIX}{}", self.note_id)
    }
}

impl FromStr for DocumentName {
    type Err = DocumentNameError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw.strip_prefix(DOCUMENT_PREFIX).ok_or(DocumentNameError::MissingPrefix)?;
        if rest.is_empty() {
            return Err(DocumentNameError::MissingId);
        }
        let note_id =
            Uuid::parse_str(rest).map_err(|_| DocumentNameError::InvalidNoteId(rest.to_string()))?;
        Ok(Self { note_id })
    }
}
