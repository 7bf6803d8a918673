// Presence Broadcaster: roster snapshots derived from the awareness map.

use notesync_common::awareness::{AwarenessState, AwarenessUser, CursorState};
use notesync_common::types::{Collaborator, Note};
use rand::Rng;
use yrs::sync::Awareness;

/// Dot color for collaborators that are not connected.
pub const OFFLINE_COLOR: &str = "#d3d3d3";
/// Dot color for connected collaborators that publish none.
pub const ONLINE_FALLBACK_COLOR: &str = "#808080";

const COLOR_SPACE: i64 = 16_777_215;

/// Stable color for a user, derived from their email. Users without an
/// email get a random one.
pub fn user_color(email: Option<&str>) -> String {
    let Some(email) = email.filter(|email| !email.is_empty()) else {
        let random: i64 = rand::thread_rng().gen_range(0..COLOR_SPACE);
        return format!("#{random:06x}");
    };

    let mut hash: i64 = 0;
    for unit in email.encode_utf16() {
        let shifted = i64::from((hash as i32).wrapping_shl(5));
        hash = i64::from(unit) + (shifted - hash);
    }
    format!("#{:06x}", hash.abs() % COLOR_SPACE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePeer {
    pub client_id: u64,
    pub user: AwarenessUser,
    pub cursor: Option<CursorState>,
}

impl PresencePeer {
    pub fn name(&self) -> &str {
        self.user.display_name()
    }

    pub fn color(&self) -> &str {
        self.user.display_color()
    }
}

/// One row of the collaborator list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorStatus {
    pub id: i64,
    pub email: String,
    pub name: String,
    pub is_owner: bool,
    pub online: bool,
    pub color: String,
}

/// Immutable snapshot of everyone present in one session, sorted by
/// client id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRoster {
    local_client_id: u64,
    entries: Vec<PresencePeer>,
}

impl PresenceRoster {
    pub fn new(local_client_id: u64, mut entries: Vec<PresencePeer>) -> Self {
        entries.sort_by_key(|peer| peer.client_id);
        Self { local_client_id, entries }
    }

    /// Snapshot of every client that published a `user`.
    pub fn from_awareness(awareness: &Awareness) -> Self {
        let entries = awareness
            .iter()
            .filter_map(|(client_id, state)| {
                let raw = state.data?;
                let parsed: AwarenessState = serde_json::from_str(raw.as_ref()).ok()?;
                Some(PresencePeer { client_id, user: parsed.user?, cursor: parsed.cursor })
            })
            .collect();
        Self::new(awareness.client_id(), entries)
    }

    pub fn local_client_id(&self) -> u64 {
        self.local_client_id
    }

    /// Everyone including ourselves.
    pub fn entries(&self) -> &[PresencePeer] {
        &self.entries
    }

    /// Everyone but ourselves, for the cursor indicator.
    pub fn peers(&self) -> Vec<&PresencePeer> {
        self.entries.iter().filter(|peer| peer.client_id != self.local_client_id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn online(&self, email: &str) -> Option<&PresencePeer> {
        self.entries.iter().find(|peer| peer.user.email.as_deref() == Some(email))
    }

    /// Owner first, then the people the note is shared with, minus the
    /// current user. Online state is matched by email.
    pub fn collaborators(&self, note: &Note, current_email: &str) -> Vec<CollaboratorStatus> {
        let owner = note.owner.iter().map(|owner| (owner, true));
        let shared = note.collaborators.iter().map(|collaborator| (collaborator, false));

        owner
            .chain(shared)
            .filter(|(person, _)| person.email != current_email)
            .map(|(person, is_owner)| self.status(person, is_owner))
            .collect()
    }

    fn status(&self, person: &Collaborator, is_owner: bool) -> CollaboratorStatus {
        let live = self.online(&person.email);
        let name = person
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| person.email.clone());
        let color = match live {
            Some(peer) => peer
                .user
                .color
                .clone()
                .filter(|color| !color.is_empty())
                .unwrap_or_else(|| ONLINE_FALLBACK_COLOR.to_string()),
            None => OFFLINE_COLOR.to_string(),
        };
        CollaboratorStatus {
            id: person.id,
            email: person.email.clone(),
            name,
            is_owner,
            online: live.is_some(),
            color,
        }
    }
}
