// Pure cache state and the functions that mutate it. Nothing here awaits
// or talks to the network, so every transition can be tested directly.

use std::collections::{HashMap, HashSet};

use notesync_common::types::{normalize_tags, Note, NoteDraft, NoteId};
use uuid::Uuid;

/// Which slice of the list the sidebar shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    All,
    Archived,
}

/// One local change to a note's editable fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Content(String),
    Title(String),
    Tags(Vec<String>),
    Archived(bool),
}

/// The remote call a pending operation will make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create { temp_id: NoteId, draft: NoteDraft },
    /// The body is read from the cache when the save runs, so coalesced
    /// edits go out as one call.
    Save { id: Uuid, content_only: bool },
    Delete { id: Uuid },
}

/// How to undo a mutation locally when its remote call fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    /// Keep the draft, flag it so the user can retry or discard it.
    MarkCreateFailed { temp_id: NoteId },
    /// Put the pre-edit copy back verbatim.
    Restore { snapshot: Note },
    /// Undo a delete at the note's former position.
    Reinsert { note: Note, position: usize },
}

/// A mutation together with the state needed to reverse it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub mutation: Mutation,
    pub rollback: Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The temp entry now lives under the server id. `diverged` is set when
    /// local edits made during the create differ from what the store holds.
    Rekeyed { diverged: bool },
    /// The server id was already cached; the temp entry was dropped.
    Merged,
    /// The temp entry is gone (deleted or discarded meanwhile).
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheState {
    pub by_id: HashMap<NoteId, Note>,
    /// Most recently touched first.
    pub order: Vec<NoteId>,
    /// Ids matching the active search, `None` when no search is active.
    pub search_ids: Option<Vec<NoteId>>,
    pub current_id: Option<NoteId>,
    pub tags: Vec<String>,
    pub loading: bool,
    pub error: Option<String>,
}

impl CacheState {
    pub fn get(&self, id: &NoteId) -> Option<&Note> {
        self.by_id.get(id)
    }

    pub fn position(&self, id: &NoteId) -> Option<usize> {
        self.order.iter().position(|candidate| candidate == id)
    }

    pub fn current(&self) -> Option<&Note> {
        self.current_id.as_ref().and_then(|id| self.by_id.get(id))
    }

    pub fn notes(&self, view: View) -> Vec<Note> {
        let archived = view == View::Archived;
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|note| note.archived == archived)
            .cloned()
            .collect()
    }

    /// Search hits resolved against the cache; hits for notes that are not
    /// cached are skipped.
    pub fn search_results(&self) -> Vec<Note> {
        self.search_ids
            .iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }

    pub fn insert_front(&mut self, note: Note) {
        self.order.retain(|id| *id != note.id);
        self.order.insert(0, note.id.clone());
        self.by_id.insert(note.id.clone(), note);
    }

    fn touch(&mut self, id: &NoteId) {
        if let Some(position) = self.position(id) {
            let id = self.order.remove(position);
            self.order.insert(0, id);
        }
    }

    /// Apply an edit and move the note to the front. Returns the pre-edit
    /// copy, or `None` if the note is not cached.
    pub fn apply_edit(&mut self, id: &NoteId, edit: Edit) -> Option<Note> {
        let note = self.by_id.get_mut(id)?;
        let snapshot = note.clone();
        match edit {
            Edit::Content(content) => note.content = content,
            Edit::Title(title) => note.title = title,
            Edit::Tags(tags) => {
                note.tags = normalize_tags(tags);
                let known = std::mem::take(&mut self.tags);
                self.tags = normalize_tags(known.iter().chain(note.tags.iter()));
            }
            Edit::Archived(archived) => note.archived = archived,
        }
        self.touch(id);
        Some(snapshot)
    }

    /// Remove a note everywhere it is referenced. Returns it with its former
    /// list position.
    pub fn remove(&mut self, id: &NoteId) -> Option<(Note, usize)> {
        let note = self.by_id.remove(id)?;
        let position = self.position(id).unwrap_or(0);
        self.order.retain(|candidate| candidate != id);
        if let Some(hits) = self.search_ids.as_mut() {
            hits.retain(|candidate| candidate != id);
        }
        if self.current_id.as_ref() == Some(id) {
            self.current_id = None;
        }
        Some((note, position))
    }

    /// Replace server entries with a fresh listing. Unsynced temp entries
    /// stay at the front, notes in `keep_local` keep their local copy, and
    /// notes in `hidden` stay out.
    pub fn merge_fetched(
        &mut self,
        fetched: Vec<Note>,
        keep_local: &HashSet<NoteId>,
        hidden: &HashSet<NoteId>,
    ) {
        let mut previous = std::mem::take(&mut self.by_id);
        let temp_ids: Vec<NoteId> =
            self.order.iter().filter(|id| id.is_temp()).cloned().collect();

        let mut order = Vec::with_capacity(temp_ids.len() + fetched.len());
        for id in temp_ids {
            if let Some(note) = previous.remove(&id) {
                self.by_id.insert(id.clone(), note);
                order.push(id);
            }
        }
        for note in fetched {
            if hidden.contains(&note.id) || self.by_id.contains_key(&note.id) {
                continue;
            }
            let note = match previous.remove(&note.id) {
                Some(local) if keep_local.contains(&note.id) => local,
                _ => note,
            };
            order.push(note.id.clone());
            self.by_id.insert(note.id.clone(), note);
        }
        // Locally kept notes the listing does not know about yet.
        for id in keep_local {
            if let Some(note) = previous.remove(id) {
                order.insert(0, id.clone());
                self.by_id.insert(id.clone(), note);
            }
        }

        self.order = order;
        if let Some(hits) = self.search_ids.as_mut() {
            hits.retain(|id| self.by_id.contains_key(id));
        }
        if self.current_id.as_ref().is_some_and(|id| !self.by_id.contains_key(id)) {
            self.current_id = None;
        }
    }

    /// Move a temp entry to its server id. Editable fields stay local; the
    /// server supplies id, ownership and timestamps.
    pub fn apply_created(&mut self, temp_id: &NoteId, created: &Note) -> CreateOutcome {
        if !self.by_id.contains_key(temp_id) {
            return CreateOutcome::Missing;
        }

        if self.by_id.contains_key(&created.id) {
            let was_current = self.current_id.as_ref() == Some(temp_id);
            self.remove(temp_id);
            if was_current {
                self.current_id = Some(created.id.clone());
            }
            return CreateOutcome::Merged;
        }

        let Some(local) = self.by_id.remove(temp_id) else {
            return CreateOutcome::Missing;
        };
        let diverged = !local.same_fields(created);
        let rekeyed = Note {
            id: created.id.clone(),
            owner_id: created.owner_id,
            owner: created.owner.clone(),
            collaborators: created.collaborators.clone(),
            created_at: created.created_at.or(local.created_at),
            sync_error: None,
            ..local
        };

        let rekey = |id: &mut NoteId| {
            if id == temp_id {
                *id = created.id.clone();
            }
        };
        self.order.iter_mut().for_each(rekey);
        if let Some(hits) = self.search_ids.as_mut() {
            hits.iter_mut().for_each(rekey);
        }
        if let Some(current) = self.current_id.as_mut() {
            rekey(current);
        }
        self.by_id.insert(created.id.clone(), rekeyed);
        CreateOutcome::Rekeyed { diverged }
    }
}

/// Undo a failed mutation and record the failure.
pub fn apply_rollback(state: &mut CacheState, rollback: Rollback, message: &str) {
    match rollback {
        Rollback::MarkCreateFailed { temp_id } => {
            if let Some(note) = state.by_id.get_mut(&temp_id) {
                note.sync_error = Some(message.to_string());
            }
        }
        Rollback::Restore { snapshot } => {
            if let Some(note) = state.by_id.get_mut(&snapshot.id) {
                *note = snapshot;
            }
        }
        Rollback::Reinsert { note, position } => {
            if !state.by_id.contains_key(&note.id) {
                let position = position.min(state.order.len());
                state.order.insert(position, note.id.clone());
                state.by_id.insert(note.id.clone(), note);
            }
        }
    }
    state.error = Some(message.to_string());
}
