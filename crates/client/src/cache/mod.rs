// Optimistic Local Cache.
//
// Every mutation lands in local state first and is persisted in the
// background. Each background call carries a `PendingOperation`; when the
// call fails the paired `Rollback` is applied with `apply_rollback`.
//
// Lock order is coordination, then state. Neither lock is held across an
// await.

pub mod state;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notesync_common::types::{Note, NoteDraft, NoteId};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{ApiError, NotesApi};
use crate::config::ClientConfig;

pub use state::{
    apply_rollback, CacheState, CreateOutcome, Edit, Mutation, PendingOperation, Rollback, View,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub content_debounce: Duration,
    pub tags_debounce: Duration,
    pub search_debounce: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for CacheSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            content_debounce: config.content_debounce(),
            tags_debounce: config.tags_debounce(),
            search_debounce: config.search_debounce(),
        }
    }
}

/// Outcomes of background calls, for the UI's transient indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Created { temp_id: NoteId, id: NoteId },
    CreateFailed { temp_id: NoteId, message: String },
    Saved { id: NoteId },
    SaveFailed { id: NoteId, message: String },
    Deleted { id: NoteId },
    DeleteFailed { id: NoteId, message: String },
    SearchUpdated { query: String, hits: usize },
    /// A call came back 401. The session is already cleared.
    SessionExpired,
}

// ── Coordination ────────────────────────────────────────────────────

struct PendingSave {
    snapshot: Note,
    generation: u64,
    content_only: bool,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Coordination {
    /// Debounced saves not yet started, keyed by server id.
    pending: HashMap<Uuid, PendingSave>,
    /// Saves started and not yet finished.
    saving: HashMap<Uuid, usize>,
    /// Store copy left by the last finished save, for a save already
    /// started and still queued on the note's lock.
    rebase: HashMap<Uuid, Note>,
    deleting: HashSet<Uuid>,
    creating: HashSet<NoteId>,
    deleted_while_creating: HashSet<NoteId>,
    next_generation: u64,
}

impl Coordination {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Notes whose local copy must survive a fetch.
    fn unsaved(&self) -> HashSet<NoteId> {
        self.pending.keys().chain(self.saving.keys()).map(|id| NoteId::Server(*id)).collect()
    }

    fn finish_save(&mut self, id: Uuid) {
        if let Some(count) = self.saving.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.saving.remove(&id);
                self.rebase.remove(&id);
            }
        }
    }

    /// Later saves of the note roll back to what the store now holds.
    fn settle(&mut self, id: Uuid, stored: Note) {
        if let Some(pending) = self.pending.get_mut(&id) {
            pending.snapshot = stored.clone();
        }
        if self.saving.contains_key(&id) {
            self.rebase.insert(id, stored);
        }
    }
}

/// Counts one background call until dropped. Taken before the task is
/// spawned so `flush` never observes a gap.
struct InflightGuard {
    counter: Arc<watch::Sender<usize>>,
}

impl InflightGuard {
    fn new(counter: &Arc<watch::Sender<usize>>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self { counter: Arc::clone(counter) }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.send_modify(|count| *count -= 1);
    }
}

struct CacheInner {
    api: Arc<dyn NotesApi>,
    settings: CacheSettings,
    coord: Mutex<Coordination>,
    state: Mutex<CacheState>,
    save_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    search_generation: AtomicU64,
    search_task: Mutex<Option<JoinHandle<()>>>,
    inflight: Arc<watch::Sender<usize>>,
    events: broadcast::Sender<CacheEvent>,
}

/// Handle to the cache; clones share state.
#[derive(Clone)]
pub struct NotesCache {
    inner: Arc<CacheInner>,
}

impl NotesCache {
    pub fn new(api: Arc<dyn NotesApi>, settings: CacheSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(CacheInner {
                api,
                settings,
                coord: Mutex::new(Coordination::default()),
                state: Mutex::new(CacheState::default()),
                save_locks: Mutex::new(HashMap::new()),
                search_generation: AtomicU64::new(0),
                search_task: Mutex::new(None),
                inflight: Arc::new(watch::Sender::new(0)),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> CacheState {
        self.inner.state().clone()
    }

    pub fn notes(&self, view: View) -> Vec<Note> {
        self.inner.state().notes(view)
    }

    pub fn search_results(&self) -> Vec<Note> {
        self.inner.state().search_results()
    }

    pub fn note(&self, id: &NoteId) -> Option<Note> {
        self.inner.state().get(id).cloned()
    }

    pub fn current(&self) -> Option<Note> {
        self.inner.state().current().cloned()
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.state().tags.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state().error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.state().error = None;
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state().loading
    }

    /// Number of background calls still running.
    pub fn inflight(&self) -> usize {
        *self.inner.inflight.borrow()
    }

    // ── Loading ─────────────────────────────────────────────────────

    /// Replace the cached listing with the store's.
    pub async fn fetch_all(&self) -> Result<(), ApiError> {
        self.inner.state().loading = true;
        let result = self.inner.api.list_notes().await;

        let coord = self.inner.coord();
        let mut state = self.inner.state();
        state.loading = false;
        match result {
            Ok(notes) => {
                let hidden: HashSet<NoteId> =
                    coord.deleting.iter().map(|id| NoteId::Server(*id)).collect();
                debug!(count = notes.len(), "notes fetched");
                state.merge_fetched(notes, &coord.unsaved(), &hidden);
                state.error = None;
                Ok(())
            }
            Err(err) => {
                state.error = Some(err.to_string());
                drop(state);
                drop(coord);
                self.inner.report_session(&err);
                Err(err)
            }
        }
    }

    pub async fn fetch_tags(&self) -> Result<(), ApiError> {
        match self.inner.api.list_tags().await {
            Ok(tags) => {
                self.inner.state().tags = tags;
                Ok(())
            }
            Err(err) => {
                self.inner.state().error = Some(err.to_string());
                self.inner.report_session(&err);
                Err(err)
            }
        }
    }

    /// Point the editor at `id`, or at nothing. False if `id` is unknown.
    pub fn select(&self, id: Option<&NoteId>) -> bool {
        let mut state = self.inner.state();
        match id {
            None => {
                state.current_id = None;
                true
            }
            Some(id) if state.by_id.contains_key(id) => {
                state.current_id = Some(id.clone());
                true
            }
            Some(_) => false,
        }
    }

    /// Drop everything, e.g. after sign-out.
    pub fn reset(&self) {
        let mut coord = self.inner.coord();
        for (_, pending) in coord.pending.drain() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        *self.inner.state() = CacheState::default();
    }

    // ── Create ──────────────────────────────────────────────────────

    /// Insert a draft under a temp id, select it, and create it remotely.
    pub fn create(&self, draft: NoteDraft) -> NoteId {
        let temp_id = NoteId::new_temp();
        let note = Note::from_draft(temp_id.clone(), draft.clone());
        let guard = InflightGuard::new(&self.inner.inflight);
        {
            let mut coord = self.inner.coord();
            coord.creating.insert(temp_id.clone());
            let mut state = self.inner.state();
            state.insert_front(note);
            state.current_id = Some(temp_id.clone());
        }

        let operation = PendingOperation {
            mutation: Mutation::Create { temp_id: temp_id.clone(), draft },
            rollback: Rollback::MarkCreateFailed { temp_id: temp_id.clone() },
        };
        tokio::spawn(Arc::clone(&self.inner).run_create(operation, guard));
        temp_id
    }

    /// Re-issue the create for a draft whose create failed.
    pub fn retry_create(&self, temp_id: &NoteId) -> bool {
        let guard;
        let draft = {
            let mut coord = self.inner.coord();
            if coord.creating.contains(temp_id) {
                return false;
            }
            let mut state = self.inner.state();
            let Some(note) = state.by_id.get_mut(temp_id) else {
                return false;
            };
            if note.sync_error.is_none() {
                return false;
            }
            note.sync_error = None;
            coord.creating.insert(temp_id.clone());
            guard = InflightGuard::new(&self.inner.inflight);
            note.draft()
        };

        let operation = PendingOperation {
            mutation: Mutation::Create { temp_id: temp_id.clone(), draft },
            rollback: Rollback::MarkCreateFailed { temp_id: temp_id.clone() },
        };
        tokio::spawn(Arc::clone(&self.inner).run_create(operation, guard));
        true
    }

    /// Throw away a draft that never reached the store.
    pub fn discard(&self, temp_id: &NoteId) -> bool {
        if !temp_id.is_temp() {
            return false;
        }
        let coord = self.inner.coord();
        if coord.creating.contains(temp_id) {
            return false;
        }
        self.inner.state().remove(temp_id).is_some()
    }

    // ── Edits ───────────────────────────────────────────────────────

    pub fn edit_content(&self, id: &NoteId, content: impl Into<String>) -> bool {
        self.edit(id, Edit::Content(content.into()))
    }

    pub fn edit_title(&self, id: &NoteId, title: impl Into<String>) -> bool {
        self.edit(id, Edit::Title(title.into()))
    }

    pub fn edit_tags(&self, id: &NoteId, tags: Vec<String>) -> bool {
        self.edit(id, Edit::Tags(tags))
    }

    pub fn set_archived(&self, id: &NoteId, archived: bool) -> bool {
        self.edit(id, Edit::Archived(archived))
    }

    /// Apply locally and (re)arm the note's save timer. Temp notes stay
    /// local; their create carries the edits.
    fn edit(&self, id: &NoteId, edit: Edit) -> bool {
        let settings = self.inner.settings;
        let (delay, content_only) = match &edit {
            Edit::Content(_) => (settings.content_debounce, true),
            Edit::Tags(_) => (settings.tags_debounce, false),
            Edit::Title(_) | Edit::Archived(_) => (Duration::ZERO, false),
        };

        let mut coord = self.inner.coord();
        let Some(snapshot) = self.inner.state().apply_edit(id, edit) else {
            return false;
        };
        let Some(server_id) = id.server_id() else {
            return true;
        };

        let generation = coord.bump();
        let timer = self.inner.spawn_timer(server_id, generation, delay);
        match coord.pending.get_mut(&server_id) {
            Some(pending) => {
                if let Some(previous) = pending.timer.replace(timer) {
                    previous.abort();
                }
                pending.generation = generation;
                pending.content_only &= content_only;
            }
            None => {
                coord.pending.insert(
                    server_id,
                    PendingSave { snapshot, generation, content_only, timer: Some(timer) },
                );
            }
        }
        true
    }

    // ── Delete ──────────────────────────────────────────────────────

    pub fn delete(&self, id: &NoteId) -> bool {
        let mut coord = self.inner.coord();
        let Some((note, position)) = self.inner.state().remove(id) else {
            return false;
        };

        match id.server_id() {
            Some(server_id) => {
                if let Some(pending) = coord.pending.remove(&server_id) {
                    if let Some(timer) = pending.timer {
                        timer.abort();
                    }
                }
                coord.deleting.insert(server_id);
                let guard = InflightGuard::new(&self.inner.inflight);
                let operation = PendingOperation {
                    mutation: Mutation::Delete { id: server_id },
                    rollback: Rollback::Reinsert { note, position },
                };
                tokio::spawn(Arc::clone(&self.inner).run_delete(operation, guard));
            }
            None if coord.creating.contains(id) => {
                coord.deleted_while_creating.insert(id.clone());
            }
            None => {}
        }
        true
    }

    // ── Sharing ─────────────────────────────────────────────────────

    /// Share with `emails`. Not optimistic: the store decides who exists.
    pub async fn share(&self, id: &NoteId, emails: &[String]) -> Result<(), ApiError> {
        let server_id = id.server_id().ok_or(ApiError::Status {
            status: 409,
            message: "note is not saved yet".to_string(),
        })?;
        let result = self.inner.api.share_note(server_id, emails).await;
        self.inner.absorb_membership(result)
    }

    pub async fn unshare(&self, id: &NoteId, email: &str) -> Result<(), ApiError> {
        let server_id = id.server_id().ok_or(ApiError::Status {
            status: 409,
            message: "note is not saved yet".to_string(),
        })?;
        let result = self.inner.api.remove_collaborator(server_id, email).await;
        self.inner.absorb_membership(result)
    }

    // ── Search ──────────────────────────────────────────────────────

    /// Debounced keyword search. An empty query clears the results.
    pub fn search(&self, query: &str) {
        let generation = self.inner.search_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut task = self.inner.search_task.lock().expect("search task lock poisoned");
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let query = query.trim().to_string();
        if query.is_empty() {
            self.inner.state().search_ids = None;
            return;
        }

        let guard = InflightGuard::new(&self.inner.inflight);
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(inner.settings.search_debounce).await;
            if inner.search_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let result = inner.api.search_notes(&query).await;
            if inner.search_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match result {
                Ok(hits) => {
                    let ids: Vec<NoteId> = hits.into_iter().map(|note| note.id).collect();
                    let count = ids.len();
                    inner.state().search_ids = Some(ids);
                    inner.emit(CacheEvent::SearchUpdated { query, hits: count });
                }
                Err(err) => {
                    warn!(error = %err, "search failed");
                    inner.state().error = Some(err.to_string());
                    inner.report_session(&err);
                }
            }
        }));
    }

    /// Start every pending save now and wait for all background calls.
    pub async fn flush(&self) {
        let due: Vec<(PendingOperation, InflightGuard)> = {
            let mut coord = self.inner.coord();
            let ids: Vec<Uuid> = coord.pending.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| self.inner.take_pending(&mut coord, id, None))
                .collect()
        };
        for (operation, guard) in due {
            tokio::spawn(Arc::clone(&self.inner).run_save(operation, guard));
        }

        let mut inflight = self.inner.inflight.subscribe();
        let _ = inflight.wait_for(|count| *count == 0).await;
    }
}

// ── Background calls ────────────────────────────────────────────────

impl CacheInner {
    fn state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("cache state lock poisoned")
    }

    fn coord(&self) -> std::sync::MutexGuard<'_, Coordination> {
        self.coord.lock().expect("cache coordination lock poisoned")
    }

    fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn report_session(&self, err: &ApiError) {
        if err.is_session_expired() {
            self.emit(CacheEvent::SessionExpired);
        }
    }

    fn save_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.save_locks.lock().expect("cache save locks poisoned");
        Arc::clone(locks.entry(id).or_default())
    }

    fn spawn_timer(self: &Arc<Self>, id: Uuid, generation: u64, delay: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let due = {
                let mut coord = inner.coord();
                inner.take_pending(&mut coord, id, Some(generation))
            };
            if let Some((operation, guard)) = due {
                inner.run_save(operation, guard).await;
            }
        })
    }

    /// Move a pending save into the saving set. With `generation`, only a
    /// timer that is still current may take it.
    fn take_pending(
        &self,
        coord: &mut Coordination,
        id: Uuid,
        generation: Option<u64>,
    ) -> Option<(PendingOperation, InflightGuard)> {
        let current = coord.pending.get(&id)?;
        if generation.is_some_and(|generation| generation != current.generation) {
            return None;
        }
        let pending = coord.pending.remove(&id)?;
        if generation.is_none() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        *coord.saving.entry(id).or_default() += 1;
        let operation = PendingOperation {
            mutation: Mutation::Save { id, content_only: pending.content_only },
            rollback: Rollback::Restore { snapshot: pending.snapshot },
        };
        Some((operation, InflightGuard::new(&self.inflight)))
    }

    async fn run_save(self: Arc<Self>, operation: PendingOperation, _guard: InflightGuard) {
        let (Mutation::Save { id, content_only }, Rollback::Restore { snapshot }) =
            (operation.mutation, operation.rollback)
        else {
            return;
        };
        let lock = self.save_lock(id);
        let _held = lock.lock().await;
        let snapshot = self.coord().rebase.remove(&id).unwrap_or(snapshot);

        let note_id = NoteId::Server(id);
        let current = self.state().get(&note_id).cloned();
        let result = match &current {
            // Deleted meanwhile; the delete wins.
            None => Ok(()),
            Some(note) if content_only => self.api.update_content(id, &note.content).await,
            Some(note) => self.api.update_note(id, &note.draft()).await.map(|_| ()),
        };

        let mut coord = self.coord();
        coord.finish_save(id);
        match result {
            Ok(()) => {
                if let Some(sent) = current {
                    let stored = if content_only {
                        Note { content: sent.content, ..snapshot }
                    } else {
                        sent
                    };
                    coord.settle(id, stored);
                }
                drop(coord);
                debug!(%id, content_only, "note saved");
                self.emit(CacheEvent::Saved { id: note_id });
            }
            Err(err) => {
                let message = err.to_string();
                warn!(%id, error = %message, "save failed, restoring snapshot");
                coord.settle(id, snapshot.clone());
                apply_rollback(&mut self.state(), Rollback::Restore { snapshot }, &message);
                drop(coord);
                self.report_session(&err);
                self.emit(CacheEvent::SaveFailed { id: note_id, message });
            }
        }
    }

    async fn run_create(self: Arc<Self>, operation: PendingOperation, guard: InflightGuard) {
        let Mutation::Create { temp_id, draft } = operation.mutation else {
            return;
        };
        let result = self.api.create_note(&draft).await.and_then(|created| {
            match created.id.server_id() {
                Some(server_id) => Ok((server_id, created)),
                None => Err(ApiError::Decode(format!("store returned non-uuid id `{}`", created.id))),
            }
        });

        let mut coord = self.coord();
        coord.creating.remove(&temp_id);
        let deleted = coord.deleted_while_creating.remove(&temp_id);

        let (server_id, created) = match result {
            Ok(created) => created,
            Err(err) => {
                let message = err.to_string();
                warn!(%temp_id, error = %message, "create failed, keeping draft");
                if !deleted {
                    apply_rollback(&mut self.state(), operation.rollback, &message);
                }
                drop(coord);
                self.report_session(&err);
                self.emit(CacheEvent::CreateFailed { temp_id, message });
                return;
            }
        };

        if deleted {
            // Deleted locally while the create was in flight.
            coord.deleting.insert(server_id);
            let follow_up = PendingOperation {
                mutation: Mutation::Delete { id: server_id },
                rollback: Rollback::Reinsert { note: created, position: 0 },
            };
            let guard = InflightGuard::new(&self.inflight);
            drop(coord);
            tokio::spawn(Arc::clone(&self).run_delete(follow_up, guard));
            return;
        }

        let outcome = self.state().apply_created(&temp_id, &created);
        debug!(%temp_id, id = %server_id, ?outcome, "note created");
        if outcome == (CreateOutcome::Rekeyed { diverged: true }) {
            // Edits made during the create still need to reach the store.
            *coord.saving.entry(server_id).or_default() += 1;
            let follow_up = PendingOperation {
                mutation: Mutation::Save { id: server_id, content_only: false },
                rollback: Rollback::Restore { snapshot: created.clone() },
            };
            let guard = InflightGuard::new(&self.inflight);
            tokio::spawn(Arc::clone(&self).run_save(follow_up, guard));
        }
        drop(coord);
        drop(guard);
        self.emit(CacheEvent::Created { temp_id, id: created.id });
    }

    async fn run_delete(self: Arc<Self>, operation: PendingOperation, _guard: InflightGuard) {
        let Mutation::Delete { id } = operation.mutation else {
            return;
        };
        let lock = self.save_lock(id);
        let result = {
            let _held = lock.lock().await;
            self.api.delete_note(id).await
        };

        let mut coord = self.coord();
        coord.deleting.remove(&id);
        let note_id = NoteId::Server(id);
        match result {
            Ok(()) => {
                drop(coord);
                self.save_locks.lock().expect("cache save locks poisoned").remove(&id);
                debug!(%id, "note deleted");
                self.emit(CacheEvent::Deleted { id: note_id });
            }
            Err(err) => {
                let message = err.to_string();
                warn!(%id, error = %message, "delete failed, restoring note");
                apply_rollback(&mut self.state(), operation.rollback, &message);
                drop(coord);
                self.report_session(&err);
                self.emit(CacheEvent::DeleteFailed { id: note_id, message });
            }
        }
    }

    fn absorb_membership(&self, result: Result<Note, ApiError>) -> Result<(), ApiError> {
        match result {
            Ok(updated) => {
                let mut state = self.state();
                if let Some(note) = state.by_id.get_mut(&updated.id) {
                    note.owner_id = updated.owner_id;
                    note.owner = updated.owner;
                    note.collaborators = updated.collaborators;
                }
                Ok(())
            }
            Err(err) => {
                self.state().error = Some(err.to_string());
                self.report_session(&err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests;
