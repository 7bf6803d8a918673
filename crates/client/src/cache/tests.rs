use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notesync_common::types::{Collaborator, Note, NoteDraft, NoteId};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::*;
use crate::api::{ApiError, NotesApi};

// ── Mock store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    List,
    Create(NoteDraft),
    Update(Uuid, NoteDraft),
    Content(Uuid, String),
    Delete(Uuid),
    Search(String),
    Tags,
    Share(Uuid, Vec<String>),
    Unshare(Uuid, String),
}

#[derive(Default)]
struct MockNotesApi {
    notes: Mutex<Vec<Note>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<&'static str, ApiError>>,
    search_hits: Mutex<HashMap<String, Vec<Note>>>,
    /// Held by a test to keep creates in flight.
    create_gate: tokio::sync::Mutex<()>,
    /// Held by a test to keep saves in flight. A save is recorded before
    /// it waits here.
    save_gate: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl MockNotesApi {
    fn with_notes(notes: Vec<Note>) -> Arc<Self> {
        let api = Self::default();
        *api.notes.lock().unwrap() = notes;
        api.next_id.store(100, Ordering::SeqCst);
        Arc::new(api)
    }

    fn fail(&self, operation: &'static str, err: ApiError) {
        self.failures.lock().unwrap().insert(operation, err);
    }

    fn heal(&self, operation: &'static str) {
        self.failures.lock().unwrap().remove(operation);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, operation: &'static str, call: Call) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        self.outcome(operation)
    }

    fn outcome(&self, operation: &'static str) -> Result<(), ApiError> {
        match self.failures.lock().unwrap().get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn record_save(&self, operation: &'static str, call: Call) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        let _gate = self.save_gate.lock().await;
        self.outcome(operation)
    }
}

#[async_trait]
impl NotesApi for MockNotesApi {
    async fn list_notes(&self) -> Result<Vec<Note>, ApiError> {
        self.record("list", Call::List)?;
        Ok(self.notes.lock().unwrap().clone())
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<Note, ApiError> {
        let _gate = self.create_gate.lock().await;
        self.record("create", Call::Create(draft.clone()))?;
        let id = Uuid::from_u128(u128::from(self.next_id.fetch_add(1, Ordering::SeqCst)));
        let mut note = Note::from_draft(NoteId::Server(id), draft.clone());
        note.owner_id = Some(1);
        self.notes.lock().unwrap().push(note.clone());
        Ok(note)
    }

    async fn update_note(&self, id: Uuid, draft: &NoteDraft) -> Result<Note, ApiError> {
        self.record_save("update", Call::Update(id, draft.clone())).await?;
        Ok(Note::from_draft(NoteId::Server(id), draft.clone()))
    }

    async fn update_content(&self, id: Uuid, content: &str) -> Result<(), ApiError> {
        self.record_save("content", Call::Content(id, content.to_string())).await
    }

    async fn delete_note(&self, id: Uuid) -> Result<(), ApiError> {
        self.record("delete", Call::Delete(id))?;
        self.notes.lock().unwrap().retain(|note| note.id != NoteId::Server(id));
        Ok(())
    }

    async fn search_notes(&self, keyword: &str) -> Result<Vec<Note>, ApiError> {
        self.record("search", Call::Search(keyword.to_string()))?;
        Ok(self.search_hits.lock().unwrap().get(keyword).cloned().unwrap_or_default())
    }

    async fn list_tags(&self) -> Result<Vec<String>, ApiError> {
        self.record("tags", Call::Tags)?;
        Ok(vec!["home".to_string(), "work".to_string()])
    }

    async fn share_note(&self, id: Uuid, emails: &[String]) -> Result<Note, ApiError> {
        self.record("share", Call::Share(id, emails.to_vec()))?;
        let mut note = Note::from_draft(NoteId::Server(id), NoteDraft::default());
        note.collaborators = emails
            .iter()
            .enumerate()
            .map(|(i, email)| Collaborator { id: i as i64 + 10, email: email.clone(), name: None })
            .collect();
        Ok(note)
    }

    async fn remove_collaborator(&self, id: Uuid, email: &str) -> Result<Note, ApiError> {
        self.record("unshare", Call::Unshare(id, email.to_string()))?;
        Ok(Note::from_draft(NoteId::Server(id), NoteDraft::default()))
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn nid(n: u128) -> NoteId {
    NoteId::Server(id(n))
}

fn stored(n: u128, title: &str, content: &str) -> Note {
    let mut note = Note::from_draft(
        nid(n),
        NoteDraft {
            title: title.to_string(),
            content: content.to_string(),
            tags: vec!["work".to_string()],
            archived: false,
        },
    );
    note.owner_id = Some(1);
    note
}

fn settings() -> CacheSettings {
    CacheSettings {
        content_debounce: Duration::from_millis(200),
        tags_debounce: Duration::from_millis(200),
        search_debounce: Duration::from_millis(100),
    }
}

async fn loaded(notes: Vec<Note>) -> (NotesCache, Arc<MockNotesApi>) {
    let api = MockNotesApi::with_notes(notes);
    let cache = NotesCache::new(api.clone(), settings());
    cache.fetch_all().await.expect("initial fetch should succeed");
    (cache, api)
}

fn ids(notes: &[Note]) -> Vec<NoteId> {
    notes.iter().map(|note| note.id.clone()).collect()
}

fn drain(events: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn draft(title: &str) -> NoteDraft {
    NoteDraft { title: title.to_string(), content: "<p>body</p>".to_string(), ..Default::default() }
}

// ── Loading ─────────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_all_populates_views_in_store_order() {
    let mut archived = stored(3, "old", "c");
    archived.archived = true;
    let (cache, _) = loaded(vec![stored(1, "a", "c"), stored(2, "b", "c"), archived]).await;

    assert_eq!(ids(&cache.notes(View::All)), vec![nid(1), nid(2)]);
    assert_eq!(ids(&cache.notes(View::Archived)), vec![nid(3)]);
    assert!(!cache.is_loading());
    assert_eq!(cache.error(), None);
}

#[tokio::test]
async fn fetch_tags_replaces_tag_list() {
    let (cache, _) = loaded(vec![]).await;
    cache.fetch_tags().await.expect("tags should load");
    assert_eq!(cache.tags(), vec!["home", "work"]);
}

#[tokio::test]
async fn expired_session_is_reported_and_state_kept() {
    let (cache, api) = loaded(vec![stored(1, "a", "c")]).await;
    let mut events = cache.subscribe();
    api.fail("list", ApiError::SessionExpired);

    let err = cache.fetch_all().await.expect_err("fetch should fail");
    assert_eq!(err, ApiError::SessionExpired);
    assert_eq!(drain(&mut events), vec![CacheEvent::SessionExpired]);
    assert_eq!(ids(&cache.notes(View::All)), vec![nid(1)]);
    assert_eq!(cache.error().as_deref(), Some("session expired"));
}

#[tokio::test]
async fn select_rejects_unknown_ids() {
    let (cache, _) = loaded(vec![stored(1, "a", "c")]).await;
    assert!(cache.select(Some(&nid(1))));
    assert_eq!(cache.current().map(|n| n.id), Some(nid(1)));
    assert!(!cache.select(Some(&nid(9))));
    assert!(cache.select(None));
    assert!(cache.current().is_none());
}

// ── Create ──────────────────────────────────────────────────────────

#[tokio::test]
async fn create_shows_temp_note_then_rekeys_to_server_id() {
    let (cache, api) = loaded(vec![stored(1, "a", "c")]).await;
    let mut events = cache.subscribe();

    let temp_id = cache.create(draft("fresh"));
    assert!(temp_id.is_temp());
    assert_eq!(cache.current().map(|n| n.id), Some(temp_id.clone()));
    assert_eq!(ids(&cache.notes(View::All))[0], temp_id);

    cache.flush().await;

    let created = nid(100);
    assert_eq!(cache.current().map(|n| n.id), Some(created.clone()));
    assert_eq!(ids(&cache.notes(View::All)), vec![created.clone(), nid(1)]);
    assert_eq!(cache.note(&created).unwrap().owner_id, Some(1));
    assert!(cache.note(&temp_id).is_none());
    assert_eq!(drain(&mut events), vec![CacheEvent::Created { temp_id, id: created }]);
    // No follow-up save: nothing was edited during the create.
    assert_eq!(api.calls().len(), 2);
}

#[tokio::test]
async fn failed_create_keeps_draft_and_retry_succeeds() {
    let (cache, api) = loaded(vec![]).await;
    api.fail("create", ApiError::Status { status: 503, message: "down".to_string() });

    let temp_id = cache.create(draft("keep me"));
    cache.flush().await;

    let kept = cache.note(&temp_id).expect("draft should survive a failed create");
    assert!(kept.sync_error.is_some());
    assert_eq!(kept.title, "keep me");

    api.heal("create");
    assert!(cache.retry_create(&temp_id));
    assert!(cache.note(&temp_id).unwrap().sync_error.is_none());
    assert!(!cache.retry_create(&temp_id), "retry is refused while a create is in flight");
    cache.flush().await;

    assert!(cache.note(&temp_id).is_none());
    assert_eq!(cache.note(&nid(100)).unwrap().title, "keep me");
}

#[tokio::test]
async fn failed_draft_can_be_discarded() {
    let (cache, api) = loaded(vec![]).await;
    api.fail("create", ApiError::Network("offline".to_string()));
    let temp_id = cache.create(draft("gone"));
    cache.flush().await;

    assert!(cache.discard(&temp_id));
    assert!(cache.notes(View::All).is_empty());
    assert!(!cache.discard(&nid(1)));
}

#[tokio::test]
async fn edits_during_create_stay_local_then_save() {
    let (cache, api) = loaded(vec![]).await;
    let gate = api.create_gate.lock().await;

    let temp_id = cache.create(draft("t"));
    assert!(cache.edit_content(&temp_id, "typed while creating"));
    tokio::task::yield_now().await;
    assert!(api.calls().iter().all(|call| !matches!(call, Call::Update(..) | Call::Content(..))));

    drop(gate);
    cache.flush().await;

    let created = id(100);
    let calls = api.calls();
    assert_eq!(calls[1], Call::Create(draft("t")));
    assert_eq!(
        calls[2],
        Call::Update(
            created,
            NoteDraft { content: "typed while creating".to_string(), ..draft("t") }
        )
    );
    assert_eq!(cache.note(&NoteId::Server(created)).unwrap().content, "typed while creating");
}

#[tokio::test]
async fn deleting_a_note_while_it_is_created_deletes_it_remotely_after() {
    let (cache, api) = loaded(vec![]).await;
    let gate = api.create_gate.lock().await;

    let temp_id = cache.create(draft("short-lived"));
    assert!(cache.delete(&temp_id));
    assert!(cache.notes(View::All).is_empty());
    assert!(cache.current().is_none());

    drop(gate);
    cache.flush().await;

    assert_eq!(api.calls().last(), Some(&Call::Delete(id(100))));
    assert!(cache.notes(View::All).is_empty());
    assert!(api.notes.lock().unwrap().is_empty());
}

// ── Updates ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn content_edits_are_debounced_into_one_save() {
    let (cache, api) = loaded(vec![stored(1, "a", "C1")]).await;

    cache.edit_content(&nid(1), "a");
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.edit_content(&nid(1), "ab");
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.edit_content(&nid(1), "abc");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(api.calls(), vec![Call::List], "nothing is sent inside the debounce window");

    tokio::time::sleep(Duration::from_millis(150)).await;
    cache.flush().await;
    assert_eq!(api.calls(), vec![Call::List, Call::Content(id(1), "abc".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn title_edits_save_immediately_with_full_body() {
    let (cache, api) = loaded(vec![stored(1, "a", "C1"), stored(2, "b", "C2")]).await;

    cache.edit_title(&nid(1), "renamed");
    tokio::time::sleep(Duration::from_millis(1)).await;
    cache.flush().await;

    let expected = NoteDraft { title: "renamed".to_string(), ..stored(1, "a", "C1").draft() };
    assert_eq!(api.calls(), vec![Call::List, Call::Update(id(1), expected)]);
    assert_eq!(ids(&cache.notes(View::All)), vec![nid(1), nid(2)]);
}

#[tokio::test(start_paused = true)]
async fn mixed_edits_coalesce_into_a_full_update() {
    let (cache, api) = loaded(vec![stored(1, "a", "C1")]).await;

    cache.edit_content(&nid(1), "C2");
    cache.edit_tags(&nid(1), vec!["x".to_string()]);
    cache.flush().await;

    let expected = NoteDraft {
        title: "a".to_string(),
        content: "C2".to_string(),
        tags: vec!["x".to_string()],
        archived: false,
    };
    assert_eq!(api.calls(), vec![Call::List, Call::Update(id(1), expected)]);
}

#[tokio::test]
async fn archiving_moves_note_between_views() {
    let (cache, api) = loaded(vec![stored(1, "a", "c"), stored(2, "b", "c")]).await;
    assert!(cache.set_archived(&nid(2), true));
    assert_eq!(ids(&cache.notes(View::All)), vec![nid(1)]);
    assert_eq!(ids(&cache.notes(View::Archived)), vec![nid(2)]);
    cache.flush().await;
    assert!(matches!(api.calls().last(), Some(Call::Update(saved, body)) if *saved == id(2) && body.archived));
}

#[tokio::test]
async fn failed_save_restores_the_whole_snapshot() {
    let original = stored(1, "a", "C1");
    let (cache, api) = loaded(vec![original.clone(), stored(2, "b", "c")]).await;
    let mut events = cache.subscribe();
    api.fail("content", ApiError::Status { status: 500, message: "boom".to_string() });

    cache.edit_content(&nid(1), "C2");
    cache.edit_content(&nid(1), "C2 plus more typing");
    cache.flush().await;

    assert_eq!(cache.note(&nid(1)), Some(original));
    assert!(cache.error().is_some());
    let events = drain(&mut events);
    assert!(matches!(&events[..], [CacheEvent::SaveFailed { id: failed, .. }] if *failed == nid(1)));
}

#[tokio::test(start_paused = true)]
async fn queued_save_waits_for_the_one_in_flight_and_rolls_back_to_the_store_copy() {
    let original = stored(1, "a", "C1");
    let (cache, api) = loaded(vec![original.clone()]).await;
    api.fail("content", ApiError::Status { status: 503, message: "down".to_string() });
    let gate = api.save_gate.lock().await;

    cache.edit_content(&nid(1), "C2");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(api.calls(), vec![Call::List, Call::Content(id(1), "C2".to_string())]);

    cache.edit_content(&nid(1), "C3");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(api.calls().len(), 2, "second save should wait for the first");

    drop(gate);
    cache.flush().await;

    assert_eq!(
        api.calls(),
        vec![
            Call::List,
            Call::Content(id(1), "C2".to_string()),
            Call::Content(id(1), "C1".to_string()),
        ]
    );
    assert_eq!(cache.note(&nid(1)), Some(original), "the rejected C2 must not come back");
}

#[tokio::test(start_paused = true)]
async fn debounced_save_after_a_failed_save_rolls_back_to_the_store_copy() {
    let original = stored(1, "a", "C1");
    let (cache, api) = loaded(vec![original.clone()]).await;
    api.fail("content", ApiError::Status { status: 503, message: "down".to_string() });
    let gate = api.save_gate.lock().await;

    cache.edit_content(&nid(1), "C2");
    tokio::time::sleep(Duration::from_millis(250)).await;
    cache.edit_content(&nid(1), "C3");

    drop(gate);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.note(&nid(1)).unwrap().content, "C1");

    cache.flush().await;
    assert_eq!(api.calls().last(), Some(&Call::Content(id(1), "C1".to_string())));
    assert_eq!(cache.note(&nid(1)), Some(original));
}

#[tokio::test(start_paused = true)]
async fn save_after_a_successful_save_rolls_back_to_what_was_stored() {
    let (cache, api) = loaded(vec![stored(1, "a", "C1")]).await;
    let gate = api.save_gate.lock().await;

    cache.edit_content(&nid(1), "C2");
    tokio::time::sleep(Duration::from_millis(250)).await;
    cache.edit_title(&nid(1), "renamed");
    tokio::time::sleep(Duration::from_millis(1)).await;
    api.fail("update", ApiError::Status { status: 500, message: "boom".to_string() });

    drop(gate);
    cache.flush().await;

    let note = cache.note(&nid(1)).expect("note should still be cached");
    assert_eq!(note.title, "a");
    assert_eq!(note.content, "C2", "C2 was stored by the first save");
}

#[tokio::test]
async fn edits_to_unknown_notes_are_ignored() {
    let (cache, api) = loaded(vec![]).await;
    assert!(!cache.edit_title(&nid(7), "x"));
    cache.flush().await;
    assert_eq!(api.calls(), vec![Call::List]);
}

#[tokio::test(start_paused = true)]
async fn fetch_keeps_local_copy_of_unsaved_notes() {
    let (cache, api) = loaded(vec![stored(1, "a", "C1"), stored(2, "b", "c")]).await;
    let gate = api.create_gate.lock().await;
    let temp_id = cache.create(draft("pending"));
    cache.edit_content(&nid(1), "unsaved");

    cache.fetch_all().await.unwrap();

    assert_eq!(cache.note(&nid(1)).unwrap().content, "unsaved");
    assert_eq!(ids(&cache.notes(View::All))[0], temp_id);
    drop(gate);
    cache.flush().await;
}

// ── Delete ──────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_note_and_clears_selection() {
    let (cache, api) = loaded(vec![stored(1, "a", "c"), stored(2, "b", "c")]).await;
    cache.select(Some(&nid(1)));

    assert!(cache.delete(&nid(1)));
    assert!(cache.current().is_none());
    assert_eq!(ids(&cache.notes(View::All)), vec![nid(2)]);
    cache.flush().await;

    assert_eq!(api.calls().last(), Some(&Call::Delete(id(1))));
    assert!(!cache.delete(&nid(1)));
}

#[tokio::test]
async fn failed_delete_reinserts_note_at_previous_position() {
    let (cache, api) =
        loaded(vec![stored(1, "a", "c"), stored(2, "abc", "<p>keep</p>"), stored(3, "c", "c")]).await;
    let mut events = cache.subscribe();
    api.fail("delete", ApiError::Network("offline".to_string()));
    let before = cache.note(&nid(2)).unwrap();

    cache.delete(&nid(2));
    assert_eq!(ids(&cache.notes(View::All)), vec![nid(1), nid(3)]);
    cache.flush().await;

    assert_eq!(ids(&cache.notes(View::All)), vec![nid(1), nid(2), nid(3)]);
    assert_eq!(cache.note(&nid(2)), Some(before));
    assert!(matches!(&drain(&mut events)[..], [CacheEvent::DeleteFailed { .. }]));
}

#[tokio::test(start_paused = true)]
async fn delete_cancels_a_pending_save() {
    let (cache, api) = loaded(vec![stored(1, "a", "c")]).await;
    cache.edit_content(&nid(1), "never saved");
    cache.delete(&nid(1));
    tokio::time::sleep(Duration::from_millis(500)).await;
    cache.flush().await;

    assert_eq!(api.calls(), vec![Call::List, Call::Delete(id(1))]);
}

// ── Search ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn search_is_debounced_and_stores_ids_only() {
    let (cache, api) = loaded(vec![stored(1, "milk", "c"), stored(2, "eggs", "c")]).await;
    api.search_hits.lock().unwrap().insert("mi".to_string(), vec![stored(1, "stale title", "c")]);
    let mut events = cache.subscribe();

    cache.search("m");
    tokio::time::sleep(Duration::from_millis(50)).await;
    cache.search("mi");
    tokio::time::sleep(Duration::from_millis(150)).await;
    cache.flush().await;

    assert_eq!(api.calls(), vec![Call::List, Call::Search("mi".to_string())]);
    let results = cache.search_results();
    assert_eq!(ids(&results), vec![nid(1)]);
    assert_eq!(results[0].title, "milk", "hits resolve to the cached note body");
    assert_eq!(
        drain(&mut events),
        vec![CacheEvent::SearchUpdated { query: "mi".to_string(), hits: 1 }]
    );

    cache.search("   ");
    assert!(cache.search_results().is_empty());
    assert_eq!(cache.snapshot().search_ids, None);
    cache.flush().await;
    assert_eq!(api.calls().len(), 2);
}

// ── Sharing ─────────────────────────────────────────────────────────

#[tokio::test]
async fn share_updates_collaborators_from_store() {
    let (cache, api) = loaded(vec![stored(1, "a", "c")]).await;

    cache.share(&nid(1), &["bob@example.com".to_string()]).await.expect("share should succeed");
    let note = cache.note(&nid(1)).unwrap();
    assert_eq!(note.collaborators.len(), 1);
    assert_eq!(note.collaborators[0].email, "bob@example.com");
    assert!(note.is_shared());

    cache.unshare(&nid(1), "bob@example.com").await.unwrap();
    assert!(!cache.note(&nid(1)).unwrap().is_shared());
    assert_eq!(api.calls().last(), Some(&Call::Unshare(id(1), "bob@example.com".to_string())));

    let temp = NoteId::new_temp();
    assert!(cache.share(&temp, &[]).await.is_err());
}
