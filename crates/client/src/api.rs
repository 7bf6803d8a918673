// Notes store client.
//
// `NotesApi` is the seam the cache is written against; `HttpNotesApi`
// talks to the real store over HTTP. A 401 from any call expires the
// shared `AuthSession`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notesync_common::types::{Note, NoteDraft};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::session::AuthSession;

pub const WEBSOCKET_TOKEN_PATH: &str = "/api/auth/websocket-token";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("session expired")]
    SessionExpired,
    #[error("not signed in")]
    NotAuthenticated,
    #[error("store answered {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unreadable response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

#[async_trait]
pub trait NotesApi: Send + Sync {
    async fn list_notes(&self) -> Result<Vec<Note>, ApiError>;
    async fn create_note(&self, draft: &NoteDraft) -> Result<Note, ApiError>;
    async fn update_note(&self, id: Uuid, draft: &NoteDraft) -> Result<Note, ApiError>;
    /// Content-only save; the store answers with an empty body.
    async fn update_content(&self, id: Uuid, content: &str) -> Result<(), ApiError>;
    async fn delete_note(&self, id: Uuid) -> Result<(), ApiError>;
    async fn search_notes(&self, keyword: &str) -> Result<Vec<Note>, ApiError>;
    async fn list_tags(&self) -> Result<Vec<String>, ApiError>;
    async fn share_note(&self, id: Uuid, emails: &[String]) -> Result<Note, ApiError>;
    async fn remove_collaborator(&self, id: Uuid, email: &str) -> Result<Note, ApiError>;
}

/// Source of the short-lived relay credential.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn collaboration_token(&self) -> Result<String, ApiError>;
}

#[derive(Debug, Serialize)]
struct ShareRequest<'a> {
    emails: &'a [String],
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct HttpNotesApi {
    client: reqwest::Client,
    base_url: Url,
    session: Arc<AuthSession>,
}

impl HttpNotesApi {
    pub fn new(base_url: Url, timeout: Duration, session: Arc<AuthSession>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::Network(err.to_string()))?;
        Ok(Self { client, base_url, session })
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", self.base_url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self.session.token().ok_or(ApiError::NotAuthenticated)?;
        Ok(self.client.request(method, self.url(path)).bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await.map_err(|err| ApiError::Network(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.session.expire();
            return Err(ApiError::SessionExpired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "notes store call failed");
            return Err(ApiError::Status { status: status.as_u16(), message });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        self.send(request).await?.json().await.map_err(|err| ApiError::Decode(err.to_string()))
    }
}

#[async_trait]
impl NotesApi for HttpNotesApi {
    async fn list_notes(&self) -> Result<Vec<Note>, ApiError> {
        self.json(self.request(Method::GET, "/api/notes")?).await
    }

    async fn create_note(&self, draft: &NoteDraft) -> Result<Note, ApiError> {
        self.json(self.request(Method::POST, "/api/notes")?.json(draft)).await
    }

    async fn update_note(&self, id: Uuid, draft: &NoteDraft) -> Result<Note, ApiError> {
        self.json(self.request(Method::PUT, &format!("/api/notes/{id}"))?.json(draft)).await
    }

    async fn update_content(&self, id: Uuid, content: &str) -> Result<(), ApiError> {
        let request = self
            .request(Method::PUT, &format!("/api/notes/{id}/content"))?
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(content.to_string());
        self.send(request).await.map(drop)
    }

    async fn delete_note(&self, id: Uuid) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, &format!("/api/notes/{id}"))?).await.map(drop)
    }

    async fn search_notes(&self, keyword: &str) -> Result<Vec<Note>, ApiError> {
        let request = self.request(Method::GET, "/api/notes/search")?.query(&[("keyword", keyword)]);
        self.json(request).await
    }

    async fn list_tags(&self) -> Result<Vec<String>, ApiError> {
        self.json(self.request(Method::GET, "/api/tags")?).await
    }

    async fn share_note(&self, id: Uuid, emails: &[String]) -> Result<Note, ApiError> {
        let request =
            self.request(Method::POST, &format!("/api/notes/{id}/share"))?.json(&ShareRequest { emails });
        self.json(request).await
    }

    async fn remove_collaborator(&self, id: Uuid, email: &str) -> Result<Note, ApiError> {
        let mut url = self.url(&format!("/api/notes/{id}/collaborators"));
        url.path_segments_mut()
            .map_err(|_| ApiError::Network("notes store URL cannot carry a path".to_string()))?
            .push(email);
        let token = self.session.token().ok_or(ApiError::NotAuthenticated)?;
        self.json(self.client.delete(url).bearer_auth(token)).await
    }
}

#[async_trait]
impl CredentialSource for HttpNotesApi {
    async fn collaboration_token(&self) -> Result<String, ApiError> {
        let body: TokenResponse = self.json(self.request(Method::GET, WEBSOCKET_TOKEN_PATH)?).await?;
        if body.token.trim().is_empty() {
            return Err(ApiError::Decode("empty collaboration token".to_string()));
        }
        Ok(body.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionEvent, UserProfile};
    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::{delete, get, put},
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    const NOTE_ID: &str = "3f2b8a9c-1d4e-4f6a-9b7c-0e1d2c3b4a59";

    fn note_json(title: &str) -> Value {
        json!({
            "id": NOTE_ID,
            "title": title,
            "content": "<p>hi</p>",
            "tags": ["work"],
            "isShared": false,
            "sharedWith": [],
            "ownerId": 7,
            "createdAt": "2024-05-01T10:00:00"
        })
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer session-token")
    }

    async fn spawn_store() -> Url {
        let app = Router::new()
            .route(
                "/api/notes",
                get(|headers: HeaderMap| async move {
                    if !authorized(&headers) {
                        return AxumStatus::UNAUTHORIZED.into_response();
                    }
                    Json(json!([note_json("First")])).into_response()
                })
                .post(|Json(draft): Json<Value>| async move {
                    Json(note_json(draft["title"].as_str().unwrap_or_default())).into_response()
                }),
            )
            .route(
                "/api/notes/search",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    Json(json!([note_json(&params["keyword"])]))
                }),
            )
            .route(
                "/api/notes/{id}/content",
                put(|body: String| async move {
                    if body == "boom" {
                        (AxumStatus::INTERNAL_SERVER_ERROR, "store failed").into_response()
                    } else {
                        AxumStatus::OK.into_response()
                    }
                }),
            )
            .route("/api/notes/{id}", delete(|| async { AxumStatus::NO_CONTENT }))
            .route(
                "/api/notes/{id}/collaborators/{email}",
                delete(|Path((_id, email)): Path<(String, String)>| async move {
                    Json(json!({ "id": NOTE_ID, "title": email }))
                }),
            )
            .route("/api/tags", get(|| async { Json(json!(["work", "home"])) }))
            .route("/api/auth/websocket-token", get(|| async { Json(json!({ "token": "a.b.c" })) }))
            .route("/api/broken", get(|| async { "not json" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("stub should bind");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    fn signed_in(token: &str) -> Arc<AuthSession> {
        let session = Arc::new(AuthSession::new());
        session.sign_in(
            token,
            UserProfile { id: 7, email: "ann@example.com".into(), username: None, color: None },
        );
        session
    }

    async fn api(token: &str) -> HttpNotesApi {
        HttpNotesApi::new(spawn_store().await, Duration::from_secs(2), signed_in(token))
            .expect("client should build")
    }

    #[tokio::test]
    async fn lists_notes_in_store_shape() {
        let api = api("session-token").await;
        let notes = api.list_notes().await.expect("list should succeed");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id.to_string(), NOTE_ID);
        assert_eq!(notes[0].owner_id, Some(7));
        assert!(notes[0].created_at.is_some());
    }

    #[tokio::test]
    async fn unauthorized_expires_the_session() {
        let api = api("stale-token").await;
        let mut events = api.session().subscribe();

        assert_eq!(api.list_notes().await.unwrap_err(), ApiError::SessionExpired);
        assert!(!api.session().is_authenticated());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert_eq!(api.list_notes().await.unwrap_err(), ApiError::NotAuthenticated);
    }

    #[tokio::test]
    async fn non_success_is_a_status_error() {
        let api = api("session-token").await;
        let id = Uuid::parse_str(NOTE_ID).unwrap();
        assert!(api.update_content(id, "fine").await.is_ok());
        match api.update_content(id, "boom").await.unwrap_err() {
            ApiError::Status { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "store failed");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_body_is_a_decode_error() {
        let api = api("session-token").await;
        let err = api.json::<Vec<Note>>(api.request(Method::GET, "/api/broken").unwrap()).await;
        assert!(matches!(err, Err(ApiError::Decode(_))));
    }

    #[tokio::test]
    async fn unreachable_store_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let api = HttpNotesApi::new(
            Url::parse(&format!("http://{addr}")).unwrap(),
            Duration::from_secs(1),
            signed_in("session-token"),
        )
        .unwrap();
        assert!(matches!(api.list_tags().await, Err(ApiError::Network(_))));
    }

    #[tokio::test]
    async fn search_tags_and_token_calls() {
        let api = api("session-token").await;
        let found = api.search_notes("groceries").await.expect("search should succeed");
        assert_eq!(found[0].title, "groceries");
        assert_eq!(api.list_tags().await.unwrap(), vec!["work".to_string(), "home".to_string()]);
        assert_eq!(api.collaboration_token().await.unwrap(), "a.b.c");

        let id = Uuid::parse_str(NOTE_ID).unwrap();
        api.delete_note(id).await.expect("delete should succeed");
        let note = api.remove_collaborator(id, "bob@example.com").await.unwrap();
        assert_eq!(note.title, "bob@example.com");
    }
}
