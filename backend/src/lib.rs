pub mod config;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use santa_core::{Group, GroupCommand, GroupEvent, Participant, SantaError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};
use uuid::Uuid;

use crate::store::{ApplyError, GroupStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn GroupStore>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ServerMessage>>>>,
}

impl AppState {
    pub fn new(store: Arc<dyn GroupStore>) -> Self {
        Self {
            store,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn channel_for(&self, group_id: &str) -> broadcast::Sender<ServerMessage> {
        let mut channels = self.channels.write().await;
        channels
            .entry(group_id.to_string())
            .or_insert_with(|| broadcast::channel(32).0)
            .clone()
    }

    async fn broadcast(&self, group: &Group, events: Vec<GroupEvent>) {
        if events.is_empty() {
            return;
        }
        let tx = self.channel_for(&group.id).await;
        let _ = tx.send(ServerMessage::State(to_view(group)));
        for event in events {
            let _ = tx.send(ServerMessage::Event(event));
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/group", post(create_group))
        .route("/groups", get(list_groups))
        .route("/group/:id", get(get_group))
        .route("/group/:id/join", post(join_group))
        .route("/group/:id/shuffle", post(shuffle_group))
        .route("/group/:id/assignment", get(get_assignment))
        .route("/group/:id/wishes", get(get_wishes).put(set_wishes))
        .route("/ws/:id/:participant_id", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("x-user-id header required")]
    MissingIdentity,
    #[error("group not found")]
    GroupNotFound,
    #[error("name required")]
    NameRequired,
    #[error(transparent)]
    Engine(#[from] SantaError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ApplyError> for ApiError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::GroupNotFound => ApiError::GroupNotFound,
            ApplyError::Engine(e) => ApiError::Engine(e),
            ApplyError::Store(e) => ApiError::Store(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingIdentity | ApiError::NameRequired => StatusCode::BAD_REQUEST,
            ApiError::GroupNotFound => StatusCode::NOT_FOUND,
            ApiError::Engine(err) => match err {
                SantaError::InsufficientParticipants => StatusCode::BAD_REQUEST,
                SantaError::GroupLocked
                | SantaError::NotYetShuffled
                | SantaError::AlreadyShuffled => StatusCode::CONFLICT,
                SantaError::NotAParticipant | SantaError::NotGroupAdmin => StatusCode::FORBIDDEN,
                // New random attempts are independent, so the client may retry.
                SantaError::ShuffleFailed => StatusCode::SERVICE_UNAVAILABLE,
                SantaError::StaleAssignments => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Store(err) => {
                error!("store failure: {err}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Caller identity as handed over by the gateway in front of us. The
/// service never derives identity itself.
struct Caller {
    id: String,
    name: String,
}

fn caller_identity(headers: &HeaderMap) -> Result<Caller, ApiError> {
    let id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::MissingIdentity)?
        .to_string();
    let name = headers
        .get("x-user-name")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(&id)
        .to_string();
    Ok(Caller { id, name })
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: String,
    pub display_name: String,
    pub is_admin: bool,
    pub wish_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupView {
    pub id: String,
    pub name: String,
    pub budget: Option<f64>,
    pub currency: Option<String>,
    pub shuffled: bool,
    pub participants: Vec<ParticipantView>,
    pub created_at: u64,
}

// A participant only ever reads their own edge of the mapping, so the view
// never carries `assignments`.
fn to_view(group: &Group) -> GroupView {
    GroupView {
        id: group.id.clone(),
        name: group.name.clone(),
        budget: group.budget,
        currency: group.currency.clone(),
        shuffled: group.shuffled,
        participants: group
            .participants
            .iter()
            .map(|p| ParticipantView {
                id: p.id.clone(),
                display_name: p.display_name.clone(),
                is_admin: p.is_admin,
                wish_count: p.wishes.len(),
            })
            .collect(),
        created_at: group.created_at,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    State(GroupView),
    Event(GroupEvent),
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    budget: Option<f64>,
    currency: Option<String>,
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = caller_identity(&headers)?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ApiError::NameRequired);
    }

    let now = unix_millis();
    let creator = Participant::new(caller.id, caller.name, now);
    let group = Group::new(
        Uuid::new_v4().to_string(),
        name,
        payload.budget,
        payload.currency,
        creator,
        now,
    );
    state.store.create(group.clone()).await?;
    info!(group_id = %group.id, "group created");

    Ok((StatusCode::CREATED, Json(to_view(&group))))
}

async fn list_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupView>>, ApiError> {
    let caller = caller_identity(&headers)?;
    let mut groups = state.store.groups_for(&caller.id).await?;
    groups.sort_by_key(|g| g.created_at);
    Ok(Json(groups.iter().map(to_view).collect()))
}

async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> Result<Json<GroupView>, ApiError> {
    let group = state
        .store
        .load(&group_id)
        .await?
        .ok_or(ApiError::GroupNotFound)?;
    Ok(Json(to_view(&group)))
}

async fn join_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GroupView>, ApiError> {
    let caller = caller_identity(&headers)?;
    let participant = Participant::new(caller.id, caller.name, unix_millis());
    let (group, events) = state
        .store
        .apply(&group_id, GroupCommand::Join { participant }, None)
        .await?;

    state.broadcast(&group, events).await;
    Ok(Json(to_view(&group)))
}

#[derive(Deserialize)]
struct ShuffleParams {
    seed: Option<u64>,
}

async fn shuffle_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Query(params): Query<ShuffleParams>,
) -> Result<Json<GroupView>, ApiError> {
    let caller = caller_identity(&headers)?;
    let command = GroupCommand::Shuffle {
        requested_by: caller.id,
    };

    match state.store.apply(&group_id, command, params.seed).await {
        Ok((group, events)) => {
            info!(group_id = %group.id, participants = group.participants.len(), "assignments drawn");
            state.broadcast(&group, events).await;
            Ok(Json(to_view(&group)))
        }
        // Double tap or lost commit race: hand back the frozen state
        // instead of an error.
        Err(ApplyError::Engine(SantaError::AlreadyShuffled)) => {
            let group = state
                .store
                .load(&group_id)
                .await?
                .ok_or(ApiError::GroupNotFound)?;
            Ok(Json(to_view(&group)))
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Serialize)]
struct AssignmentView {
    recipient_id: String,
    recipient_name: String,
    wishes: Vec<String>,
}

async fn get_assignment(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AssignmentView>, ApiError> {
    let caller = caller_identity(&headers)?;
    let group = state
        .store
        .load(&group_id)
        .await?
        .ok_or(ApiError::GroupNotFound)?;

    let recipient = group.recipient_of(&caller.id)?;
    Ok(Json(AssignmentView {
        recipient_id: recipient.id.clone(),
        recipient_name: recipient.display_name.clone(),
        wishes: recipient.wishes.clone(),
    }))
}

#[derive(Deserialize)]
struct WishesRequest {
    wishes: Vec<String>,
}

async fn get_wishes(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, ApiError> {
    let caller = caller_identity(&headers)?;
    let group = state
        .store
        .load(&group_id)
        .await?
        .ok_or(ApiError::GroupNotFound)?;
    let participant = group
        .participant(&caller.id)
        .ok_or(ApiError::Engine(SantaError::NotAParticipant))?;
    Ok(Json(participant.wishes.clone()))
}

async fn set_wishes(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<WishesRequest>,
) -> Result<Json<GroupView>, ApiError> {
    let caller = caller_identity(&headers)?;
    let wishes: Vec<String> = payload
        .wishes
        .iter()
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect();

    let command = GroupCommand::SetWishes {
        participant_id: caller.id,
        wishes,
    };
    let (group, events) = state.store.apply(&group_id, command, None).await?;

    state.broadcast(&group, events).await;
    Ok(Json(to_view(&group)))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((group_id, participant_id)): Path<(String, String)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, group_id, participant_id))
}

async fn handle_socket(stream: WebSocket, state: AppState, group_id: String, participant_id: String) {
    let (mut sender, mut receiver) = stream.split();

    let snapshot = match state.store.load(&group_id).await {
        Ok(Some(group)) if group.is_member(&participant_id) => to_view(&group),
        _ => {
            let _ = sender
                .send(Message::Text("unknown group or participant".into()))
                .await;
            return;
        }
    };

    let mut rx = state.channel_for(&group_id).await.subscribe();

    let Ok(text) = serde_json::to_string(&ServerMessage::State(snapshot)) else {
        return;
    };
    if sender.send(Message::Text(text)).await.is_err() {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Clients only listen on this socket; drain frames until they hang up.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_)) = receiver.next().await {}
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_app() -> Router {
        app(AppState::new(Arc::new(MemoryStore::default())))
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: Method, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder
                .header("x-user-id", user)
                .header("x-user-name", user);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn create_group_as(app: &Router, user: &str) -> String {
        let res = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/group",
                Some(user),
                Some(serde_json::json!({ "name": "office party", "budget": 25.0, "currency": "EUR" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        json_body(res).await["id"].as_str().unwrap().to_string()
    }

    async fn join_as(app: &Router, group_id: &str, user: &str) -> axum::response::Response {
        app.clone()
            .oneshot(request(
                Method::POST,
                &format!("/group/{group_id}/join"),
                Some(user),
                None,
            ))
            .await
            .unwrap()
    }

    async fn shuffle_as(
        app: &Router,
        group_id: &str,
        user: &str,
        seed: Option<u64>,
    ) -> axum::response::Response {
        let uri = match seed {
            Some(seed) => format!("/group/{group_id}/shuffle?seed={seed}"),
            None => format!("/group/{group_id}/shuffle"),
        };
        app.clone()
            .oneshot(request(Method::POST, &uri, Some(user), None))
            .await
            .unwrap()
    }

    async fn assignment_of(app: &Router, group_id: &str, user: &str) -> Value {
        let res = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/group/{group_id}/assignment"),
                Some(user),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        json_body(res).await
    }

    #[tokio::test]
    async fn create_group_makes_the_caller_admin() {
        let app = test_app();
        let res = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/group",
                Some("alice"),
                Some(serde_json::json!({ "name": "family draw" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;

        assert!(body["id"].as_str().is_some());
        assert_eq!(body["shuffled"], false);
        let participants = body["participants"].as_array().unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0]["id"], "alice");
        assert_eq!(participants[0]["is_admin"], true);
    }

    #[tokio::test]
    async fn create_group_requires_identity_and_name() {
        let app = test_app();
        let res = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/group",
                None,
                Some(serde_json::json!({ "name": "family draw" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/group",
                Some("alice"),
                Some(serde_json::json!({ "name": "   " })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn join_is_idempotent_and_preserves_order() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;

        assert_eq!(join_as(&app, &group_id, "bob").await.status(), StatusCode::OK);
        assert_eq!(
            join_as(&app, &group_id, "carol").await.status(),
            StatusCode::OK
        );

        // Re-join via the same invite: same view, nothing appended.
        let res = join_as(&app, &group_id, "bob").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        let ids: Vec<&str> = body["participants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn join_unknown_group_is_not_found() {
        let app = test_app();
        let res = join_as(&app, "no-such-invite", "bob").await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn shuffle_is_admin_gated_and_needs_three() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;
        join_as(&app, &group_id, "bob").await;

        let res = shuffle_as(&app, &group_id, "bob", None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = shuffle_as(&app, &group_id, "mallory", None).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = shuffle_as(&app, &group_id, "alice", None).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        join_as(&app, &group_id, "carol").await;
        let res = shuffle_as(&app, &group_id, "alice", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["shuffled"], true);
    }

    #[tokio::test]
    async fn seeded_shuffle_matches_core_draw() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;
        join_as(&app, &group_id, "bob").await;
        join_as(&app, &group_id, "carol").await;

        let res = shuffle_as(&app, &group_id, "alice", Some(42)).await;
        assert_eq!(res.status(), StatusCode::OK);

        let ids: Vec<String> = vec!["alice".into(), "bob".into(), "carol".into()];
        let expected =
            santa_core::compute_assignment(&ids, &mut ChaCha8Rng::seed_from_u64(42)).unwrap();

        for giver in &ids {
            let body = assignment_of(&app, &group_id, giver).await;
            assert_eq!(body["recipient_id"].as_str().unwrap(), expected[giver]);
        }
    }

    #[tokio::test]
    async fn join_after_shuffle_is_locked() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;
        join_as(&app, &group_id, "bob").await;
        join_as(&app, &group_id, "carol").await;
        shuffle_as(&app, &group_id, "alice", None).await;

        let res = join_as(&app, &group_id, "dave").await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        // Existing members still get the idempotent no-op.
        let res = join_as(&app, &group_id, "bob").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["participants"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn assignment_query_lifecycle() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;
        join_as(&app, &group_id, "bob").await;
        join_as(&app, &group_id, "carol").await;

        // Before the draw: a distinct "not yet" condition.
        let res = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/group/{group_id}/assignment"),
                Some("alice"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        // Non-members get told apart from "not drawn yet".
        let res = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/group/{group_id}/assignment"),
                Some("mallory"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        // Recipient wishes travel with the reveal.
        let res = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/group/{group_id}/wishes"),
                Some("bob"),
                Some(serde_json::json!({ "wishes": ["wool socks", "  ", "coffee"] })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        shuffle_as(&app, &group_id, "alice", None).await;

        let first = assignment_of(&app, &group_id, "alice").await;
        assert_ne!(first["recipient_id"].as_str().unwrap(), "alice");
        if first["recipient_id"] == "bob" {
            assert_eq!(
                first["wishes"],
                serde_json::json!(["wool socks", "coffee"])
            );
        }

        // Frozen: repeated reads return the same edge.
        let second = assignment_of(&app, &group_id, "alice").await;
        assert_eq!(first["recipient_id"], second["recipient_id"]);
    }

    #[tokio::test]
    async fn second_shuffle_is_a_noop_returning_frozen_state() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;
        join_as(&app, &group_id, "bob").await;
        join_as(&app, &group_id, "carol").await;

        shuffle_as(&app, &group_id, "alice", Some(1)).await;
        let before = assignment_of(&app, &group_id, "alice").await;

        // Admin double-tap: 200 with the existing state, not an error.
        let res = shuffle_as(&app, &group_id, "alice", Some(2)).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["shuffled"], true);

        let after = assignment_of(&app, &group_id, "alice").await;
        assert_eq!(before["recipient_id"], after["recipient_id"]);
    }

    #[tokio::test]
    async fn wishes_stay_editable_after_shuffle() {
        let app = test_app();
        let group_id = create_group_as(&app, "alice").await;
        join_as(&app, &group_id, "bob").await;
        join_as(&app, &group_id, "carol").await;
        shuffle_as(&app, &group_id, "alice", None).await;

        let res = app
            .clone()
            .oneshot(request(
                Method::PUT,
                &format!("/group/{group_id}/wishes"),
                Some("carol"),
                Some(serde_json::json!({ "wishes": ["a red scarf"] })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/group/{group_id}/wishes"),
                Some("carol"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await, serde_json::json!(["a red scarf"]));
    }

    #[tokio::test]
    async fn list_groups_returns_only_memberships() {
        let app = test_app();
        let first = create_group_as(&app, "alice").await;
        let _other = create_group_as(&app, "zoe").await;
        join_as(&app, &first, "bob").await;

        let res = app
            .clone()
            .oneshot(request(Method::GET, "/groups", Some("bob"), None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        let groups = body.as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["id"].as_str().unwrap(), first);
    }
}
