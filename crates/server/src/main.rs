use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use engine::SyncEngine;
use shared::{
    domain::{GroupId, MessageId, UserId},
    protocol::{ClientFrame, GroupSummary, MessagePayload},
};
use store::Store;
use tracing::{error, info, warn};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    store: Store,
    engine: Arc<SyncEngine>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorBody>)>;

fn internal(error: impl std::fmt::Display) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

fn refused(status: StatusCode, message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PresenceResponse {
    user_id: i64,
    is_online: bool,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    user_id: i64,
    name: String,
    #[serde(default)]
    member_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
    user_id: i64,
    member_id: i64,
}

#[derive(Debug, Deserialize)]
struct ContactRequest {
    user_id: i64,
    contact_id: i64,
}

#[derive(Debug, Deserialize)]
struct BlockRequest {
    user_id: i64,
    blocked_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let store = Store::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let engine = SyncEngine::new(store.clone(), settings.engine_config());

    let state = AppState { store, engine };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/presence/:user_id", get(http_presence))
        .route("/history/direct/:peer_id", get(http_history_direct))
        .route("/history/group/:group_id", get(http_history_group))
        .route("/groups", post(http_create_group))
        .route("/groups/:group_id", delete(http_delete_group))
        .route("/groups/:group_id/members", post(http_add_member))
        .route(
            "/groups/:group_id/members/:member_id",
            delete(http_remove_member),
        )
        .route("/contacts", post(http_add_contact))
        .route("/blocks", post(http_add_block))
        .route("/blocks/:blocked_id", delete(http_remove_block))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.store.health_check().await.map_err(internal)?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(refused(StatusCode::BAD_REQUEST, "username cannot be empty"));
    }
    let user_id = state
        .store
        .create_user(username)
        .await
        .map_err(|e| refused(StatusCode::BAD_REQUEST, &e.to_string()))?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_presence(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> ApiResult<Json<PresenceResponse>> {
    let record = state
        .engine
        .presence
        .snapshot(UserId(user_id))
        .await
        .map_err(internal)?;
    Ok(Json(PresenceResponse {
        user_id: record.user_id.0,
        is_online: record.is_online,
        last_seen: record.last_seen,
    }))
}

async fn http_history_direct(
    State(state): State<Arc<AppState>>,
    Path(peer_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<MessagePayload>>> {
    let limit = q.limit.unwrap_or(100).clamp(1, 200);
    let messages = state
        .store
        .history_direct(
            UserId(q.user_id),
            UserId(peer_id),
            limit,
            q.before.map(MessageId),
        )
        .await
        .map_err(internal)?;
    Ok(Json(
        messages.into_iter().map(|m| m.into_payload()).collect(),
    ))
}

async fn http_history_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<MessagePayload>>> {
    let group_id = GroupId(group_id);
    let members = state
        .store
        .group_members(group_id)
        .await
        .map_err(internal)?;
    if !members.contains(&UserId(q.user_id)) {
        return Err(refused(StatusCode::FORBIDDEN, "user is not a member"));
    }
    let limit = q.limit.unwrap_or(100).clamp(1, 200);
    let messages = state
        .store
        .history_group(group_id, limit, q.before.map(MessageId))
        .await
        .map_err(internal)?;
    Ok(Json(
        messages.into_iter().map(|m| m.into_payload()).collect(),
    ))
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<Json<GroupSummary>> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(refused(StatusCode::BAD_REQUEST, "group name cannot be empty"));
    }
    let owner = UserId(req.user_id);
    let members: Vec<UserId> = req.member_ids.iter().copied().map(UserId).collect();
    let group_id = state
        .store
        .create_group(name, owner, &members)
        .await
        .map_err(internal)?;
    if let Err(error) = state.engine.groups.notify_created(group_id).await {
        warn!(group_id = group_id.0, %error, "group created broadcast failed");
    }
    let summary = state
        .engine
        .groups
        .summary(group_id)
        .await
        .map_err(internal)?;
    Ok(Json(summary))
}

async fn http_delete_group(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<StatusCode> {
    let group_id = GroupId(group_id);
    let summary = state
        .store
        .group_summary(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| refused(StatusCode::NOT_FOUND, "group not found"))?;
    if summary.owner_id != UserId(q.user_id) {
        return Err(refused(
            StatusCode::FORBIDDEN,
            "only the owner can delete a group",
        ));
    }
    // broadcast to the final roster before tombstoning the id
    if let Err(error) = state.engine.groups.notify_deleted(group_id).await {
        warn!(group_id = group_id.0, %error, "group deleted broadcast failed");
    }
    state.store.delete_group(group_id).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_add_member(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<i64>,
    Json(req): Json<MemberRequest>,
) -> ApiResult<StatusCode> {
    let group_id = GroupId(group_id);
    authorize_owner(&state, group_id, UserId(req.user_id)).await?;
    if !state
        .store
        .user_exists(UserId(req.member_id))
        .await
        .map_err(internal)?
    {
        return Err(refused(StatusCode::NOT_FOUND, "user not found"));
    }
    state
        .store
        .add_group_member(group_id, UserId(req.member_id))
        .await
        .map_err(internal)?;
    if let Err(error) = state.engine.groups.notify_updated(group_id).await {
        warn!(group_id = group_id.0, %error, "group updated broadcast failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_member(
    State(state): State<Arc<AppState>>,
    Path((group_id, member_id)): Path<(i64, i64)>,
    Query(q): Query<UserQuery>,
) -> ApiResult<StatusCode> {
    let group_id = GroupId(group_id);
    // members may leave on their own; evicting someone else takes the owner
    if q.user_id != member_id {
        authorize_owner(&state, group_id, UserId(q.user_id)).await?;
    }
    state
        .store
        .remove_group_member(group_id, UserId(member_id))
        .await
        .map_err(internal)?;
    // the removed member no longer receives the roster update
    if let Err(error) = state.engine.groups.notify_updated(group_id).await {
        warn!(group_id = group_id.0, %error, "group updated broadcast failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn authorize_owner(
    state: &AppState,
    group_id: GroupId,
    user_id: UserId,
) -> Result<(), (StatusCode, Json<ErrorBody>)> {
    let summary = state
        .store
        .group_summary(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| refused(StatusCode::NOT_FOUND, "group not found"))?;
    if summary.owner_id != user_id {
        return Err(refused(
            StatusCode::FORBIDDEN,
            "only the owner can change the roster",
        ));
    }
    Ok(())
}

async fn http_add_contact(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContactRequest>,
) -> ApiResult<StatusCode> {
    if !state
        .store
        .user_exists(UserId(req.contact_id))
        .await
        .map_err(internal)?
    {
        return Err(refused(StatusCode::NOT_FOUND, "user not found"));
    }
    state
        .store
        .add_contact(UserId(req.user_id), UserId(req.contact_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_add_block(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BlockRequest>,
) -> ApiResult<StatusCode> {
    state
        .store
        .add_block(UserId(req.user_id), UserId(req.blocked_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_remove_block(
    State(state): State<Arc<AppState>>,
    Path(blocked_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> ApiResult<StatusCode> {
    state
        .store
        .remove_block(UserId(q.user_id), UserId(blocked_id))
        .await
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();

    // the channel is anonymous until the client identifies itself
    let identity = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Register { identity }) => break identity,
                Ok(_) => {
                    warn!("frame before registration dropped");
                }
                Err(error) => {
                    warn!(%error, "malformed frame before registration");
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(_)) => return,
        }
    };

    match state.store.user_exists(identity).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(user_id = identity.0, "registration for unknown identity");
            return;
        }
        Err(error) => {
            error!(user_id = identity.0, %error, "identity lookup failed");
            return;
        }
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let guard = state.engine.attach(identity, tx).await;
    info!(user_id = identity.0, "session registered");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => state.engine.dispatch(identity, frame).await,
                Err(error) => {
                    warn!(user_id = identity.0, %error, "malformed frame skipped");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(user_id = identity.0, "session closed");
    drop(guard);
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
