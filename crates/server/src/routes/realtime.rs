//! Real-time chat endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use groupcast_shared::{is_blank, ConnectedUser, ConnectionId};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::realtime::chat::ANONYMOUS;
use crate::realtime::FrameStream;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGroupRequest {
    pub connection_id: ConnectionId,
    pub group: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGroupResponse {
    pub group: String,
    pub member_count: usize,
    pub connected_users: Vec<ConnectedUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveGroupRequest {
    pub connection_id: ConnectionId,
    pub group: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupMessageRequest {
    pub group_id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeRequest {
    pub connection_id_to_poke: ConnectionId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineQuery {
    pub group_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineMembersResponse {
    pub group_id: String,
    pub user_ids: Vec<String>,
}

async fn display_name(state: &AppState, auth_user: &AuthUser) -> String {
    state
        .users
        .display_name(&auth_user.user_id)
        .await
        .filter(|name| !is_blank(name))
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

/// Open the caller's event stream
pub async fn connect(
    State(state): State<AppState>,
    auth_user: Option<Extension<AuthUser>>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth_user.map(|Extension(user)| user.user_id);
    let stream = FrameStream::open(&state.registry, user_id).await?;

    tracing::debug!(connection_id = %stream.connection_id(), "Event stream opened");

    Ok(stream.into_sse(state.config.sse_keep_alive))
}

/// Add a connection to a chat room and announce the new member list
pub async fn join(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<JoinGroupRequest>,
) -> ApiResult<Json<JoinGroupResponse>> {
    if !state.rooms.room_exists(&request.group).await {
        return Err(ApiError::Validation("Room does not exist".to_string()));
    }

    let name = display_name(&state, &auth_user).await;
    let outcome = state
        .chat
        .join(&request.connection_id, &request.group, &name)
        .await?;

    Ok(Json(JoinGroupResponse {
        member_count: outcome.connected_users.len(),
        connected_users: outcome.connected_users,
        group: request.group,
    }))
}

pub async fn leave(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
    Json(request): Json<LeaveGroupRequest>,
) -> ApiResult<StatusCode> {
    state
        .chat
        .leave(&request.connection_id, &request.group)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Publish a chat message to a room
pub async fn send(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<SendGroupMessageRequest>,
) -> ApiResult<StatusCode> {
    if is_blank(&request.group_id) {
        return Err(ApiError::Validation("groupId is required".to_string()));
    }

    let name = display_name(&state, &auth_user).await;
    let recipients = state
        .chat
        .send_message(&request.group_id, &name, &request.message)
        .await?;

    tracing::debug!(group = %request.group_id, recipients, "Chat message published");
    Ok(StatusCode::ACCEPTED)
}

/// Send a direct poke to one connection
pub async fn poke(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<PokeRequest>,
) -> ApiResult<StatusCode> {
    let name = display_name(&state, &auth_user).await;
    let delivered = state
        .chat
        .poke(&request.connection_id_to_poke, &name)
        .await?;

    tracing::debug!(
        connection_id = %request.connection_id_to_poke,
        delivered,
        "Poke published"
    );
    Ok(StatusCode::ACCEPTED)
}

/// User ids of the authenticated members currently in a room
pub async fn online(
    State(state): State<AppState>,
    Query(query): Query<OnlineQuery>,
) -> ApiResult<Json<OnlineMembersResponse>> {
    if is_blank(&query.group_id) {
        return Err(ApiError::Validation("groupId is required".to_string()));
    }

    let user_ids = state.chat.online_users(&query.group_id).await?;
    Ok(Json(OnlineMembersResponse {
        group_id: query.group_id,
        user_ids,
    }))
}
