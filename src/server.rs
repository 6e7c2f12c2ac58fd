//! HTTP command surface and the WebSocket subscriber channel.
//!
//! Thin plumbing only: routes parse the request, call into the session store
//! or group service, and map the error taxonomy onto status codes. Member and
//! admin lists arrive as comma-separated strings and are split here, never
//! deeper in.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::broadcast::{BroadcastEvent, BroadcastHub};
use crate::client::ClientFactory;
use crate::service::{GroupError, GroupService};
use crate::session::{SessionError, SessionStore};
use crate::signer::ChallengeSigner;
use crate::types::{Conversation, ConversationSummary, GroupMessage, MetadataPatch};

pub struct AppState<F: ClientFactory> {
    pub store: Arc<SessionStore<F>>,
    pub service: Arc<GroupService<F>>,
    pub signer: Arc<ChallengeSigner>,
    pub hub: BroadcastHub,
}

impl<F: ClientFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        AppState {
            store: self.store.clone(),
            service: self.service.clone(),
            signer: self.signer.clone(),
            hub: self.hub.clone(),
        }
    }
}

/// Uniform error body: status code, human-readable message, and for partial
/// metadata failures the list of fields that were already applied.
struct ApiError {
    status: StatusCode,
    message: String,
    applied: Option<Vec<&'static str>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = match self.applied {
            Some(applied) => serde_json::json!({ "error": self.message, "applied": applied }),
            None => serde_json::json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::InvalidSignature => StatusCode::UNAUTHORIZED,
            SessionError::AlreadyRegistered => StatusCode::CONFLICT,
            SessionError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        ApiError {
            status,
            message: err.to_string(),
            applied: None,
        }
    }
}

impl From<GroupError> for ApiError {
    fn from(err: GroupError) -> Self {
        let status = match &err {
            GroupError::NotRegistered => StatusCode::PRECONDITION_FAILED,
            GroupError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            GroupError::UnreachableMembers | GroupError::NotAMember(_) => StatusCode::BAD_REQUEST,
            GroupError::PartialMetadataUpdate { .. } | GroupError::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        let applied = match &err {
            GroupError::PartialMetadataUpdate { applied, .. } => Some(applied.clone()),
            _ => None,
        };
        ApiError {
            status,
            message: err.to_string(),
            applied,
        }
    }
}

fn split_csv(value: Option<String>) -> Vec<String> {
    value
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupClientRequest {
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterClientRequest {
    address: String,
    signature: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest {
    address: String,
    members: String,
    group_name: Option<String>,
    description: Option<String>,
    image_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateGroupRequest {
    address: String,
    group_id: String,
    name: Option<String>,
    description: Option<String>,
    image_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateGroupMembersRequest {
    address: String,
    group_id: String,
    add_members: Option<String>,
    remove_members: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateGroupAdminsRequest {
    address: String,
    group_id: String,
    add_admins: Option<String>,
    remove_admins: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    address: String,
    group_id: String,
    message_content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListConversationsRequest {
    address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Confirmation {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupResponse {
    group_id: String,
    conversation: Conversation,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateGroupResponse {
    message: String,
    applied: Vec<&'static str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    group_id: String,
    message: GroupMessage,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConversationsResponse {
    conversations: Vec<ConversationSummary>,
}

async fn setup_client<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<SetupClientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state.store.open_session(&req.address).await?;
    Ok(Json(info))
}

async fn register_client<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<RegisterClientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .complete_registration(&req.address, &req.signature)
        .await?;
    Ok(Json(Confirmation {
        message: "Client registered successfully".to_string(),
    }))
}

async fn register_client_default<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<SetupClientRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .default_registration(&req.address, &state.signer)
        .await?;
    Ok(Json(Confirmation {
        message: "Client registered successfully".to_string(),
    }))
}

async fn create_group<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = MetadataPatch {
        name: req.group_name,
        description: req.description,
        image_url: req.image_url,
    };
    let conversation = state
        .service
        .create_group(&req.address, split_csv(Some(req.members)), patch)
        .await?;
    Ok(Json(CreateGroupResponse {
        group_id: conversation.id.clone(),
        conversation,
    }))
}

async fn update_group<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = MetadataPatch {
        name: req.name,
        description: req.description,
        image_url: req.image_url,
    };
    let applied = state
        .service
        .update_group_metadata(&req.address, &req.group_id, patch)
        .await?;
    Ok(Json(UpdateGroupResponse {
        message: "Group details updated successfully".to_string(),
        applied,
    }))
}

async fn update_group_members<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<UpdateGroupMembersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .update_group_members(
            &req.address,
            &req.group_id,
            split_csv(req.add_members),
            split_csv(req.remove_members),
        )
        .await?;
    Ok(Json(Confirmation {
        message: "Group members updated successfully".to_string(),
    }))
}

async fn update_group_admins<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<UpdateGroupAdminsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .service
        .update_group_admins(
            &req.address,
            &req.group_id,
            split_csv(req.add_admins),
            split_csv(req.remove_admins),
        )
        .await?;
    Ok(Json(Confirmation {
        message: "Group admins updated successfully".to_string(),
    }))
}

async fn send_message<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .service
        .send_message(&req.address, &req.group_id, &req.message_content)
        .await?;
    Ok(Json(SendMessageResponse {
        group_id: req.group_id,
        message,
    }))
}

async fn list_conversations<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Json(req): Json<ListConversationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.service.list_conversations(&req.address).await?;
    Ok(Json(ConversationsResponse { conversations }))
}

async fn list_messages<F: ClientFactory>(
    State(state): State<AppState<F>>,
    Path(group_id): Path<String>,
    Json(req): Json<ListConversationsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .service
        .list_messages(&req.address, &group_id)
        .await?;
    Ok(Json(messages))
}

/// Debug probe for the fan-out channel.
async fn test_new_msg<F: ClientFactory>(State(state): State<AppState<F>>) -> impl IntoResponse {
    state.hub.emit(BroadcastEvent::MessageStream {
        message: GroupMessage {
            sender: "system".to_string(),
            content: "Test message sent!".to_string(),
            sent_at_ns: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        },
    });
    "Test message sent."
}

async fn ws_handler<F: ClientFactory>(
    State(state): State<AppState<F>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| subscriber_loop(socket, state.hub.clone()))
}

/// Relay hub events to one WebSocket subscriber until either side goes away.
/// Inbound frames are ignored; this channel is broadcast-only.
async fn subscriber_loop(socket: WebSocket, hub: BroadcastHub) {
    let mut subscriber = hub.subscribe();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let greeting = match serde_json::to_string(&BroadcastEvent::Connection) {
        Ok(greeting) => greeting,
        Err(_) => return,
    };
    if ws_sender.send(WsMessage::Text(greeting)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if ws_sender.send(WsMessage::Text(payload)).await.is_err() {
                    break;
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(frame)) => {
                        debug!("Ignoring inbound frame from subscriber {}: {frame:?}", subscriber.id());
                    }
                }
            }
        }
    }
}

pub fn router<F: ClientFactory>(state: AppState<F>) -> Router {
    Router::new()
        .route("/setupClient", post(setup_client::<F>))
        .route("/registerClient", post(register_client::<F>))
        .route("/registerClientDefault", post(register_client_default::<F>))
        .route("/createGroup", post(create_group::<F>))
        .route("/updateGroup", post(update_group::<F>))
        .route("/updateGroupMembers", post(update_group_members::<F>))
        .route("/updateGroupAdmins", post(update_group_admins::<F>))
        .route("/sendMessage", post(send_message::<F>))
        .route("/conversations", post(list_conversations::<F>))
        .route("/:id/messages", post(list_messages::<F>))
        .route("/testnewmsg", get(test_new_msg::<F>))
        .route("/ws", get(ws_handler::<F>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve<F: ClientFactory>(port: u16, state: AppState<F>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server running on port {port}");
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .await?;
    Ok(())
}
