//! REST persistence side of the chat: save, fetch history, mark read.
//!
//! The live channel never calls into this module. A client that sends a
//! message emits it live and POSTs it here independently.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{AuthKey, AuthUser};
use crate::error::ChatError;
use crate::input::{SendMessageInput, ValidateExt};
use crate::model::{Message, UserId};
use crate::store::MessageStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: MessageStore,
    pub auth: AuthKey,
}

impl FromRef<ApiState> for AuthKey {
    fn from_ref(state: &ApiState) -> Self {
        state.auth.clone()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkReadOut {
    pub updated: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/chat", post(send_message))
        .route("/api/chat/:receiver_id", get(get_messages))
        .route("/api/chat/read/:sender_id", put(mark_as_read))
        .with_state(state)
}

pub async fn health() -> Json<HealthOut> {
    Json(HealthOut {
        status: "ok",
        service: "ColdStart realtime backend",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn send_message(
    State(state): State<ApiState>,
    AuthUser(sender): AuthUser,
    payload: Result<Json<SendMessageInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Message>), ChatError> {
    let Json(input) = payload?;
    input.validate_input()?;
    let receiver = UserId::parse(&input.receiver_id)?;

    let message = state.store.append(&sender, &receiver, &input.content).await?;
    info!(id = %message.id, sender = %sender, receiver = %receiver, "Message persisted");
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_messages(
    State(state): State<ApiState>,
    AuthUser(me): AuthUser,
    Path(receiver_id): Path<String>,
) -> Result<Json<Vec<Message>>, ChatError> {
    let peer = UserId::parse(&receiver_id)?;
    let history = state.store.history(&me, &peer).await?;
    Ok(Json(history))
}

pub async fn mark_as_read(
    State(state): State<ApiState>,
    AuthUser(me): AuthUser,
    Path(sender_id): Path<String>,
) -> Result<Json<MarkReadOut>, ChatError> {
    let sender = UserId::parse(&sender_id)?;
    let updated = state.store.mark_read(&me, &sender).await?;
    Ok(Json(MarkReadOut { updated }))
}
