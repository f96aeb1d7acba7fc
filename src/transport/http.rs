//! HTTP surface of a node
//!
//! Routes:
//! - `GET /connect`: server-push processor (see `server_push`)
//! - `POST /subscribe`, `POST /unsubscribe`: manage a processor's subscriptions
//! - `GET /topics`, `POST /topics`, `DELETE /topics/{topic}`: topic management
//! - `POST /publish`: publish a message on this node
//! - `POST /dispatch`: ingress for messages forwarded by peers (only mounted
//!   when the dispatcher is enabled)
//! - `GET /health`
//!
//! Request bodies are read as raw bytes and decoded with `serde_json` so that
//! every malformed body gets the same `400 {error}` reply.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::broker::message::{Message, MessageId};
use crate::broker::{Broker, Topic};
use crate::config::Settings;
use crate::dispatcher::{DISPATCH_PATH, DispatchRequest, Dispatcher};
use crate::processor::ProcessorId;
use crate::transport::server_push;
use crate::utils::error::{DispatchError, HubError};

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub dispatcher: Option<Dispatcher>,
    pub settings: Arc<Settings>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    BadRequest(#[from] serde_json::Error),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Hub(err) => match err {
                HubError::ProcessorNotRegistered(_) | HubError::ReservedTopic(_) => {
                    StatusCode::BAD_REQUEST
                }
                HubError::TopicNotFound(_) => StatusCode::NOT_FOUND,
                HubError::TopicAlreadyExists(_)
                | HubError::AlreadySubscribed { .. }
                | HubError::NotSubscribed { .. } => StatusCode::CONFLICT,
                HubError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                HubError::ProcessorAlreadyRegistered(_)
                | HubError::Storage(_)
                | HubError::CloseFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = %status, error = %self, "request failed");
        } else {
            debug!(status = %status, error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub topic: String,
    pub processor: ProcessorId,
}

#[derive(Debug, Deserialize)]
pub struct CreateTopicRequest {
    pub topic: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: MessageId,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/connect", get(server_push::connect))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .route("/topics", get(list_topics).post(create_topic))
        .route("/topics/{topic}", delete(delete_topic))
        .route("/publish", post(publish));

    if state.dispatcher.is_some() {
        router = router.route(DISPATCH_PATH, post(dispatch));
    }

    router.with_state(state)
}

/// Serve the HTTP API on an already bound listener until the server stops.
pub async fn serve_http(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn subscribe(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: SubscriptionRequest = parse(&body)?;
    state
        .broker
        .subscribe(&request.processor, request.topic.as_str())
        .await?;
    Ok(Json(json!({ "subscription": request })))
}

async fn unsubscribe(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: SubscriptionRequest = parse(&body)?;
    state
        .broker
        .unsubscribe(&request.processor, request.topic.as_str())
        .await?;
    Ok(Json(json!({ "unsubscription": request })))
}

async fn list_topics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut topics = state.broker.topics().await?;
    topics.sort();
    Ok(Json(json!({ "topics": topics })))
}

async fn create_topic(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: CreateTopicRequest = parse(&body)?;
    let topic = Topic::new(&request.topic);
    state.broker.create_topic(topic.clone()).await?;
    Ok((StatusCode::CREATED, Json(json!({ "topic": topic }))))
}

async fn delete_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.broker.delete_topic(topic.as_str()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn publish(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    let request: PublishRequest = parse(&body)?;
    let message = Message::new(request.topic.as_str(), request.kind, request.payload);
    let id = message.id;
    state.broker.publish(message).await?;
    Ok(Json(PublishResponse { id }))
}

async fn dispatch(State(state): State<AppState>, body: Bytes) -> Response {
    let request: DispatchRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return ApiError::from(err).into_response(),
    };

    let Some(dispatcher) = state.dispatcher else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match dispatcher.ingest(request.message).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(DispatchError::Hub(err @ HubError::ReservedTopic(_))) => {
            ApiError::from(err).into_response()
        }
        Err(err) => {
            warn!(error = %err, "failed to ingest dispatched message");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
