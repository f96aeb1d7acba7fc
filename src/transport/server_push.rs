//! Server-push transport
//!
//! `GET /connect` keeps the HTTP response open and streams one JSON envelope
//! per line for as long as the client stays connected. The processor id is
//! assigned here and returned in the `processor-id` header, so the client can
//! manage its subscriptions through `/subscribe` and `/unsubscribe`.

use std::convert::Infallible;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{self, HeaderName};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::broker::message::Message;
use crate::processor::{self, Processor, ProcessorId, new_processor_id};
use crate::transport::http::{ApiError, AppState};
use crate::transport::message::encode;
use crate::utils::error::{HubError, ProcessorError};

pub const PROCESSOR_ID_HEADER: &str = "processor-id";

type Chunk = Result<Bytes, Infallible>;

pub struct ServerPushProcessor {
    id: ProcessorId,
    broker: Broker,
    body: Mutex<Option<mpsc::Sender<Chunk>>>,
}

impl ServerPushProcessor {
    pub fn new(id: ProcessorId, broker: Broker, body: mpsc::Sender<Chunk>) -> Self {
        Self {
            id,
            broker,
            body: Mutex::new(Some(body)),
        }
    }

    fn body(&self) -> Option<mpsc::Sender<Chunk>> {
        self.body.lock().ok().and_then(|body| body.clone())
    }
}

#[async_trait]
impl Processor for ServerPushProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&self, message: &Message) -> Result<(), ProcessorError> {
        let mut line = encode(message)?;
        line.push('\n');

        let body = self.body().ok_or(ProcessorError::Closed)?;
        body.send(Ok(Bytes::from(line)))
            .await
            .map_err(|_| ProcessorError::Closed)?;
        debug!(processor = %self.id, message = %message.id, "message sent");
        Ok(())
    }

    /// Ends the response body. The 200 status went out with the headers.
    async fn handle_close(&self) {
        if let Ok(mut body) = self.body.lock() {
            body.take();
        }

        match self.broker.unregister_processor(&self.id).await {
            Ok(()) | Err(HubError::ProcessorNotRegistered(_)) | Err(HubError::Closed) => {}
            Err(err) => warn!(processor = %self.id, error = %err, "failed to unregister processor"),
        }
        info!(processor = %self.id, "server-push connection closed");
    }
}

pub async fn connect(State(state): State<AppState>) -> Result<Response, ApiError> {
    let id = new_processor_id();
    let capacity = state.settings.broker.mailbox_capacity;
    let (body_tx, body_rx) = mpsc::channel::<Chunk>(capacity.max(1));
    let (handle, mailbox) = processor::mailbox(id.clone(), capacity);

    state.broker.register_processor(handle.clone()).await?;

    let processor = ServerPushProcessor::new(id.clone(), state.broker.clone(), body_tx.clone());

    // The body receiver is dropped when the client disconnects.
    let done = handle.done().clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = body_tx.closed() => done.cancel(),
            _ = done.cancelled() => {}
        }
    });

    tokio::spawn(async move {
        if let Err(err) = processor::run(&processor, mailbox).await {
            warn!(processor = processor.id(), error = %err, "server-push processor stopped on error");
        }
    });

    info!(processor = %id, "server-push client connected");
    let headers = [
        (header::CONTENT_TYPE, "application/x-ndjson".to_string()),
        (HeaderName::from_static(PROCESSOR_ID_HEADER), id),
    ];
    Ok((headers, Body::from_stream(ReceiverStream::new(body_rx))).into_response())
}
