//! WebSocket transport
//!
//! This file implements the bidirectional processor. Responsibilities:
//! - Accept TCP/WebSocket connections and give each one a fresh processor id
//! - Register a `SocketProcessor` with the `Broker` and push every mailbox
//!   message to the client as one JSON text frame
//! - Read `SUB` / `UNSUB` control frames on a separate task and turn them into
//!   broker calls on the processor's own behalf
//! - Tear everything down once, whichever side goes away first

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::broker::message::Message;
use crate::config::Settings;
use crate::processor::{self, Processor, ProcessorId, new_processor_id};
use crate::transport::message::{ControlFrame, encode};
use crate::utils::error::{HubError, ProcessorError};

pub struct SocketProcessor<S> {
    id: ProcessorId,
    broker: Broker,
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    write_wait: Duration,
}

impl<S> SocketProcessor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: ProcessorId,
        broker: Broker,
        sink: SplitSink<WebSocketStream<S>, WsMessage>,
        write_wait: Duration,
    ) -> Self {
        Self {
            id,
            broker,
            sink: Mutex::new(sink),
            write_wait,
        }
    }
}

#[async_trait]
impl<S> Processor for SocketProcessor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&self, message: &Message) -> Result<(), ProcessorError> {
        let text = encode(message)?;
        let mut sink = self.sink.lock().await;
        match timeout(self.write_wait, sink.send(WsMessage::text(text))).await {
            Ok(sent) => sent.map_err(ProcessorError::from),
            Err(_) => Err(ProcessorError::WriteTimeout(self.write_wait)),
        }
    }

    async fn handle_close(&self) {
        info!(processor = %self.id, "closing websocket connection");
        {
            let mut sink = self.sink.lock().await;
            let _ = timeout(self.write_wait, sink.send(WsMessage::Close(None))).await;
            let _ = timeout(self.write_wait, sink.close()).await;
        }

        match self.broker.unregister_processor(&self.id).await {
            Ok(()) | Err(HubError::ProcessorNotRegistered(_)) | Err(HubError::Closed) => {}
            Err(err) => warn!(processor = %self.id, error = %err, "failed to unregister processor"),
        }
    }
}

/// Read control frames until the client goes away or `done` fires, then fire
/// `done` so the write side stops too.
pub async fn read_control_frames<S>(
    id: ProcessorId,
    broker: Broker,
    mut stream: SplitStream<WebSocketStream<S>>,
    done: CancellationToken,
    max_message_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = done.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if text.len() > max_message_size {
                    warn!(processor = %id, size = text.len(), "control frame exceeds size limit");
                    break;
                }
                handle_control_frame(&id, &broker, text.as_str().trim()).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!(processor = %id, "client closed the connection");
                break;
            }
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(processor = %id, error = %err, "websocket read failed");
                break;
            }
        }
    }

    done.cancel();
}

async fn handle_control_frame(id: &str, broker: &Broker, text: &str) {
    let result = match serde_json::from_str::<ControlFrame>(text) {
        Ok(ControlFrame::Subscribe { topic }) => broker.subscribe(id, topic).await,
        Ok(ControlFrame::Unsubscribe { topic }) => broker.unsubscribe(id, topic).await,
        Err(err) => {
            warn!(
                processor = %id,
                error = %err,
                frame = %text.chars().take(100).collect::<String>(),
                "invalid control frame"
            );
            return;
        }
    };

    if let Err(err) = result {
        warn!(processor = %id, error = %err, "control frame rejected by broker");
    }
}

/// Run one connection to completion.
pub async fn handle_connection<S>(ws_stream: WebSocketStream<S>, broker: Broker, settings: Arc<Settings>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = new_processor_id();
    let (handle, mailbox) = processor::mailbox(id.clone(), settings.broker.mailbox_capacity);
    let (ws_sender, ws_receiver) = ws_stream.split();
    let write_wait = Duration::from_millis(settings.websocket.write_wait_ms);
    let processor = SocketProcessor::new(id.clone(), broker.clone(), ws_sender, write_wait);

    // Register client before doing anything else
    if let Err(err) = broker.register_processor(handle.clone()).await {
        warn!(processor = %id, error = %err, "failed to register processor");
        processor.handle_close().await;
        return;
    }

    let reader = tokio::spawn(read_control_frames(
        id.clone(),
        broker,
        ws_receiver,
        handle.done().clone(),
        settings.websocket.max_message_size,
    ));

    if let Err(err) = processor::run(&processor, mailbox).await {
        warn!(processor = %id, error = %err, "websocket processor stopped on error");
    }

    let _ = reader.await;
    info!(processor = %id, "disconnected");
}

/// Accept WebSocket connections on `listener` until accepting fails.
pub async fn serve_websocket(listener: TcpListener, broker: Broker, settings: Arc<Settings>) {
    while let Ok((stream, peer)) = listener.accept().await {
        let broker = broker.clone();
        let settings = Arc::clone(&settings);

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "websocket handshake error");
                    return;
                }
            };
            handle_connection(ws_stream, broker, settings).await;
        });
    }
}
