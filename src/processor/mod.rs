//! The `processor` module defines the subscriber side of the hub.
//!
//! A processor is anything that can consume messages: a server-push HTTP
//! response, a WebSocket connection, or the dispatcher hook. The broker never
//! sees the processor itself. It holds a [`ProcessorHandle`] (id, mailbox
//! sender, done signal), while the transport drives the matching [`Mailbox`]
//! through [`run`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::utils::error::ProcessorError;

pub type ProcessorId = String;

/// Fresh id for a connection whose identity is assigned by the server.
pub fn new_processor_id() -> ProcessorId {
    Uuid::new_v4().to_string()
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn id(&self) -> &str;

    /// Deliver one message to the consumer.
    async fn process(&self, message: &Message) -> Result<(), ProcessorError>;

    /// Release transport resources. Called exactly once, when the run loop stops.
    async fn handle_close(&self);
}

/// The broker-facing half of a processor.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    id: ProcessorId,
    mailbox: mpsc::Sender<Arc<Message>>,
    done: CancellationToken,
}

impl ProcessorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Fire the done signal; the run loop stops at its next select.
    pub fn close(&self) {
        self.done.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Non-blocking enqueue used by the broker's fan-out.
    pub(crate) fn try_deliver(
        &self,
        message: Arc<Message>,
    ) -> Result<(), TrySendError<Arc<Message>>> {
        self.mailbox.try_send(message)
    }
}

/// The consumer-facing half of a processor.
#[derive(Debug)]
pub struct Mailbox {
    messages: mpsc::Receiver<Arc<Message>>,
    done: CancellationToken,
}

impl Mailbox {
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.messages.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.messages.try_recv().ok()
    }

    pub fn done(&self) -> &CancellationToken {
        &self.done
    }
}

/// Create the handle/mailbox pair for processor `id`, with room for `capacity`
/// undelivered messages.
pub fn mailbox(id: impl Into<ProcessorId>, capacity: usize) -> (ProcessorHandle, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let done = CancellationToken::new();
    let handle = ProcessorHandle {
        id: id.into(),
        mailbox: tx,
        done: done.clone(),
    };
    (handle, Mailbox { messages: rx, done })
}

/// Drive `processor` until its done signal fires, its mailbox is closed, or
/// `process` fails. `handle_close` runs exactly once on the way out and the
/// done signal is left fired.
pub async fn run<P>(processor: &P, mut mailbox: Mailbox) -> Result<(), ProcessorError>
where
    P: Processor + ?Sized,
{
    debug!(processor = processor.id(), "running processor");

    let result = loop {
        tokio::select! {
            biased;
            _ = mailbox.done.cancelled() => break Ok(()),
            message = mailbox.messages.recv() => match message {
                Some(message) => {
                    if let Err(err) = processor.process(&message).await {
                        warn!(processor = processor.id(), error = %err, "failed to process message");
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
        }
    };

    processor.handle_close().await;
    mailbox.done.cancel();
    debug!(processor = processor.id(), "processor stopped");
    result
}

#[cfg(test)]
mod tests;
