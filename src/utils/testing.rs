//! Test doubles shared by the unit tests of several modules.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::message::Message;
use crate::processor::{Processor, ProcessorId};
use crate::utils::error::ProcessorError;

/// Poll `check` every 10ms for up to two seconds.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Processor that records what it is given.
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    pub id: ProcessorId,
    pub seen: Arc<Mutex<Vec<Message>>>,
    pub closes: Arc<AtomicUsize>,
    pub fail: bool,
}

impl RecordingProcessor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    /// A processor whose every `process` call fails.
    pub fn failing(id: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(id)
        }
    }

    pub fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&self, message: &Message) -> Result<(), ProcessorError> {
        if self.fail {
            return Err(ProcessorError::Closed);
        }
        self.seen.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn handle_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
