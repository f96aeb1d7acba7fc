//! The `dispatcher` module links the hubs of several nodes.
//!
//! A `Dispatcher` runs two independent tasks against its local broker:
//! - a tracker fed by the broker's subscription watch channel. The first local
//!   subscriber of a topic makes this node announce itself for that topic in
//!   the shared `PeerStore`, and the last one leaving retracts it. The channel
//!   is unbounded, so the count cannot drift while forwarding is slow.
//! - a hook that sees every published message. Each message on a non-internal
//!   topic is POSTed to the `/dispatch` endpoint of every other node announced
//!   for that topic. The calls run on their own task so the hook never waits
//!   on a peer.
//!
//! Messages received on `/dispatch` are republished locally. Their id is
//! remembered first so that the hook recognises them and does not send them
//! back out, which keeps a message from bouncing between nodes. When the
//! broker reports that the hook never got such a message, the mark is dropped
//! again.

pub mod peer_store;
pub mod sled_store;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::message::{ChangeKind, Message, MessageId};
use crate::broker::{Broker, SubscriptionEvent, Topic};
use crate::config::DispatcherSettings;
use crate::processor::{self, Processor, ProcessorId};
use crate::utils::error::{DispatchError, HubError, ProcessorError};

pub use peer_store::{InMemoryPeerStore, PeerInfo, PeerStore, TopicPeerMap};
pub use sled_store::SledPeerStore;

pub const DISPATCH_PATH: &str = "/dispatch";

/// Body of a `POST /dispatch` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub message: Message,
}

#[derive(Serialize)]
struct DispatchBody<'a> {
    message: &'a Message,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    local: PeerInfo,
    broker: Broker,
    store: Arc<dyn PeerStore>,
    client: reqwest::Client,
    hook_id: ProcessorId,
    /// Ids of messages received from a peer and not yet seen by the hook.
    foreign: Mutex<HashSet<MessageId>>,
    /// Local subscriber count per topic.
    interest: Mutex<HashMap<Topic, usize>>,
    forwarded: AtomicU64,
    shutdown: CancellationToken,
    tracker: Mutex<Option<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    /// Hook into `broker` and start forwarding. Start the dispatcher before
    /// any processor subscribes, so that no subscription goes uncounted.
    pub async fn start(
        broker: Broker,
        store: Arc<dyn PeerStore>,
        local: PeerInfo,
        settings: &DispatcherSettings,
    ) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.forward_timeout_ms))
            .build()
            .map_err(DispatchError::Client)?;

        let hook_id = format!("dispatcher-{}", Uuid::new_v4());
        let inner = Arc::new(Inner {
            local,
            broker,
            store,
            client,
            hook_id: hook_id.clone(),
            foreign: Mutex::new(HashSet::new()),
            interest: Mutex::new(HashMap::new()),
            forwarded: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tracker: Mutex::new(None),
        });

        let events = inner.broker.watch_subscriptions().await?;
        let tracker = tokio::spawn(track_subscriptions(Arc::clone(&inner), events));
        *guard(&inner.tracker) = Some(tracker);

        let (handle, mailbox) = processor::mailbox(hook_id.clone(), settings.hook_capacity);
        if let Err(err) = inner.broker.register_hook(handle).await {
            inner.stop_tracker().await;
            return Err(err.into());
        }

        let hook = DispatchHook {
            id: hook_id,
            inner: Arc::clone(&inner),
        };
        tokio::spawn(async move {
            if let Err(err) = processor::run(&hook, mailbox).await {
                warn!(hook = %hook.id, error = %err, "dispatcher hook stopped on error");
            }
        });

        info!(peer = %inner.local, "dispatcher started");
        Ok(Self { inner })
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.inner.local
    }

    /// Number of calls to peers issued so far, failed and pending ones included.
    pub fn forwarded_count(&self) -> u64 {
        self.inner.forwarded.load(Ordering::SeqCst)
    }

    /// Local subscriber count the dispatcher holds for `topic`.
    pub fn interest(&self, topic: &Topic) -> usize {
        guard(&self.inner.interest).get(topic).copied().unwrap_or(0)
    }

    /// Ids received from peers that the hook has not seen yet.
    pub fn pending_foreign(&self) -> usize {
        guard(&self.inner.foreign).len()
    }

    /// Publish a message received from a peer on the local broker.
    ///
    /// Subscription notices are generated by each broker for itself, so a
    /// message on a reserved topic is refused.
    pub async fn ingest(&self, message: Message) -> Result<(), DispatchError> {
        if message.topic.is_reserved() {
            return Err(HubError::ReservedTopic(message.topic).into());
        }

        let id = message.id;
        let marked = !message.topic.is_internal();
        if marked {
            guard(&self.inner.foreign).insert(id);
        }

        debug!(message = %id, topic = %message.topic, "ingesting message from peer");
        match self.inner.broker.publish_tracked(message).await {
            Ok(delivery) => {
                if marked && delivery.missed_hooks.contains(&self.inner.hook_id) {
                    debug!(message = %id, "hook missed message from peer");
                    guard(&self.inner.foreign).remove(&id);
                }
                Ok(())
            }
            Err(err) => {
                if marked {
                    guard(&self.inner.foreign).remove(&id);
                }
                Err(err.into())
            }
        }
    }

    /// Detach from the broker and withdraw every announcement of this node.
    pub async fn close(&self) -> Result<(), DispatchError> {
        self.inner.stop_tracker().await;
        match self.inner.broker.unregister_hook(&self.inner.hook_id).await {
            Ok(()) | Err(HubError::ProcessorNotRegistered(_)) | Err(HubError::Closed) => {}
            Err(err) => return Err(err.into()),
        }

        let topics: Vec<Topic> = guard(&self.inner.interest).drain().map(|(topic, _)| topic).collect();
        for topic in topics {
            self.inner.store.retract(&topic, &self.inner.local).await?;
        }
        info!(peer = %self.inner.local, "dispatcher closed");
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local", &self.inner.local)
            .field("hook_id", &self.inner.hook_id)
            .finish()
    }
}

async fn track_subscriptions(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<SubscriptionEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        inner.track(event).await;
    }
    debug!(peer = %inner.local, "subscription tracker stopped");
}

impl Inner {
    async fn stop_tracker(&self) {
        self.shutdown.cancel();
        let tracker = guard(&self.tracker).take();
        if let Some(tracker) = tracker {
            let _ = tracker.await;
        }
    }

    async fn track(&self, event: SubscriptionEvent) {
        let topic = event.topic;
        if topic.is_internal() {
            return;
        }

        let transition = {
            let mut interest = guard(&self.interest);
            match event.kind {
                ChangeKind::Subscribed => {
                    let count = interest.entry(topic.clone()).or_insert(0);
                    *count += 1;
                    (*count == 1).then_some(ChangeKind::Subscribed)
                }
                ChangeKind::Unsubscribed => match interest.get_mut(&topic) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        None
                    }
                    Some(_) => {
                        interest.remove(&topic);
                        Some(ChangeKind::Unsubscribed)
                    }
                    None => None,
                },
            }
        };

        let result = match transition {
            Some(ChangeKind::Subscribed) => {
                debug!(topic = %topic, peer = %self.local, "announcing interest");
                self.store.announce(&topic, &self.local).await
            }
            Some(ChangeKind::Unsubscribed) => {
                debug!(topic = %topic, peer = %self.local, "retracting interest");
                self.store.retract(&topic, &self.local).await
            }
            None => Ok(()),
        };
        if let Err(err) = result {
            warn!(topic = %topic, error = %err, "failed to update peer store");
        }
    }

    /// Returns true if the message came from a peer, consuming the mark.
    fn consume_foreign(&self, id: MessageId) -> bool {
        guard(&self.foreign).remove(&id)
    }

    /// Look up the peers of the message's topic and post it to each of them
    /// on a separate task.
    async fn forward(self: &Arc<Self>, message: &Message) {
        let peers = match self.store.peers(&message.topic).await {
            Ok(peers) => peers,
            Err(err) => {
                warn!(topic = %message.topic, error = %err, "could not read peers");
                return;
            }
        };

        let targets: Vec<PeerInfo> = peers.into_iter().filter(|peer| *peer != self.local).collect();
        if targets.is_empty() {
            return;
        }
        self.forwarded.fetch_add(targets.len() as u64, Ordering::SeqCst);

        let inner = Arc::clone(self);
        let message = message.clone();
        tokio::spawn(async move {
            let (inner, message) = (&inner, &message);
            let calls = targets.iter().map(|peer| async move {
                if let Err(err) = inner.send(peer, message).await {
                    warn!(peer = %peer, message = %message.id, error = %err, "could not notify peer");
                }
            });
            join_all(calls).await;
        });
    }

    async fn send(&self, peer: &PeerInfo, message: &Message) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&peer.address)
            .json(&DispatchBody { message })
            .send()
            .await
            .map_err(|source| DispatchError::Request {
                peer: peer.address.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::BAD_REQUEST => Err(DispatchError::Rejected {
                peer: peer.address.clone(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR => Err(DispatchError::PeerFailure {
                peer: peer.address.clone(),
            }),
            _ => {
                debug!(peer = %peer, message = %message.id, "message forwarded");
                Ok(())
            }
        }
    }
}

/// The processor the dispatcher registers as a broker hook.
struct DispatchHook {
    id: ProcessorId,
    inner: Arc<Inner>,
}

#[async_trait]
impl Processor for DispatchHook {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&self, message: &Message) -> Result<(), ProcessorError> {
        // Subscription notices included; the tracker handles those.
        if message.topic.is_internal() {
            return Ok(());
        }
        if self.inner.consume_foreign(message.id) {
            debug!(message = %message.id, "message came from a peer, not forwarding");
            return Ok(());
        }
        self.inner.forward(message).await;
        Ok(())
    }

    async fn handle_close(&self) {
        debug!(hook = %self.id, "dispatcher hook closed");
    }
}
