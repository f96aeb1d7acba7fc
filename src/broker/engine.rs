//! Broker engine
//!
//! This module contains the hub: a single control loop that owns the
//! [`Registry`] and services one request at a time, and the cloneable
//! [`Broker`] handle every other component uses to talk to it.
//!
//! Concurrency and usage notes:
//! - Callers never touch the registry. Each `Broker` method sends a request
//!   over a bounded channel and awaits the loop's reply, so all mutations are
//!   serialized without locks.
//! - A call returns once the loop has serviced the request. For `publish`
//!   that means the message sits in every subscriber mailbox; it does not
//!   mean any processor has handled it yet.
//! - Fan-out never blocks. A subscriber whose mailbox is full (or already
//!   gone) is dropped from the topic instead of stalling everyone else.
//! - Every subscription edge that appears or disappears, for whatever reason,
//!   is announced on the reserved `_subscribe` / `_unsubscribe` topics, which
//!   hooks observe, and on every subscription watch channel. Watch channels are
//!   unbounded, so a slow watcher never loses an event.
//! - Only the loop itself publishes on the reserved topics. Nobody can
//!   subscribe to them either; hooks are the way to observe them.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::message::{ChangeKind, Message};
use crate::broker::registry::Registry;
use crate::broker::store::{InMemoryRegistryStore, RegistryStore};
use crate::broker::topic::Topic;
use crate::config::BrokerSettings;
use crate::processor::{ProcessorHandle, ProcessorId};
use crate::utils::error::HubError;

type Reply<T> = oneshot::Sender<Result<T, HubError>>;

/// One subscription edge appearing or disappearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub kind: ChangeKind,
    pub topic: Topic,
    pub processor: ProcessorId,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Subscribers the message was enqueued for.
    pub delivered: usize,
    /// Subscribers dropped from the topic because their mailbox was full.
    pub dropped: Vec<ProcessorId>,
    /// Hooks whose mailbox could not take the message.
    pub missed_hooks: Vec<ProcessorId>,
}

enum Request {
    CreateTopic {
        topic: Topic,
        reply: Reply<()>,
    },
    DeleteTopic {
        topic: Topic,
        reply: Reply<()>,
    },
    Register {
        handle: ProcessorHandle,
        reply: Reply<()>,
    },
    Unregister {
        id: ProcessorId,
        reply: Reply<()>,
    },
    Subscribe {
        id: ProcessorId,
        topic: Topic,
        reply: Reply<()>,
    },
    Unsubscribe {
        id: ProcessorId,
        topic: Topic,
        reply: Reply<()>,
    },
    Publish {
        message: Arc<Message>,
        reply: Reply<Delivery>,
    },
    RegisterHook {
        handle: ProcessorHandle,
        reply: Reply<()>,
    },
    UnregisterHook {
        id: ProcessorId,
        reply: Reply<()>,
    },
    WatchSubscriptions {
        reply: Reply<mpsc::UnboundedReceiver<SubscriptionEvent>>,
    },
    Subscribers {
        topic: Topic,
        reply: Reply<Vec<ProcessorId>>,
    },
    Processor {
        id: ProcessorId,
        reply: Reply<ProcessorHandle>,
    },
    Processors {
        reply: Reply<Vec<ProcessorHandle>>,
    },
    Topics {
        reply: Reply<Vec<Topic>>,
    },
    HasSubscribed {
        id: ProcessorId,
        topic: Topic,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a running hub. Cheap to clone; all clones talk to the same loop.
#[derive(Debug, Clone)]
pub struct Broker {
    requests: mpsc::Sender<Request>,
}

impl Broker {
    /// Build a broker and its control loop without starting it. The loop must
    /// be driven with [`BrokerLoop::run`]. Topics are kept in memory only.
    pub fn new(settings: &BrokerSettings) -> Result<(Self, BrokerLoop), HubError> {
        Self::with_store(settings, Box::new(InMemoryRegistryStore::new()))
    }

    /// Build a broker whose topics are written through `store`.
    ///
    /// Topics already in the store are restored first. The topics named in
    /// `settings` are then created and saved unless the store had them.
    pub fn with_store(
        settings: &BrokerSettings,
        store: Box<dyn RegistryStore>,
    ) -> Result<(Self, BrokerLoop), HubError> {
        let mut registry = Registry::new();
        let mut restored = Vec::new();
        for topic in store.load_topics()? {
            if topic.is_reserved() {
                continue;
            }
            registry.create_topic(topic.clone())?;
            restored.push(topic);
        }
        if !restored.is_empty() {
            info!(topics = restored.len(), "restored topics from store");
        }

        for name in &settings.topics {
            let topic = Topic::new(name);
            if restored.contains(&topic) {
                continue;
            }
            registry.create_topic(topic.clone())?;
            store.save_topic(&topic)?;
        }

        let (tx, rx) = mpsc::channel(settings.request_capacity.max(1));
        let broker = Self { requests: tx };
        let control = BrokerLoop {
            registry,
            store,
            watchers: Vec::new(),
            requests: rx,
        };
        Ok((broker, control))
    }

    /// Build a broker and spawn its control loop on the current runtime.
    pub fn start(settings: &BrokerSettings) -> Result<Self, HubError> {
        Ok(Self::spawn(Self::new(settings)?))
    }

    /// Same as [`Broker::start`], with topics written through `store`.
    pub fn start_with_store(
        settings: &BrokerSettings,
        store: Box<dyn RegistryStore>,
    ) -> Result<Self, HubError> {
        Ok(Self::spawn(Self::with_store(settings, store)?))
    }

    fn spawn((broker, control): (Self, BrokerLoop)) -> Self {
        tokio::spawn(control.run(CancellationToken::new()));
        broker
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, HubError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)?
    }

    pub async fn create_topic(&self, topic: impl Into<Topic>) -> Result<(), HubError> {
        let topic = topic.into();
        self.request(|reply| Request::CreateTopic { topic, reply })
            .await
    }

    pub async fn delete_topic(&self, topic: impl Into<Topic>) -> Result<(), HubError> {
        let topic = topic.into();
        self.request(|reply| Request::DeleteTopic { topic, reply })
            .await
    }

    pub async fn register_processor(&self, handle: ProcessorHandle) -> Result<(), HubError> {
        self.request(|reply| Request::Register { handle, reply })
            .await
    }

    pub async fn unregister_processor(&self, id: &str) -> Result<(), HubError> {
        let id = id.to_string();
        self.request(|reply| Request::Unregister { id, reply }).await
    }

    pub async fn subscribe(&self, id: &str, topic: impl Into<Topic>) -> Result<(), HubError> {
        let (id, topic) = (id.to_string(), topic.into());
        self.request(|reply| Request::Subscribe { id, topic, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: &str, topic: impl Into<Topic>) -> Result<(), HubError> {
        let (id, topic) = (id.to_string(), topic.into());
        self.request(|reply| Request::Unsubscribe { id, topic, reply })
            .await
    }

    pub async fn publish(&self, message: Message) -> Result<(), HubError> {
        self.publish_tracked(message).await.map(|_| ())
    }

    /// Publish and report who the message reached.
    pub async fn publish_tracked(&self, message: Message) -> Result<Delivery, HubError> {
        let message = Arc::new(message);
        self.request(|reply| Request::Publish { message, reply })
            .await
    }

    pub async fn register_hook(&self, handle: ProcessorHandle) -> Result<(), HubError> {
        self.request(|reply| Request::RegisterHook { handle, reply })
            .await
    }

    pub async fn unregister_hook(&self, id: &str) -> Result<(), HubError> {
        let id = id.to_string();
        self.request(|reply| Request::UnregisterHook { id, reply })
            .await
    }

    /// Receive every later subscription change. The channel ends when the
    /// broker stops; dropping the receiver cancels the watch.
    pub async fn watch_subscriptions(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionEvent>, HubError> {
        self.request(|reply| Request::WatchSubscriptions { reply })
            .await
    }

    pub async fn subscribers(&self, topic: impl Into<Topic>) -> Result<Vec<ProcessorId>, HubError> {
        let topic = topic.into();
        self.request(|reply| Request::Subscribers { topic, reply })
            .await
    }

    pub async fn processor(&self, id: &str) -> Result<ProcessorHandle, HubError> {
        let id = id.to_string();
        self.request(|reply| Request::Processor { id, reply }).await
    }

    pub async fn processors(&self) -> Result<Vec<ProcessorHandle>, HubError> {
        self.request(|reply| Request::Processors { reply }).await
    }

    pub async fn topics(&self) -> Result<Vec<Topic>, HubError> {
        self.request(|reply| Request::Topics { reply }).await
    }

    pub async fn has_subscribed(&self, id: &str, topic: impl Into<Topic>) -> Result<bool, HubError> {
        let (id, topic) = (id.to_string(), topic.into());
        self.request(|reply| Request::HasSubscribed { id, topic, reply })
            .await
    }

    /// Unregister every processor, then stop the control loop.
    ///
    /// Processors that vanish on their own while this runs are not errors;
    /// any other failure is collected into `CloseFailed` after the loop has
    /// been stopped anyway.
    pub async fn close(&self) -> Result<(), HubError> {
        let mut failures = Vec::new();
        for handle in self.processors().await? {
            match self.unregister_processor(handle.id()).await {
                Ok(()) | Err(HubError::ProcessorNotRegistered(_)) => {}
                Err(err) => {
                    warn!(processor = handle.id(), error = %err, "failed to unregister processor while closing");
                    failures.push((handle.id().to_string(), err));
                }
            }
        }

        self.request(|reply| Request::Shutdown { reply }).await?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HubError::CloseFailed(failures))
        }
    }
}

/// The single writer. Owns the registry, the topic store and the receiving end
/// of the request channel.
#[derive(Debug)]
pub struct BrokerLoop {
    registry: Registry,
    store: Box<dyn RegistryStore>,
    watchers: Vec<mpsc::UnboundedSender<SubscriptionEvent>>,
    requests: mpsc::Receiver<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Request::CreateTopic { .. } => "CreateTopic",
            Request::DeleteTopic { .. } => "DeleteTopic",
            Request::Register { .. } => "Register",
            Request::Unregister { .. } => "Unregister",
            Request::Subscribe { .. } => "Subscribe",
            Request::Unsubscribe { .. } => "Unsubscribe",
            Request::Publish { .. } => "Publish",
            Request::RegisterHook { .. } => "RegisterHook",
            Request::UnregisterHook { .. } => "UnregisterHook",
            Request::WatchSubscriptions { .. } => "WatchSubscriptions",
            Request::Subscribers { .. } => "Subscribers",
            Request::Processor { .. } => "Processor",
            Request::Processors { .. } => "Processors",
            Request::Topics { .. } => "Topics",
            Request::HasSubscribed { .. } => "HasSubscribed",
            Request::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl BrokerLoop {
    /// Service requests until a shutdown request arrives, `shutdown` fires, or
    /// every `Broker` handle has been dropped. Whatever is still registered at
    /// that point is closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("broker loop started");

        let mut pending_shutdown = None;
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            if let ControlFlow::Break(reply) = self.handle(request) {
                pending_shutdown = Some(reply);
                break;
            }
        }

        // Dropping the receiver makes every later request fail with `Closed`.
        self.requests.close();
        for handle in self.registry.drain() {
            handle.close();
        }
        if let Some(reply) = pending_shutdown {
            let _ = reply.send(Ok(()));
        }
        info!("broker loop stopped");
    }

    fn handle(&mut self, request: Request) -> ControlFlow<Reply<()>> {
        debug!(request = ?request, "servicing request");
        match request {
            Request::CreateTopic { topic, reply } => {
                let _ = reply.send(self.create_topic(topic));
            }
            Request::DeleteTopic { topic, reply } => {
                let _ = reply.send(self.delete_topic(&topic));
            }
            Request::Register { handle, reply } => {
                let id = handle.id().to_string();
                let result = self.registry.register(handle);
                if result.is_ok() {
                    info!(processor = %id, "registered processor");
                }
                let _ = reply.send(result);
            }
            Request::Unregister { id, reply } => {
                let _ = reply.send(self.unregister(&id));
            }
            Request::Subscribe { id, topic, reply } => {
                let result = refuse_reserved(&topic)
                    .and_then(|()| self.registry.subscribe(&id, &topic));
                if result.is_ok() {
                    info!(processor = %id, topic = %topic, "processor subscribed");
                    self.notify(ChangeKind::Subscribed, &topic, &id);
                }
                let _ = reply.send(result);
            }
            Request::Unsubscribe { id, topic, reply } => {
                let result = refuse_reserved(&topic)
                    .and_then(|()| self.registry.unsubscribe(&id, &topic));
                if result.is_ok() {
                    info!(processor = %id, topic = %topic, "processor unsubscribed");
                    self.notify(ChangeKind::Unsubscribed, &topic, &id);
                }
                let _ = reply.send(result);
            }
            Request::Publish { message, reply } => {
                let result = refuse_reserved(&message.topic).and_then(|()| self.publish(message));
                let _ = reply.send(result);
            }
            Request::RegisterHook { handle, reply } => {
                let id = handle.id().to_string();
                let result = self.registry.add_hook(handle);
                if result.is_ok() {
                    info!(hook = %id, "registered message hook");
                }
                let _ = reply.send(result);
            }
            Request::UnregisterHook { id, reply } => {
                let result = self.registry.remove_hook(&id).map(|handle| handle.close());
                let _ = reply.send(result);
            }
            Request::WatchSubscriptions { reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.watchers.push(tx);
                let _ = reply.send(Ok(rx));
            }
            Request::Subscribers { topic, reply } => {
                let _ = reply.send(self.registry.subscribers(&topic));
            }
            Request::Processor { id, reply } => {
                let _ = reply.send(self.registry.processor(&id).cloned());
            }
            Request::Processors { reply } => {
                let _ = reply.send(Ok(self.registry.processors()));
            }
            Request::Topics { reply } => {
                let _ = reply.send(Ok(self.registry.topics()));
            }
            Request::HasSubscribed { id, topic, reply } => {
                let _ = reply.send(self.registry.has_subscribed(&id, &topic));
            }
            Request::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    fn create_topic(&mut self, topic: Topic) -> Result<(), HubError> {
        if self.registry.topic_exists(&topic) {
            return Err(HubError::TopicAlreadyExists(topic));
        }
        self.store.save_topic(&topic)?;
        self.registry.create_topic(topic.clone())?;
        info!(topic = %topic, "created topic");
        Ok(())
    }

    /// Subscribers learn about the deletion before they are cut off.
    fn delete_topic(&mut self, topic: &Topic) -> Result<(), HubError> {
        if topic.is_reserved() {
            return Err(HubError::ReservedTopic(topic.clone()));
        }
        let subscribers = self.registry.subscribers(topic)?;

        let notice = Arc::new(Message::topic_deleted(topic));
        for id in &subscribers {
            if let Ok(handle) = self.registry.processor(id) {
                if let Err(err) = handle.try_deliver(Arc::clone(&notice)) {
                    warn!(processor = %id, topic = %topic, error = %err, "could not deliver topic deletion notice");
                }
            }
            if self.registry.unsubscribe(id, topic).is_ok() {
                self.notify(ChangeKind::Unsubscribed, topic, id);
            }
        }

        self.registry.remove_topic(topic)?;
        if let Err(err) = self.store.remove_topic(topic) {
            warn!(topic = %topic, error = %err, "deleted topic is still in the topic store");
        }
        info!(topic = %topic, subscribers = subscribers.len(), "deleted topic");
        Ok(())
    }

    fn unregister(&mut self, id: &str) -> Result<(), HubError> {
        let (handle, topics) = self.registry.unregister(id)?;
        for topic in &topics {
            self.notify(ChangeKind::Unsubscribed, topic, id);
        }
        handle.close();
        info!(processor = %id, "unregistered processor");
        Ok(())
    }

    fn publish(&mut self, message: Arc<Message>) -> Result<Delivery, HubError> {
        let topic = message.topic.clone();
        let subscribers = self.registry.subscribers(&topic)?;

        let mut delivery = Delivery::default();
        for id in subscribers {
            let Ok(handle) = self.registry.processor(&id) else {
                continue;
            };
            match handle.try_deliver(Arc::clone(&message)) {
                Ok(()) => delivery.delivered += 1,
                Err(err) => {
                    warn!(processor = %id, topic = %topic, error = %err, "dropping subscriber that cannot keep up");
                    delivery.dropped.push(id);
                }
            }
        }

        for hook in self.registry.hooks() {
            if let Err(err) = hook.try_deliver(Arc::clone(&message)) {
                warn!(hook = hook.id(), message = %message.id, error = %err, "hook dropped message");
                delivery.missed_hooks.push(hook.id().to_string());
            }
        }

        for id in &delivery.dropped {
            if self.registry.unsubscribe(id, &topic).is_ok() {
                self.notify(ChangeKind::Unsubscribed, &topic, id);
            }
        }

        debug!(topic = %topic, message = %message.id, "published message");
        Ok(delivery)
    }

    fn notify(&mut self, change: ChangeKind, topic: &Topic, processor: &str) {
        let event = SubscriptionEvent {
            kind: change,
            topic: topic.clone(),
            processor: processor.to_string(),
        };
        self.watchers.retain(|watcher| watcher.send(event.clone()).is_ok());

        let notice = Message::subscription_changed(change, topic, processor);
        if let Err(err) = self.publish(Arc::new(notice)) {
            debug!(error = %err, "could not publish subscription notice");
        }
    }
}

fn refuse_reserved(topic: &Topic) -> Result<(), HubError> {
    if topic.is_reserved() {
        return Err(HubError::ReservedTopic(topic.clone()));
    }
    Ok(())
}
