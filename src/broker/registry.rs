//! Broker state
//!
//! `Registry` holds the topic → subscribers map, the processor table and the
//! set of message hooks. It is plain synchronous data: the broker loop owns it
//! exclusively, which is what makes every operation race-free. Each method
//! either succeeds or leaves the state untouched.

use std::collections::HashMap;

use crate::broker::topic::{Subscribers, Topic};
use crate::processor::{ProcessorHandle, ProcessorId};
use crate::utils::error::HubError;

#[derive(Debug)]
pub struct Registry {
    topics: HashMap<Topic, Subscribers>,
    processors: HashMap<ProcessorId, ProcessorHandle>,
    hooks: HashMap<ProcessorId, ProcessorHandle>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// An empty registry holding only the reserved notification topics.
    pub fn new() -> Self {
        let mut topics = HashMap::new();
        topics.insert(Topic::subscriptions(), Subscribers::default());
        topics.insert(Topic::unsubscriptions(), Subscribers::default());
        Self {
            topics,
            processors: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    pub fn create_topic(&mut self, topic: Topic) -> Result<(), HubError> {
        if self.topics.contains_key(&topic) {
            return Err(HubError::TopicAlreadyExists(topic));
        }
        self.topics.insert(topic, Subscribers::default());
        Ok(())
    }

    /// Remove a topic together with whatever subscribers it still has.
    pub fn remove_topic(&mut self, topic: &Topic) -> Result<Subscribers, HubError> {
        if topic.is_reserved() {
            return Err(HubError::ReservedTopic(topic.clone()));
        }
        self.topics
            .remove(topic)
            .ok_or_else(|| HubError::TopicNotFound(topic.clone()))
    }

    pub fn topic_exists(&self, topic: &Topic) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.keys().cloned().collect()
    }

    pub fn register(&mut self, handle: ProcessorHandle) -> Result<(), HubError> {
        if self.processors.contains_key(handle.id()) {
            return Err(HubError::ProcessorAlreadyRegistered(handle.id().to_string()));
        }
        self.processors.insert(handle.id().to_string(), handle);
        Ok(())
    }

    /// Remove a processor and every subscription it holds. Returns its handle
    /// and the topics it was unsubscribed from.
    pub fn unregister(&mut self, id: &str) -> Result<(ProcessorHandle, Vec<Topic>), HubError> {
        let handle = self
            .processors
            .remove(id)
            .ok_or_else(|| HubError::ProcessorNotRegistered(id.to_string()))?;

        let mut left = Vec::new();
        for (topic, subscribers) in self.topics.iter_mut() {
            if subscribers.unsubscribe(id) {
                left.push(topic.clone());
            }
        }
        Ok((handle, left))
    }

    pub fn processor(&self, id: &str) -> Result<&ProcessorHandle, HubError> {
        self.processors
            .get(id)
            .ok_or_else(|| HubError::ProcessorNotRegistered(id.to_string()))
    }

    pub fn processors(&self) -> Vec<ProcessorHandle> {
        self.processors.values().cloned().collect()
    }

    pub fn subscribe(&mut self, id: &str, topic: &Topic) -> Result<(), HubError> {
        let subscribers = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| HubError::TopicNotFound(topic.clone()))?;
        if !self.processors.contains_key(id) {
            return Err(HubError::ProcessorNotRegistered(id.to_string()));
        }
        if !subscribers.subscribe(id.to_string()) {
            return Err(HubError::AlreadySubscribed {
                processor: id.to_string(),
                topic: topic.clone(),
            });
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, id: &str, topic: &Topic) -> Result<(), HubError> {
        let subscribers = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| HubError::TopicNotFound(topic.clone()))?;
        if !self.processors.contains_key(id) {
            return Err(HubError::ProcessorNotRegistered(id.to_string()));
        }
        if !subscribers.unsubscribe(id) {
            return Err(HubError::NotSubscribed {
                processor: id.to_string(),
                topic: topic.clone(),
            });
        }
        Ok(())
    }

    pub fn has_subscribed(&self, id: &str, topic: &Topic) -> Result<bool, HubError> {
        let subscribers = self
            .topics
            .get(topic)
            .ok_or_else(|| HubError::TopicNotFound(topic.clone()))?;
        if !self.processors.contains_key(id) {
            return Err(HubError::ProcessorNotRegistered(id.to_string()));
        }
        Ok(subscribers.contains(id))
    }

    pub fn subscribers(&self, topic: &Topic) -> Result<Vec<ProcessorId>, HubError> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.iter().cloned().collect())
            .ok_or_else(|| HubError::TopicNotFound(topic.clone()))
    }

    pub fn add_hook(&mut self, handle: ProcessorHandle) -> Result<(), HubError> {
        if self.hooks.contains_key(handle.id()) {
            return Err(HubError::ProcessorAlreadyRegistered(handle.id().to_string()));
        }
        self.hooks.insert(handle.id().to_string(), handle);
        Ok(())
    }

    pub fn remove_hook(&mut self, id: &str) -> Result<ProcessorHandle, HubError> {
        self.hooks
            .remove(id)
            .ok_or_else(|| HubError::ProcessorNotRegistered(id.to_string()))
    }

    pub fn hooks(&self) -> impl Iterator<Item = &ProcessorHandle> {
        self.hooks.values()
    }

    /// Empty the processor table and the hook set, returning every handle.
    pub fn drain(&mut self) -> Vec<ProcessorHandle> {
        for subscribers in self.topics.values_mut() {
            *subscribers = Subscribers::default();
        }
        self.processors
            .drain()
            .chain(self.hooks.drain())
            .map(|(_, handle)| handle)
            .collect()
    }
}
