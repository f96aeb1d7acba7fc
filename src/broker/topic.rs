//! Topic management
//!
//! A `Topic` is the interned name of a channel. The broker never interprets its
//! value, except for the two reserved topics on which subscription changes are
//! announced. `Subscribers` holds the processor IDs subscribed to one topic.
//!
//! Concurrency note: `Subscribers` is owned by the broker registry and is only
//! mutated from the broker loop.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::processor::ProcessorId;

/// Topic on which subscription notifications are published.
pub const SUBSCRIBE_TOPIC: &str = "_subscribe";

/// Topic on which unsubscription notifications are published.
pub const UNSUBSCRIBE_TOPIC: &str = "_unsubscribe";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn subscriptions() -> Self {
        Self::new(SUBSCRIBE_TOPIC)
    }

    pub fn unsubscriptions() -> Self {
        Self::new(UNSUBSCRIBE_TOPIC)
    }

    /// True for the two topics the broker creates for itself.
    pub fn is_reserved(&self) -> bool {
        self.as_str() == SUBSCRIBE_TOPIC || self.as_str() == UNSUBSCRIBE_TOPIC
    }

    /// Internal topics carry node-local traffic and are never sent to peers.
    pub fn is_internal(&self) -> bool {
        self.0.starts_with('_')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&Topic> for Topic {
    fn from(topic: &Topic) -> Self {
        topic.clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Subscribers {
    ids: HashSet<ProcessorId>,
}

impl Subscribers {
    /// Add a subscriber. Returns `false` if it was already present.
    pub fn subscribe(&mut self, id: ProcessorId) -> bool {
        self.ids.insert(id)
    }

    /// Remove a subscriber. Returns `false` if it was not present.
    pub fn unsubscribe(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessorId> {
        self.ids.iter()
    }
}
