//! Peer registry shared between nodes
//!
//! For every topic the store knows which nodes have at least one local
//! subscriber. The dispatcher announces itself on a topic when its first local
//! subscriber appears and retracts itself when the last one leaves.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::Topic;
use crate::utils::error::DispatchError;

/// A node, identified by the URL of its dispatch endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
}

impl PeerInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// topic → peers with local interest in it.
#[derive(Debug, Default, Clone)]
pub struct TopicPeerMap {
    topics: HashMap<Topic, HashSet<PeerInfo>>,
}

impl TopicPeerMap {
    pub fn insert(&mut self, topic: Topic, peer: PeerInfo) -> bool {
        self.topics.entry(topic).or_default().insert(peer)
    }

    pub fn remove(&mut self, topic: &Topic, peer: &PeerInfo) -> bool {
        let Some(peers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = peers.remove(peer);
        if peers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Empty for a topic nobody has announced.
    pub fn peers(&self, topic: &Topic) -> HashSet<PeerInfo> {
        self.topics.get(topic).cloned().unwrap_or_default()
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.keys()
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn peers(&self, topic: &Topic) -> Result<HashSet<PeerInfo>, DispatchError>;

    /// Record that `peer` has local subscribers on `topic`. Idempotent.
    async fn announce(&self, topic: &Topic, peer: &PeerInfo) -> Result<(), DispatchError>;

    /// Undo `announce`. Retracting an unknown entry is not an error.
    async fn retract(&self, topic: &Topic, peer: &PeerInfo) -> Result<(), DispatchError>;
}

pub(crate) fn lock(map: &Mutex<TopicPeerMap>) -> MutexGuard<'_, TopicPeerMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Store kept in process memory. Clones share the same map, which is how
/// several nodes in one process (tests, demos) see each other.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPeerStore {
    map: Arc<Mutex<TopicPeerMap>>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerStore for InMemoryPeerStore {
    async fn peers(&self, topic: &Topic) -> Result<HashSet<PeerInfo>, DispatchError> {
        Ok(lock(&self.map).peers(topic))
    }

    async fn announce(&self, topic: &Topic, peer: &PeerInfo) -> Result<(), DispatchError> {
        lock(&self.map).insert(topic.clone(), peer.clone());
        Ok(())
    }

    async fn retract(&self, topic: &Topic, peer: &PeerInfo) -> Result<(), DispatchError> {
        lock(&self.map).remove(topic, peer);
        Ok(())
    }
}
