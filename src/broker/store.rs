//! Topic persistence
//!
//! Processors and subscriptions belong to live connections and only ever
//! exist in memory. Topics are different: they are created by operators, and a
//! node restarted on a `RegistryStore` that outlives it comes back with the same
//! set of topics. The broker loop writes through the store on every topic
//! creation and deletion and reads it once, when the broker is built.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::broker::topic::Topic;
use crate::utils::error::HubError;

const TOPICS_TREE: &str = "topics";

pub trait RegistryStore: Send + Sync + fmt::Debug {
    /// Every topic saved so far, in no particular order.
    fn load_topics(&self) -> Result<Vec<Topic>, HubError>;

    fn save_topic(&self, topic: &Topic) -> Result<(), HubError>;

    /// Removing a topic that was never saved is not an error.
    fn remove_topic(&self, topic: &Topic) -> Result<(), HubError>;
}

fn storage(err: impl fmt::Display) -> HubError {
    HubError::Storage(err.to_string())
}

/// Store that lives as long as the process. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistryStore {
    topics: Arc<Mutex<BTreeSet<Topic>>>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegistryStore for InMemoryRegistryStore {
    fn load_topics(&self) -> Result<Vec<Topic>, HubError> {
        Ok(self.topics())
    }

    fn save_topic(&self, topic: &Topic) -> Result<(), HubError> {
        self.lock().insert(topic.clone());
        Ok(())
    }

    fn remove_topic(&self, topic: &Topic) -> Result<(), HubError> {
        self.lock().remove(topic);
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TopicRecord {
    pub created_at: i64,
}

/// Topics kept in a `sled` tree, keyed by name.
pub struct SledRegistryStore {
    tree: Tree,
}

impl SledRegistryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HubError> {
        let db = sled::open(path).map_err(storage)?;
        Self::with_db(&db)
    }

    pub fn with_db(db: &Db) -> Result<Self, HubError> {
        let tree = db.open_tree(TOPICS_TREE).map_err(storage)?;
        Ok(Self { tree })
    }
}

impl fmt::Debug for SledRegistryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledRegistryStore")
            .field("tree", &TOPICS_TREE)
            .field("topics", &self.tree.len())
            .finish()
    }
}

impl RegistryStore for SledRegistryStore {
    fn load_topics(&self) -> Result<Vec<Topic>, HubError> {
        let mut topics = Vec::new();
        for entry in self.tree.iter() {
            let (key, _) = entry.map_err(storage)?;
            let name = std::str::from_utf8(&key).map_err(storage)?;
            topics.push(Topic::new(name));
        }
        Ok(topics)
    }

    fn save_topic(&self, topic: &Topic) -> Result<(), HubError> {
        let record = TopicRecord {
            created_at: Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_vec(&record).map_err(storage)?;
        self.tree
            .insert(topic.as_str().as_bytes(), value)
            .map_err(storage)?;
        self.tree.flush().map_err(storage)?;
        Ok(())
    }

    fn remove_topic(&self, topic: &Topic) -> Result<(), HubError> {
        self.tree
            .remove(topic.as_str().as_bytes())
            .map_err(storage)?;
        self.tree.flush().map_err(storage)?;
        Ok(())
    }
}
