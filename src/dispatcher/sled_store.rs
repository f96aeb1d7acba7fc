//! Peer store persisted in `sled`.
//!
//! Keys are the topic, length-prefixed, followed by the peer address. Values
//! are JSON `PeerRecord`s.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Event, Tree};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::Topic;
use crate::dispatcher::peer_store::{PeerInfo, PeerStore, TopicPeerMap, lock};
use crate::utils::error::DispatchError;

const PEERS_TREE: &str = "peers";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerRecord {
    pub address: String,
    pub announced_at: i64,
}

/// Peer store backed by a `sled` tree.
///
/// Reads never touch the tree: they are served from a cache that a watcher
/// task keeps in sync with insert/remove events on the tree. Every store
/// opened on the same `Db` therefore converges on the same view, including
/// changes made by the others.
pub struct SledPeerStore {
    tree: Tree,
    cache: Arc<Mutex<TopicPeerMap>>,
    watcher: JoinHandle<()>,
}

impl SledPeerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let db = sled::open(path)?;
        Self::with_db(&db)
    }

    /// Must be called from within a tokio runtime; the watcher is spawned here.
    pub fn with_db(db: &Db) -> Result<Self, DispatchError> {
        let tree = db.open_tree(PEERS_TREE)?;
        let cache = Arc::new(Mutex::new(TopicPeerMap::default()));

        // Subscribe before the snapshot so nothing written in between is missed.
        let mut subscriber = tree.watch_prefix(b"");

        {
            let mut map = lock(&cache);
            for entry in tree.iter() {
                let (key, _) = entry?;
                if let Some((topic, peer)) = decode_key(&key) {
                    map.insert(topic, peer);
                }
            }
        }

        let watched = Arc::clone(&cache);
        let watcher = tokio::spawn(async move {
            while let Some(event) = (&mut subscriber).await {
                apply(&watched, event);
            }
            debug!("peer store watcher stopped");
        });

        Ok(Self {
            tree,
            cache,
            watcher,
        })
    }
}

impl Drop for SledPeerStore {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl std::fmt::Debug for SledPeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledPeerStore")
            .field("tree", &PEERS_TREE)
            .finish()
    }
}

#[async_trait]
impl PeerStore for SledPeerStore {
    async fn peers(&self, topic: &Topic) -> Result<HashSet<PeerInfo>, DispatchError> {
        Ok(lock(&self.cache).peers(topic))
    }

    async fn announce(&self, topic: &Topic, peer: &PeerInfo) -> Result<(), DispatchError> {
        let record = PeerRecord {
            address: peer.address.clone(),
            announced_at: Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_vec(&record)?;
        self.tree.insert(encode_key(topic, peer), value)?;
        lock(&self.cache).insert(topic.clone(), peer.clone());
        Ok(())
    }

    async fn retract(&self, topic: &Topic, peer: &PeerInfo) -> Result<(), DispatchError> {
        self.tree.remove(encode_key(topic, peer))?;
        lock(&self.cache).remove(topic, peer);
        Ok(())
    }
}

/// `u32` big-endian topic length, topic bytes, address bytes.
pub(crate) fn encode_key(topic: &Topic, peer: &PeerInfo) -> Vec<u8> {
    let topic = topic.as_str().as_bytes();
    let address = peer.address.as_bytes();
    let mut key = Vec::with_capacity(4 + topic.len() + address.len());
    key.extend_from_slice(&(topic.len() as u32).to_be_bytes());
    key.extend_from_slice(topic);
    key.extend_from_slice(address);
    key
}

pub(crate) fn decode_key(key: &[u8]) -> Option<(Topic, PeerInfo)> {
    let (len, rest) = key.split_first_chunk::<4>()?;
    let len = u32::from_be_bytes(*len) as usize;
    if rest.len() < len {
        return None;
    }
    let (topic, address) = rest.split_at(len);
    let topic = std::str::from_utf8(topic).ok()?;
    let address = std::str::from_utf8(address).ok()?;
    Some((Topic::new(topic), PeerInfo::new(address)))
}

fn apply(cache: &Mutex<TopicPeerMap>, event: Event) {
    match event {
        Event::Insert { key, .. } => match decode_key(&key) {
            Some((topic, peer)) => {
                lock(cache).insert(topic, peer);
            }
            None => warn!("ignoring malformed peer store key"),
        },
        Event::Remove { key } => {
            if let Some((topic, peer)) = decode_key(&key) {
                lock(cache).remove(&topic, &peer);
            }
        }
    }
}
