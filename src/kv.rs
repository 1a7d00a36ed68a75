//! Replicated key/value map on top of gossip.
//!
//! A small but complete application of the gossip layer: every node holds a
//! `String -> String` map, updates are broadcast as [`KvCommand`]s, and
//! push/pull exchanges the whole map as JSON.
//!
//! Update messages are a `'d'` tag byte followed by JSON:
//!
//! ```text
//! d{"Action":"add","Data":{"color":"blue"}}
//! ```
//!
//! Merging a snapshot overwrites local values with the peer's, so there is
//! no versioning: the last snapshot merged wins on conflicting keys.
//!
//! # Example
//!
//! ```ignore
//! use memberlist_mgossip::{kv::{self, KvDelegate}, Gossip, GossipConfig, StaticMembership};
//!
//! let gossip = Gossip::new(GossipConfig::lan(), KvDelegate::new(), StaticMembership::new(1))?;
//! kv::put(&gossip, "color", "blue")?;
//! assert_eq!(gossip.delegate().store().get("color").as_deref(), Some("blue"));
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    error::Result,
    gossip::{Gossip, GossipDelegate},
    message::MessageId,
};

/// Tag byte identifying a key/value update.
pub const COMMAND_TAG: u8 = b'd';

/// Update operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvAction {
    /// Insert or overwrite the listed keys.
    Add,
    /// Remove the listed keys.
    Del,
}

/// A key/value update as broadcast over gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    /// Operation applied to every key in `data`.
    #[serde(rename = "Action")]
    pub action: KvAction,
    /// Keys and values; values are ignored for deletes.
    #[serde(rename = "Data")]
    pub data: BTreeMap<String, String>,
}

impl KvCommand {
    /// Set one key.
    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            action: KvAction::Add,
            data: BTreeMap::from([(key.into(), value.into())]),
        }
    }

    /// Delete one key.
    pub fn del(key: impl Into<String>) -> Self {
        Self {
            action: KvAction::Del,
            data: BTreeMap::from([(key.into(), String::new())]),
        }
    }

    /// Encode as a tagged message.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(COMMAND_TAG);
        // Serializing string maps cannot fail
        if let Ok(json) = serde_json::to_vec(self) {
            buf.extend_from_slice(&json);
        }
        buf.freeze()
    }

    /// Decode a tagged message.
    ///
    /// Returns `None` for empty input, an unknown tag, or malformed JSON.
    pub fn decode(msg: &[u8]) -> Option<Self> {
        match msg.split_first() {
            Some((&COMMAND_TAG, body)) => serde_json::from_slice(body).ok(),
            _ => None,
        }
    }
}

/// Thread-safe key/value map.
#[derive(Debug, Default)]
pub struct KvStore {
    items: RwLock<BTreeMap<String, String>>,
}

impl KvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    /// Set a value locally, without broadcasting.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.items.write().insert(key.into(), value.into());
    }

    /// Remove a value locally, without broadcasting.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.items.write().remove(key)
    }

    /// Apply an update command.
    pub fn apply(&self, command: &KvCommand) {
        let mut items = self.items.write();
        for (key, value) in &command.data {
            match command.action {
                KvAction::Add => {
                    items.insert(key.clone(), value.clone());
                }
                KvAction::Del => {
                    items.remove(key);
                }
            }
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Copy of the whole map.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.items.read().clone()
    }

    /// Full map as JSON.
    pub fn snapshot(&self) -> Bytes {
        serde_json::to_vec(&*self.items.read())
            .map(Bytes::from)
            .unwrap_or_default()
    }

    /// Overwrite local entries with those in a JSON snapshot.
    ///
    /// Keys absent from the snapshot are kept.
    pub fn merge_snapshot(&self, buf: &[u8]) -> std::result::Result<usize, serde_json::Error> {
        let remote: BTreeMap<String, String> = serde_json::from_slice(buf)?;
        let merged = remote.len();
        self.items.write().extend(remote);
        Ok(merged)
    }
}

/// [`GossipDelegate`] replicating a [`KvStore`].
#[derive(Debug, Default)]
pub struct KvDelegate {
    store: KvStore,
}

impl KvDelegate {
    /// Create a delegate with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the replicated store.
    pub fn store(&self) -> &KvStore {
        &self.store
    }
}

impl GossipDelegate for KvDelegate {
    fn on_deliver(&self, message_id: MessageId, payload: Bytes) {
        match KvCommand::decode(&payload) {
            Some(command) => self.store.apply(&command),
            None => {
                tracing::debug!(id = %message_id, len = payload.len(), "ignoring non-kv message");
            }
        }
    }

    fn local_state(&self, _join: bool) -> Bytes {
        self.store.snapshot()
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if let Err(e) = self.store.merge_snapshot(buf) {
            tracing::warn!(error = %e, join, "discarding malformed kv snapshot");
        }
    }
}

/// Set a key locally and broadcast the update.
pub fn put<D>(gossip: &Gossip<D>, key: &str, value: &str) -> Result<MessageId>
where
    D: GossipDelegate + AsRef<KvStore>,
{
    gossip.delegate().as_ref().insert(key, value);
    gossip.broadcast(KvCommand::add(key, value).encode())
}

/// Delete a key locally and broadcast the update.
pub fn delete<D>(gossip: &Gossip<D>, key: &str) -> Result<MessageId>
where
    D: GossipDelegate + AsRef<KvStore>,
{
    gossip.delegate().as_ref().remove(key);
    gossip.broadcast(KvCommand::del(key).encode())
}

impl AsRef<KvStore> for KvDelegate {
    fn as_ref(&self) -> &KvStore {
        &self.store
    }
}
