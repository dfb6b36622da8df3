// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Payload blob store. Queued publishes reference payloads by uuid so requeues
//! and DUP redeliveries never copy the data; a TTL sweep tidies abandoned
//! entries.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Registry key for a stored payload.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MessageUuid(u64);

impl MessageUuid {
    /// Generates a new `MessageUuid` with random content.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for MessageUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageUuid({:016x})", self.0)
    }
}

impl fmt::Display for MessageUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug)]
struct StoredPayload {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredPayload {
    fn expired(&self) -> bool {
        self.expires_at
            .map(|at| at <= Instant::now())
            .unwrap_or(false)
    }
}

/// Uuid-keyed payload store with per-entry TTL.
#[derive(Debug)]
pub struct MessageRegistry {
    items: DashMap<MessageUuid, StoredPayload>,
    ttl: Option<Duration>,
}

impl MessageRegistry {
    /// New registry; `ttl = None` keeps payloads until they are removed.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            items: DashMap::new(),
            ttl,
        }
    }

    /// Store a payload, returning its key.
    pub fn add(&self, data: Bytes) -> MessageUuid {
        let uuid = MessageUuid::new();
        let _ = self.items.insert(
            uuid,
            StoredPayload {
                data,
                expires_at: self.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        uuid
    }

    /// Fetch a payload if it is present and not expired.
    pub fn get(&self, uuid: &MessageUuid) -> Option<Bytes> {
        self.items
            .get(uuid)
            .filter(|stored| !stored.expired())
            .map(|stored| stored.data.clone())
    }

    /// Detach a payload.
    pub fn remove(&self, uuid: &MessageUuid) -> Option<Bytes> {
        self.items.remove(uuid).map(|(_, stored)| stored.data)
    }

    /// Drop expired entries, returning how many went.
    pub fn tidy(&self) -> usize {
        let before = self.items.len();
        self.items.retain(|_, stored| !stored.expired());
        before - self.items.len()
    }

    /// Number of stored payloads, expired ones included until the next tidy.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Spawn the periodic tidy sweep.
    pub fn spawn_tidy_loop(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let _instant = interval.tick().await;
                let dropped = registry.tidy();
                if dropped > 0 {
                    trace!("Registry tidy dropped {dropped} expired payloads");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_payloads() {
        let registry = MessageRegistry::new(None);
        let uuid = registry.add(Bytes::from_static(b"hello"));
        assert_eq!(registry.get(&uuid), Some(Bytes::from_static(b"hello")));
        assert_eq!(registry.remove(&uuid), Some(Bytes::from_static(b"hello")));
        assert_eq!(registry.get(&uuid), None);
    }

    #[tokio::test]
    async fn expired_payloads_are_invisible_and_tidied() {
        let registry = MessageRegistry::new(Some(Duration::from_millis(20)));
        let uuid = registry.add(Bytes::from_static(b"x"));
        assert!(registry.get(&uuid).is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.get(&uuid), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.tidy(), 1);
        assert!(registry.is_empty());
    }
}
