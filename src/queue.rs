// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-peer bounded FIFO of publishes awaiting delivery.

use crate::errors::{Error, Result};
use crate::messaging::QoS;
use crate::peers::Peer;
use crate::registry::MessageUuid;

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A publish waiting in (or re-offered to) a peer's queue.
///
/// The payload itself lives in the message registry, keyed by `uuid`; inflight
/// entries hold a copy of this struct so a timed-out or rejected delivery can
/// be re-offered with its retry history intact.
#[derive(Clone, Debug)]
pub struct QueuedPublish {
    /// Registry key of the payload.
    pub uuid: MessageUuid,
    /// Full topic path the publish addresses.
    pub topic_path: String,
    /// Requested delivery QoS.
    pub qos: QoS,
    /// Retain flag.
    pub retained: bool,
    /// Delivery attempts made so far.
    pub retry_count: u32,
    /// The packet id of the last attempt; 0 until one is assigned. Re-used on
    /// redelivery so the DUP frame carries the same id.
    pub last_assigned_msg_id: u16,
}

impl QueuedPublish {
    /// A publish that has never been attempted.
    pub fn new(uuid: MessageUuid, topic_path: impl Into<String>, qos: QoS, retained: bool) -> Self {
        Self {
            uuid,
            topic_path: topic_path.into(),
            qos,
            retained,
            retry_count: 0,
            last_assigned_msg_id: 0,
        }
    }
}

type PeerQueue = Arc<RwLock<VecDeque<QueuedPublish>>>;

/// The per-peer outbound publish queues.
#[derive(Debug)]
pub struct MessageQueue {
    queues: DashMap<Peer, PeerQueue>,
    max_queue_size: usize,
}

impl MessageQueue {
    /// New queue set with the given per-peer bound.
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queues: DashMap::new(),
            max_queue_size,
        }
    }

    fn queue(&self, peer: &Peer) -> PeerQueue {
        self.queues.entry(peer.clone()).or_default().value().clone()
    }

    /// Append a publish to the peer's queue. Fails when the bound is hit.
    pub async fn offer(&self, peer: &Peer, publish: QueuedPublish) -> Result<()> {
        let queue = self.queue(peer);
        let mut guard = queue.write().await;
        if guard.len() >= self.max_queue_size {
            return Err(Error::QueueFull(guard.len()));
        }
        guard.push_back(publish);
        Ok(())
    }

    /// Detach the publish at the head of the peer's queue.
    pub async fn pop(&self, peer: &Peer) -> Option<QueuedPublish> {
        let queue = self.queues.get(peer)?.value().clone();
        let mut guard = queue.write().await;
        guard.pop_front()
    }

    /// Number of publishes waiting for the peer.
    pub async fn depth(&self, peer: &Peer) -> usize {
        match self.queues.get(peer) {
            Some(queue) => queue.value().clone().read().await.len(),
            None => 0,
        }
    }

    /// Drop the peer's queue entirely.
    pub fn forget(&self, peer: &Peer) {
        let _ = self.queues.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MessageUuid;
    use assert_matches::assert_matches;

    fn peer() -> Peer {
        Peer::new("sensor-1", ([127, 0, 0, 1], 2442).into())
    }

    fn publish(topic: &str) -> QueuedPublish {
        QueuedPublish::new(MessageUuid::new(), topic, QoS::AtLeastOnce, false)
    }

    #[tokio::test]
    async fn pops_in_offer_order() {
        let queue = MessageQueue::new(8);
        let peer = peer();
        queue.offer(&peer, publish("a")).await.expect("space");
        queue.offer(&peer, publish("b")).await.expect("space");

        assert_eq!(queue.depth(&peer).await, 2);
        assert_eq!(queue.pop(&peer).await.expect("queued").topic_path, "a");
        assert_eq!(queue.pop(&peer).await.expect("queued").topic_path, "b");
        assert!(queue.pop(&peer).await.is_none());
    }

    #[tokio::test]
    async fn bound_is_enforced() {
        let queue = MessageQueue::new(1);
        let peer = peer();
        queue.offer(&peer, publish("a")).await.expect("space");
        assert_matches!(
            queue.offer(&peer, publish("b")).await,
            Err(Error::QueueFull(1))
        );
    }

    #[tokio::test]
    async fn queues_are_independent_per_peer() {
        let queue = MessageQueue::new(1);
        let other = Peer::new("sensor-2", ([127, 0, 0, 1], 2443).into());
        queue.offer(&peer(), publish("a")).await.expect("space");
        queue.offer(&other, publish("b")).await.expect("space");
        assert_eq!(queue.depth(&peer()).await, 1);
        assert_eq!(queue.depth(&other).await, 1);
    }
}
