// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-peer, per-direction inflight tables with the packet id allocator.
//!
//! Id allocation, capacity checks and inserts all run under one per-peer lock
//! so two concurrent sends can never be handed the same id.

use crate::errors::{Error, Result};
use crate::messaging::Message;
use crate::peers::Peer;
use crate::queue::QueuedPublish;
use crate::state::WaitToken;

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Table key space: wire packet ids plus the weak-attach sentinel.
pub type PacketId = u32;

/// Synthetic id keying exchanges whose frames carry no wire-level packet id
/// (CONNECT, PINGREQ, DISCONNECT, the WILL flows). Never transmitted.
pub const WEAK_ATTACH: PacketId = 65_536;

/// Who originated the exchange an entry tracks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// We opened the exchange.
    Local,
    /// The peer opened it.
    Remote,
}

impl Direction {
    fn idx(self) -> usize {
        match self {
            Self::Local => 0,
            Self::Remote => 1,
        }
    }
}

/// One tracked exchange: the frame sent (or received and pending), who
/// originated it, the waiter's token, and the queued publish to re-offer on
/// failure.
#[derive(Debug)]
pub struct InflightEntry {
    /// The originating frame of the exchange.
    pub message: Message,
    /// Who originated it.
    pub source: Direction,
    /// Confirmation cell; absent for remote entries with no waiter.
    pub token: Option<WaitToken>,
    /// Back-reference for requeue, present only for local queued publishes.
    pub queued: Option<QueuedPublish>,
    /// When the entry was tabled.
    pub created_at: Instant,
}

impl InflightEntry {
    /// True when the entry can be re-offered to the message queue.
    pub fn is_requeueable(&self) -> bool {
        self.queued.is_some()
    }
}

/// Both direction tables of one peer, plus the allocator seeds.
#[derive(Debug, Default)]
pub struct PeerInflight {
    tables: [BTreeMap<PacketId, InflightEntry>; 2],
    last_used: [Option<u16>; 2],
}

impl PeerInflight {
    fn table(&self, source: Direction) -> &BTreeMap<PacketId, InflightEntry> {
        &self.tables[source.idx()]
    }

    fn table_mut(&mut self, source: Direction) -> &mut BTreeMap<PacketId, InflightEntry> {
        &mut self.tables[source.idx()]
    }

    /// Number of tracked exchanges in one direction.
    pub fn count(&self, source: Direction) -> usize {
        self.table(source).len()
    }

    /// Whether an id is tabled in one direction.
    pub fn exists(&self, source: Direction, id: PacketId) -> bool {
        self.table(source).contains_key(&id)
    }

    /// Inspect an entry without removing it.
    pub fn get(&self, source: Direction, id: PacketId) -> Option<&InflightEntry> {
        self.table(source).get(&id)
    }

    /// Table an entry. The caller has already done the capacity check under
    /// the same lock.
    pub fn insert(&mut self, source: Direction, id: PacketId, entry: InflightEntry) {
        let _ = self.table_mut(source).insert(id, entry);
    }

    /// Detach an entry.
    pub fn remove(&mut self, source: Direction, id: PacketId) -> Option<InflightEntry> {
        self.table_mut(source).remove(&id)
    }

    /// Give a tabled entry a confirmation token.
    pub fn attach_token(&mut self, source: Direction, id: PacketId, token: WaitToken) {
        if let Some(entry) = self.table_mut(source).get_mut(&id) {
            entry.token = Some(token);
        }
    }

    /// The token of the oldest tabled exchange, if any carries one.
    pub fn first_token(&self, source: Direction) -> Option<WaitToken> {
        self.table(source)
            .values()
            .find_map(|entry| entry.token.clone())
    }

    /// True when both direction tables are empty.
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(BTreeMap::is_empty)
    }

    /// Drop the allocator seeds for both directions.
    pub fn reset_last_used(&mut self) {
        self.last_used = [None, None];
    }

    /// Allocate the next free packet id in `[msg_id_start, 65535]`.
    ///
    /// Allocation starts one past the last id handed out (so recently freed
    /// ids are not immediately re-used), wraps to the floor, and skips
    /// occupied slots. Fails when the whole usable range is tabled.
    pub fn next_id(&mut self, source: Direction, msg_id_start: u16) -> Result<u16> {
        let floor = msg_id_start.max(1);
        let span = u32::from(u16::MAX) - u32::from(floor) + 1;
        let mut candidate = match self.last_used[source.idx()] {
            Some(last) => wrap_to_floor(u32::from(last) + 1, floor),
            None => floor,
        };
        for _ in 0..span {
            if !self.table(source).contains_key(&PacketId::from(candidate)) {
                self.last_used[source.idx()] = Some(candidate);
                return Ok(candidate);
            }
            candidate = wrap_to_floor(u32::from(candidate) + 1, floor);
        }
        Err(Error::IdExhausted)
    }

    /// Detach entries older than the eviction horizon; `None` detaches all.
    pub fn drain_expired(
        &mut self,
        source: Direction,
        eviction_time: Option<Instant>,
        max_age: Duration,
    ) -> Vec<InflightEntry> {
        let table = self.table_mut(source);
        let expired: Vec<PacketId> = table
            .iter()
            .filter(|(_, entry)| match eviction_time {
                None => true,
                Some(at) => entry.created_at + max_age < at,
            })
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .collect()
    }
}

fn wrap_to_floor(value: u32, floor: u16) -> u16 {
    let wrapped = (value % 65_536) as u16;
    wrapped.max(floor)
}

/// The inflight tables of every tracked peer.
#[derive(Debug, Default)]
pub struct InflightTables {
    peers: DashMap<Peer, Arc<Mutex<PeerInflight>>>,
}

impl InflightTables {
    /// The peer's tables, created on first contact.
    pub fn peer(&self, peer: &Peer) -> Arc<Mutex<PeerInflight>> {
        self.peers.entry(peer.clone()).or_default().value().clone()
    }

    /// The peer's tables, if it has ever been tracked.
    pub fn get(&self, peer: &Peer) -> Option<Arc<Mutex<PeerInflight>>> {
        self.peers.get(peer).map(|tables| tables.value().clone())
    }

    /// Every peer with tables.
    pub fn tracked_peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Current entry count in one direction.
    pub fn count(&self, peer: &Peer, source: Direction) -> usize {
        match self.get(peer) {
            Some(tables) => lock(&tables).count(source),
            None => 0,
        }
    }

    /// Drop a peer's tables entirely.
    pub fn forget(&self, peer: &Peer) {
        let _ = self.peers.remove(peer);
    }
}

/// Lock a peer's tables, recovering from a poisoned lock.
pub(crate) fn lock(tables: &Arc<Mutex<PeerInflight>>) -> MutexGuard<'_, PeerInflight> {
    tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{QoS, TopicRef};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn entry(source: Direction) -> InflightEntry {
        InflightEntry {
            message: Message::Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: TopicRef::Normal(1),
                msg_id: 0,
                data: Bytes::from_static(b"x"),
            },
            source,
            token: None,
            queued: None,
            created_at: Instant::now(),
        }
    }

    #[test]
    fn ids_are_sequential_and_do_not_reuse_freshly_freed_slots() {
        let mut peer = PeerInflight::default();
        for expected in 1..=3u16 {
            let id = peer.next_id(Direction::Local, 1).expect("ids free");
            assert_eq!(id, expected);
            peer.insert(Direction::Local, PacketId::from(id), entry(Direction::Local));
        }

        // free id 2, allocation still continues from last_used = 3
        let _ = peer.remove(Direction::Local, 2).expect("tabled");
        assert_eq!(peer.next_id(Direction::Local, 1).expect("free"), 4);
    }

    #[test]
    fn allocation_wraps_to_the_floor() {
        let mut peer = PeerInflight::default();
        peer.last_used = [Some(u16::MAX), None];
        assert_eq!(peer.next_id(Direction::Local, 5).expect("free"), 5);
    }

    #[test]
    fn occupied_slots_are_skipped() {
        let mut peer = PeerInflight::default();
        peer.insert(Direction::Local, 1, entry(Direction::Local));
        peer.insert(Direction::Local, 2, entry(Direction::Local));
        assert_eq!(peer.next_id(Direction::Local, 1).expect("free"), 3);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut peer = PeerInflight::default();
        let floor = u16::MAX - 1;
        peer.insert(Direction::Local, PacketId::from(floor), entry(Direction::Local));
        peer.insert(Direction::Local, PacketId::from(u16::MAX), entry(Direction::Local));
        assert_matches!(
            peer.next_id(Direction::Local, floor),
            Err(Error::IdExhausted)
        );
    }

    #[test]
    fn directions_have_independent_ids_and_counts() {
        let mut peer = PeerInflight::default();
        let local = peer.next_id(Direction::Local, 1).expect("free");
        let remote = peer.next_id(Direction::Remote, 1).expect("free");
        assert_eq!(local, remote);
        peer.insert(Direction::Local, PacketId::from(local), entry(Direction::Local));
        assert_eq!(peer.count(Direction::Local), 1);
        assert_eq!(peer.count(Direction::Remote), 0);
    }

    #[test]
    fn drain_expired_honours_the_horizon_and_is_idempotent() {
        let mut peer = PeerInflight::default();
        peer.insert(Direction::Local, 1, entry(Direction::Local));
        let max_age = Duration::from_millis(10);

        // horizon before expiry: nothing to reap
        assert!(peer
            .drain_expired(Direction::Local, Some(Instant::now()), max_age)
            .is_empty());

        let horizon = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            peer.drain_expired(Direction::Local, Some(horizon), max_age).len(),
            1
        );
        // second run with the same clock sees the same (empty) table
        assert!(peer
            .drain_expired(Direction::Local, Some(horizon), max_age)
            .is_empty());
    }

    #[test]
    fn forced_drain_takes_everything() {
        let mut peer = PeerInflight::default();
        peer.insert(Direction::Local, 1, entry(Direction::Local));
        peer.insert(Direction::Local, WEAK_ATTACH, entry(Direction::Local));
        assert_eq!(
            peer.drain_expired(Direction::Local, None, Duration::from_secs(60))
                .len(),
            2
        );
        assert!(peer.is_empty());
    }

    proptest! {
        #[test]
        fn allocated_ids_are_free_and_in_range(
            occupied in proptest::collection::btree_set(1..=u16::MAX, 0..64),
            last_used in proptest::option::of(1..=u16::MAX),
            floor in 1..=256u16,
        ) {
            let mut peer = PeerInflight::default();
            for id in &occupied {
                peer.insert(Direction::Local, PacketId::from(*id), entry(Direction::Local));
            }
            peer.last_used = [last_used, None];

            let id = peer.next_id(Direction::Local, floor).expect("range far from full");
            prop_assert!(id >= floor);
            prop_assert!(!occupied.contains(&id));
        }
    }
}
