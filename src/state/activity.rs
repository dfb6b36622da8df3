// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-peer liveness clocks: last-active, last-sent, last-received.
//!
//! The active clock only moves for frames the codec classifies as active
//! (keepalives and error frames do not count); the sent/received clocks move
//! for every frame.

use crate::peers::Peer;

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// The three per-peer activity clocks.
#[derive(Debug, Default)]
pub struct ActivityClock {
    last_active: DashMap<Peer, Instant>,
    last_sent: DashMap<Peer, Instant>,
    last_received: DashMap<Peer, Instant>,
}

impl ActivityClock {
    /// Fresh, empty clocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful datagram write.
    pub fn on_sent(&self, peer: &Peer, counts_as_active: bool) {
        let now = Instant::now();
        let _ = self.last_sent.insert(peer.clone(), now);
        if counts_as_active {
            let _ = self.last_active.insert(peer.clone(), now);
        }
    }

    /// Record a received frame.
    pub fn on_received(&self, peer: &Peer, counts_as_active: bool) {
        let now = Instant::now();
        let _ = self.last_received.insert(peer.clone(), now);
        if counts_as_active {
            let _ = self.last_active.insert(peer.clone(), now);
        }
    }

    /// When the peer last advanced the liveness clock.
    pub fn last_active(&self, peer: &Peer) -> Option<Instant> {
        self.last_active.get(peer).map(|at| *at)
    }

    /// When we last wrote to the peer.
    pub fn last_sent(&self, peer: &Peer) -> Option<Instant> {
        self.last_sent.get(peer).map(|at| *at)
    }

    /// When we last heard from the peer.
    pub fn last_received(&self, peer: &Peer) -> Option<Instant> {
        self.last_received.get(peer).map(|at| *at)
    }

    /// Collect peers idle past the threshold, dropping their active entry so
    /// each timeout fires once.
    pub fn sweep(&self, idle_after: Duration) -> Vec<Peer> {
        let now = Instant::now();
        let idle: Vec<Peer> = self
            .last_active
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) > idle_after)
            .map(|entry| entry.key().clone())
            .collect();
        for peer in &idle {
            let _ = self.last_active.remove(peer);
        }
        idle
    }

    /// Drop every clock for the peer.
    pub fn forget(&self, peer: &Peer) {
        let _ = self.last_active.remove(peer);
        let _ = self.last_sent.remove(peer);
        let _ = self.last_received.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new("sensor-1", ([127, 0, 0, 1], 2442).into())
    }

    #[test]
    fn active_writes_move_both_clocks() {
        let clock = ActivityClock::new();
        let peer = peer();
        clock.on_sent(&peer, true);
        let active = clock.last_active(&peer).expect("set");
        let sent = clock.last_sent(&peer).expect("set");
        assert!(sent >= active);
    }

    #[test]
    fn keepalive_traffic_does_not_touch_the_active_clock() {
        let clock = ActivityClock::new();
        let peer = peer();
        clock.on_received(&peer, false);
        assert!(clock.last_received(&peer).is_some());
        assert!(clock.last_active(&peer).is_none());
    }

    #[tokio::test]
    async fn sweep_fires_once_per_idle_peer() {
        let clock = ActivityClock::new();
        let peer = peer();
        clock.on_received(&peer, true);

        assert!(clock.sweep(Duration::from_secs(60)).is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let idle = clock.sweep(Duration::from_millis(5));
        assert_eq!(idle, vec![peer.clone()]);
        // entry dropped: a second sweep stays quiet
        assert!(clock.sweep(Duration::from_millis(5)).is_empty());
        // the other clocks survive the sweep
        assert!(clock.last_received(&peer).is_some());
    }
}
