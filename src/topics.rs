// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Topic normalization: full topic paths vs the three 16-bit wire forms
//! (registered alias, predefined id, short topic).

use crate::errors::{Error, Result};
use crate::messaging::TopicRef;
use crate::peers::Peer;

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct PeerTopics {
    by_alias: BTreeMap<u16, String>,
    by_path: BTreeMap<String, u16>,
    next_alias: u16,
}

/// Topic registry: the predefined table plus per-peer alias registrations.
#[derive(Debug)]
pub struct TopicRegistry {
    predefined: BTreeMap<u16, String>,
    predefined_rev: BTreeMap<String, u16>,
    registrations: DashMap<Peer, Arc<RwLock<PeerTopics>>>,
}

impl TopicRegistry {
    /// New registry seeded with the predefined table.
    pub fn new(predefined: &BTreeMap<u16, String>) -> Self {
        let predefined_rev = predefined
            .iter()
            .map(|(id, path)| (path.clone(), *id))
            .collect();
        Self {
            predefined: predefined.clone(),
            predefined_rev,
            registrations: DashMap::new(),
        }
    }

    fn peer_topics(&self, peer: &Peer) -> Arc<RwLock<PeerTopics>> {
        self.registrations
            .entry(peer.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Allocate (or return the existing) alias for a topic path in a peer's
    /// session.
    pub fn register(&self, peer: &Peer, path: &str) -> u16 {
        let topics = self.peer_topics(peer);
        let mut guard = topics.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(alias) = guard.by_path.get(path) {
            return *alias;
        }
        guard.next_alias = guard.next_alias.wrapping_add(1).max(1);
        while guard.by_alias.contains_key(&guard.next_alias) {
            guard.next_alias = guard.next_alias.wrapping_add(1).max(1);
        }
        let alias = guard.next_alias;
        let _ = guard.by_alias.insert(alias, path.to_string());
        let _ = guard.by_path.insert(path.to_string(), alias);
        alias
    }

    /// Record an alias announced by the peer (an incoming REGISTER, or the
    /// topic id returned in a SUBACK/REGACK).
    pub fn learn(&self, peer: &Peer, alias: u16, path: &str) {
        if alias == 0 {
            return;
        }
        let topics = self.peer_topics(peer);
        let mut guard = topics.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = guard.by_alias.insert(alias, path.to_string());
        let _ = guard.by_path.insert(path.to_string(), alias);
    }

    /// Resolve a wire topic reference to the full topic path.
    pub fn resolve(&self, peer: &Peer, topic: &TopicRef) -> Result<String> {
        match topic {
            TopicRef::Normal(alias) => {
                let topics = self.peer_topics(peer);
                let guard = topics.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard
                    .by_alias
                    .get(alias)
                    .cloned()
                    .ok_or_else(|| Error::UnknownTopic(format!("alias {}", alias)))
            }
            TopicRef::Predefined(id) => self
                .predefined
                .get(id)
                .cloned()
                .ok_or_else(|| Error::UnknownTopic(format!("predefined id {}", id))),
            TopicRef::Short(_) => topic
                .short_path()
                .ok_or_else(|| Error::UnknownTopic("empty short topic".to_string())),
        }
    }

    /// Pick the wire form for a topic path in a peer's session: short when the
    /// path fits, the predefined id when the table has one, the registered
    /// alias otherwise. `None` means the path must be REGISTERed first.
    pub fn topic_ref_for(&self, peer: &Peer, path: &str) -> Option<TopicRef> {
        if let Some(short) = TopicRef::short(path) {
            return Some(short);
        }
        if let Some(id) = self.predefined_rev.get(path) {
            return Some(TopicRef::Predefined(*id));
        }
        let topics = self.peer_topics(peer);
        let guard = topics.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.by_path.get(path).map(|alias| TopicRef::Normal(*alias))
    }

    /// Drop a peer's registrations.
    pub fn forget(&self, peer: &Peer) {
        let _ = self.registrations.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn peer() -> Peer {
        Peer::new("sensor-1", ([127, 0, 0, 1], 2442).into())
    }

    fn registry() -> TopicRegistry {
        let mut predefined = BTreeMap::new();
        let _ = predefined.insert(12, "building/alarms".to_string());
        TopicRegistry::new(&predefined)
    }

    #[test]
    fn register_is_idempotent_per_path() {
        let registry = registry();
        let peer = peer();
        let alias = registry.register(&peer, "sensors/temp");
        assert_eq!(registry.register(&peer, "sensors/temp"), alias);
        assert_ne!(registry.register(&peer, "sensors/humidity"), alias);
        assert_eq!(
            registry
                .resolve(&peer, &TopicRef::Normal(alias))
                .expect("registered"),
            "sensors/temp"
        );
    }

    #[test]
    fn short_and_predefined_paths_win_over_aliases() {
        let registry = registry();
        let peer = peer();
        assert_eq!(
            registry.topic_ref_for(&peer, "ab"),
            Some(TopicRef::Short([b'a', b'b']))
        );
        assert_eq!(
            registry.topic_ref_for(&peer, "building/alarms"),
            Some(TopicRef::Predefined(12))
        );
        assert_eq!(registry.topic_ref_for(&peer, "sensors/temp"), None);
    }

    #[test]
    fn unknown_references_error() {
        let registry = registry();
        let peer = peer();
        assert_matches!(
            registry.resolve(&peer, &TopicRef::Normal(9)),
            Err(Error::UnknownTopic(_))
        );
        assert_matches!(
            registry.resolve(&peer, &TopicRef::Predefined(99)),
            Err(Error::UnknownTopic(_))
        );
    }

    #[test]
    fn learned_aliases_resolve_and_registrations_are_per_peer() {
        let registry = registry();
        let peer = peer();
        let other = Peer::new("sensor-2", ([127, 0, 0, 1], 2443).into());
        registry.learn(&peer, 7, "sensors/temp");
        assert_eq!(
            registry
                .resolve(&peer, &TopicRef::Normal(7))
                .expect("learned"),
            "sensors/temp"
        );
        assert_matches!(
            registry.resolve(&other, &TopicRef::Normal(7)),
            Err(Error::UnknownTopic(_))
        );
    }
}
