// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Whether this endpoint behaves as a client or as a gateway.
///
/// The distinction only matters to the state service when the inflight window
/// is saturated: a client waits for the blocking exchange to finish, a gateway
/// fails the send immediately.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Mode {
    /// Client endpoint.
    Client,
    /// Gateway endpoint.
    Gateway,
}

/// Runtime options for the state service and its collaborators.
///
/// Durations are carried as milliseconds so the struct stays trivially
/// (de)serialisable from a JSON config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Operating mode.
    pub mode: Mode,
    /// Upper bound of inflight entries per (peer, direction).
    pub max_messages_inflight: usize,
    /// Requeue attempts for a publish before giving up on it.
    pub max_error_retries: u32,
    /// Lower bound on the effective confirmation wait, in ms, so error-retry
    /// pathways can finish even under aggressive caller deadlines.
    pub max_error_retry_time: u64,
    /// Age in ms after which the reaper evicts an inflight entry.
    pub max_time_inflight: u64,
    /// Default caller confirmation wait, in ms.
    pub max_wait: u64,
    /// Lower bound for packet id allocation (>= 1).
    pub msg_id_start: u16,
    /// Reschedule delay in ms for a flush task asked to run again.
    pub min_flush_time: u64,
    /// Idle threshold in ms after which a peer's activity context times out.
    pub active_context_timeout: u64,
    /// Worker threads for the runtime owned by the gateway binary.
    pub queue_processor_thread_count: usize,
    /// Whether the reaper re-offers timed-out publishes to the queue.
    pub requeue_on_inflight_timeout: bool,
    /// Whether the reaper also sweeps the receiving (remote) direction.
    pub reap_receiving_messages: bool,
    /// Period in ms of the activity sweep / reaper loop.
    pub state_loop_timeout: u64,
    /// Bound of the per-peer publish queue.
    pub max_queue_size: usize,
    /// TTL in ms of payloads held in the message registry.
    pub message_ttl: u64,
    /// Predefined topic ids, shared by out-of-band agreement.
    pub predefined_topics: BTreeMap<u16, String>,
    /// Key enabling payload integrity wrapping when set.
    pub integrity_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            max_messages_inflight: 1,
            max_error_retries: 3,
            max_error_retry_time: 10_000,
            max_time_inflight: 20_000,
            max_wait: 10_000,
            msg_id_start: 1,
            min_flush_time: 50,
            active_context_timeout: 60_000,
            queue_processor_thread_count: 2,
            requeue_on_inflight_timeout: true,
            reap_receiving_messages: false,
            state_loop_timeout: 1_000,
            max_queue_size: 100,
            message_ttl: 60_000,
            predefined_topics: BTreeMap::new(),
            integrity_key: None,
        }
    }
}

impl Config {
    /// Lower bound on the effective confirmation wait.
    pub fn max_error_retry_time(&self) -> Duration {
        Duration::from_millis(self.max_error_retry_time)
    }

    /// Age after which the reaper evicts an inflight entry.
    pub fn max_time_inflight(&self) -> Duration {
        Duration::from_millis(self.max_time_inflight)
    }

    /// Default caller confirmation wait.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait)
    }

    /// Reschedule delay for a flush task asked to run again.
    pub fn min_flush_time(&self) -> Duration {
        Duration::from_millis(self.min_flush_time)
    }

    /// Idle threshold after which a peer's activity context times out.
    pub fn active_context_timeout(&self) -> Duration {
        Duration::from_millis(self.active_context_timeout)
    }

    /// Period of the activity sweep / reaper loop.
    pub fn state_loop_timeout(&self) -> Duration {
        Duration::from_millis(self.state_loop_timeout)
    }

    /// TTL of payloads held in the message registry.
    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl)
    }
}
