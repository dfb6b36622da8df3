// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The per-peer message state service.
//!
//! [`MessageStateService`] orchestrates sends and receives over the inflight
//! tables: it gates and classifies outgoing messages, allocates packet ids,
//! matches incoming frames against tracked exchanges, drives the QoS state
//! transitions, commits confirmed publishes to the application executor, and
//! reaps exchanges that outstay the inflight window.

mod activity;
mod flush;
mod flusher;
mod inflight;
mod wait_token;

pub use self::activity::ActivityClock;
pub use self::flush::{FlushScheduler, ProcessResult, QueueProcessor};
pub use self::flusher::QueueFlusher;
pub use self::inflight::{
    Direction, InflightEntry, InflightTables, PacketId, PeerInflight, WEAK_ATTACH,
};
pub use self::wait_token::WaitToken;

use self::inflight::lock;
use crate::config::{Config, Mode};
use crate::errors::{Error, Result};
use crate::messaging::{encode, valid_response, Message, QoS, TopicRef};
use crate::peers::Peer;
use crate::queue::{MessageQueue, QueuedPublish};
use crate::registry::MessageUuid;
use crate::security::{Integrity, Sha3Integrity};
use crate::transport::Transport;

use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Cap on the bounded client-mode wait loop when the window is saturated.
const MAX_CAPACITY_WAITS: usize = 8;

/// What the state service reports to the application executor.
#[derive(Debug)]
pub enum Event {
    /// An inbound publish committed: delivered at most-once/at-least-once
    /// receipt, or at PUBREL for exactly-once.
    MessageReceived {
        /// The publishing peer.
        peer: Peer,
        /// The wire topic reference the publish carried.
        topic: TopicRef,
        /// The payload, integrity-verified when a security service is wired.
        data: Bytes,
        /// The original PUBLISH frame.
        publish: Message,
    },
    /// An outbound publish committed: at write for QoS 0, at PUBACK for
    /// QoS 1, at PUBREC for QoS 2.
    MessageSent {
        /// The receiving peer.
        peer: Peer,
        /// Registry key of the payload, when the publish was queued.
        uuid: Option<MessageUuid>,
        /// The PUBLISH frame as transmitted.
        publish: Message,
    },
    /// A queued publish exhausted its retries against error responses.
    MessageSendFailure {
        /// The peer the delivery was for.
        peer: Peer,
        /// The abandoned publish.
        queued: QueuedPublish,
    },
    /// No active frame was exchanged with the peer inside the idle window.
    ActiveTimeout {
        /// The idle peer.
        peer: Peer,
    },
    /// The peer answered a tracked exchange with DISCONNECT.
    RemoteDisconnect {
        /// The disconnecting peer.
        peer: Peer,
    },
    /// The reaper gave up on a peer after repeated delivery timeouts.
    ConnectionLost {
        /// The peer presumed gone.
        peer: Peer,
    },
}

/// Extension point consulted before every send.
pub trait SendGate: Send + Sync {
    /// Whether the message may be sent to the peer at all.
    fn allowed_to_send(&self, _peer: &Peer, _msg: &Message) -> bool {
        true
    }
}

#[derive(Debug)]
struct AllowAll;

impl SendGate for AllowAll {}

/// Outcome of one locked marking attempt.
enum MarkAttempt {
    /// A fresh entry was tabled (or an existing exchange is being ridden).
    Token(WaitToken),
    /// The window is saturated; the blocking exchange's token, if it has one.
    Saturated(Option<WaitToken>),
}

/// The per-peer message state service.
pub struct MessageStateService {
    config: Config,
    inflight: InflightTables,
    activity: Arc<ActivityClock>,
    scheduler: Arc<FlushScheduler>,
    queue: Arc<MessageQueue>,
    transport: Arc<dyn Transport>,
    integrity: Option<Arc<dyn Integrity>>,
    events: Sender<Event>,
    gate: StdRwLock<Arc<dyn SendGate>>,
}

impl fmt::Debug for MessageStateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStateService")
            .field("mode", &self.config.mode)
            .field("peers", &self.inflight.tracked_peers().len())
            .finish()
    }
}

impl MessageStateService {
    /// Build the service and its owned collaborators (activity clocks, flush
    /// scheduler, message queue). The queue processor is wired in afterwards
    /// via [`FlushScheduler::set_processor`].
    pub fn new(config: Config, transport: Arc<dyn Transport>, events: Sender<Event>) -> Arc<Self> {
        let activity = Arc::new(ActivityClock::new());
        let scheduler = Arc::new(FlushScheduler::new(
            activity.clone(),
            config.min_flush_time(),
            config.active_context_timeout(),
        ));
        let queue = Arc::new(MessageQueue::new(config.max_queue_size));
        let integrity = config
            .integrity_key
            .as_ref()
            .map(|key| Arc::new(Sha3Integrity::new(key.as_bytes())) as Arc<dyn Integrity>);
        Arc::new(Self {
            config,
            inflight: InflightTables::default(),
            activity,
            scheduler,
            queue,
            transport,
            integrity,
            events,
            gate: StdRwLock::new(Arc::new(AllowAll)),
        })
    }

    /// The shared activity clocks.
    pub fn activity(&self) -> Arc<ActivityClock> {
        self.activity.clone()
    }

    /// The flush scheduler.
    pub fn scheduler(&self) -> Arc<FlushScheduler> {
        self.scheduler.clone()
    }

    /// The per-peer publish queues.
    pub fn queue(&self) -> Arc<MessageQueue> {
        self.queue.clone()
    }

    /// The security service, when enabled by config.
    pub fn integrity(&self) -> Option<Arc<dyn Integrity>> {
        self.integrity.clone()
    }

    /// The service options.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the send gate.
    pub fn set_send_gate(&self, gate: Arc<dyn SendGate>) {
        *self
            .gate
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = gate;
    }

    fn gate(&self) -> Arc<dyn SendGate> {
        self.gate
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current inflight count for a peer and direction.
    pub fn inflight_count(&self, peer: &Peer, source: Direction) -> usize {
        self.inflight.count(peer, source)
    }

    /// Send a message to the peer.
    ///
    /// Messages that expect a terminal response are tabled inflight first and
    /// return their confirmation token; the caller may block on it with
    /// [`MessageStateService::await_confirmation`]. QoS 0 publishes commit on
    /// the write itself.
    pub async fn send_message(
        &self,
        peer: &Peer,
        mut msg: Message,
        mut queued: Option<QueuedPublish>,
    ) -> Result<Option<WaitToken>> {
        if !self.gate().allowed_to_send(peer, &msg) {
            return Err(Error::ExpectationFailed(format!(
                "send of {:?} to {peer:?} denied",
                msg.msg_type()
            )));
        }

        // DUP reflects the delivery history before this attempt
        if let Some(q) = queued.as_ref() {
            let redelivery = q.retry_count > 1 || q.last_assigned_msg_id != 0;
            if let Message::Publish { dup, .. } = &mut msg {
                *dup = redelivery;
            }
        }

        let token = if msg.requires_response() {
            Some(self.mark_inflight(peer, &mut msg, &mut queued).await?)
        } else {
            None
        };

        let frame = match encode(&msg) {
            Ok(frame) => frame,
            Err(error) => {
                error!("Could not serialise {:?} for {peer:?}: {error}", msg.msg_type());
                if let Some(token) = &token {
                    token.fail(format!("could not serialise frame: {error}"));
                }
                if msg.requires_response() {
                    let (source, key) = entry_slot(&msg, queued.is_some());
                    if let Some(tables) = self.inflight.get(peer) {
                        let _ = lock(&tables).remove(source, key);
                    }
                }
                return Err(error);
            }
        };

        self.spawn_write(peer, msg, frame, queued, token.clone());
        Ok(token)
    }

    /// Table the message inflight, allocating a packet id when it needs one
    /// and none is assigned yet. An id carried by the message is kept, so DUP
    /// redeliveries re-use the id of the first attempt.
    async fn mark_inflight(
        &self,
        peer: &Peer,
        msg: &mut Message,
        queued: &mut Option<QueuedPublish>,
    ) -> Result<WaitToken> {
        let tables = self.inflight.peer(peer);
        let mut waits = 0;
        loop {
            let attempt = {
                let mut guard = lock(&tables);
                self.try_mark(&mut *guard, msg, queued)?
            };
            let blocker = match attempt {
                MarkAttempt::Token(token) => return Ok(token),
                MarkAttempt::Saturated(blocker) => blocker,
            };

            if self.config.mode == Mode::Gateway {
                return Err(Error::ExpectationFailed(format!(
                    "inflight window saturated for {peer:?}"
                )));
            }
            waits += 1;
            if waits > MAX_CAPACITY_WAITS {
                return Err(Error::ExpectationFailed(format!(
                    "inflight window stayed saturated for {peer:?}"
                )));
            }
            match blocker {
                Some(token) => {
                    if token.wait(self.config.max_wait()).await.is_err() {
                        return Err(Error::ExpectationFailed(
                            "blocking inflight exchange failed".to_string(),
                        ));
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// One marking attempt under the peer lock: ride an exchange already
    /// tabled under the same slot, report saturation, or allocate and insert.
    fn try_mark(
        &self,
        guard: &mut PeerInflight,
        msg: &mut Message,
        queued: &mut Option<QueuedPublish>,
    ) -> Result<MarkAttempt> {
        let (source, _) = entry_slot(msg, queued.is_some());

        if !(msg.needs_id() && msg.msg_id() == 0) {
            let (_, key) = entry_slot(msg, queued.is_some());
            if let Some(existing) = guard.get(source, key) {
                if existing.message.msg_type() == msg.msg_type() {
                    if let Some(token) = existing.token.clone() {
                        return Ok(MarkAttempt::Token(token));
                    }
                    let token = WaitToken::new(msg.clone(), self.config.max_error_retry_time());
                    guard.attach_token(source, key, token.clone());
                    return Ok(MarkAttempt::Token(token));
                }
                // the slot is busy with a different exchange
                return Ok(MarkAttempt::Saturated(existing.token.clone()));
            }
        }

        if guard.count(source) >= self.config.max_messages_inflight {
            match source {
                Direction::Local => {
                    return Ok(MarkAttempt::Saturated(guard.first_token(source)));
                }
                Direction::Remote => {
                    // inbound overflow is tolerated for liveness
                    warn!(
                        "Tolerating inbound inflight overflow ({} entries)",
                        guard.count(source)
                    );
                }
            }
        }

        if msg.needs_id() && msg.msg_id() == 0 {
            let id = guard.next_id(source, self.config.msg_id_start)?;
            msg.set_msg_id(id);
            if let Some(q) = queued.as_mut() {
                q.last_assigned_msg_id = id;
            }
        }

        let (_, key) = entry_slot(msg, queued.is_some());
        let token = WaitToken::new(msg.clone(), self.config.max_error_retry_time());
        guard.insert(
            source,
            key,
            InflightEntry {
                message: msg.clone(),
                source,
                token: Some(token.clone()),
                queued: queued.clone(),
                created_at: Instant::now(),
            },
        );
        Ok(MarkAttempt::Token(token))
    }

    /// Hand the frame to the transport off-thread. A successful write updates
    /// the activity clocks and commits QoS 0 publishes; a failed one fails the
    /// token.
    fn spawn_write(
        &self,
        peer: &Peer,
        msg: Message,
        frame: Bytes,
        queued: Option<QueuedPublish>,
        token: Option<WaitToken>,
    ) {
        let transport = self.transport.clone();
        let activity = self.activity.clone();
        let events = self.events.clone();
        let peer = peer.clone();
        let counts_as_active = msg.is_active();
        let commit_on_write =
            matches!(msg, Message::Publish { .. }) && !msg.requires_response();
        let uuid = queued.map(|q| q.uuid);

        let _handle = tokio::spawn(async move {
            match transport.write(peer.addr(), frame).await {
                Ok(()) => {
                    activity.on_sent(&peer, counts_as_active);
                    if commit_on_write {
                        let event = Event::MessageSent {
                            peer,
                            uuid,
                            publish: msg,
                        };
                        if events.send(event).await.is_err() {
                            trace!("Event receiver gone, dropping sent notification");
                        }
                    }
                }
                Err(error) => {
                    warn!("Datagram write to {peer:?} failed: {error}");
                    if let Some(token) = token {
                        token.fail(format!("transport failure: {error}"));
                    }
                }
            }
        });
    }

    /// Drive a received frame against the inflight tables.
    ///
    /// Returns the original message of the exchange the frame closed, when it
    /// closed one.
    pub async fn notify_received(&self, peer: &Peer, msg: Message) -> Result<Option<Message>> {
        self.activity.on_received(peer, msg.is_active());

        let lookup_source = if msg.originates_exchange() {
            Direction::Remote
        } else {
            Direction::Local
        };
        let lookup_id = if msg.needs_id() {
            PacketId::from(msg.msg_id())
        } else {
            WEAK_ATTACH
        };

        enum Matched {
            Terminal(InflightEntry),
            MidFlow {
                original: Message,
                uuid: Option<MessageUuid>,
            },
            None,
        }

        let matched = match self.inflight.get(peer) {
            Some(tables) => {
                let mut guard = lock(&tables);
                if !guard.exists(lookup_source, lookup_id) {
                    Matched::None
                } else if msg.is_terminal() {
                    match guard.remove(lookup_source, lookup_id) {
                        Some(entry) => Matched::Terminal(entry),
                        None => Matched::None,
                    }
                } else {
                    match guard.get(lookup_source, lookup_id) {
                        Some(entry) => Matched::MidFlow {
                            original: entry.message.clone(),
                            uuid: entry.queued.as_ref().map(|q| q.uuid),
                        },
                        None => Matched::None,
                    }
                }
            }
            None => Matched::None,
        };

        match matched {
            Matched::Terminal(entry) => self.handle_terminal(peer, msg, entry).await,
            Matched::MidFlow { original, uuid } => {
                if matches!(msg, Message::Pubrec { .. }) {
                    // outbound exactly-once commit point
                    self.dispatch_outbound_commit(peer, original, uuid);
                }
                Ok(None)
            }
            Matched::None => {
                self.handle_unmatched(peer, msg).await;
                Ok(None)
            }
        }
    }

    /// A terminal frame matched a tracked exchange.
    async fn handle_terminal(
        &self,
        peer: &Peer,
        msg: Message,
        entry: InflightEntry,
    ) -> Result<Option<Message>> {
        if !valid_response(&entry.message, &msg) {
            if matches!(msg, Message::Disconnect { .. }) {
                debug!("Unexpected DISCONNECT from {peer:?} closed {}", entry.message);
                if let Some(token) = &entry.token {
                    token.fail("unexpected disconnect from peer");
                }
                self.emit(Event::RemoteDisconnect { peer: peer.clone() });
                return Ok(None);
            }
            if let Some(token) = &entry.token {
                token.fail(format!(
                    "invalid response {:?} to {:?}",
                    msg.msg_type(),
                    entry.message.msg_type()
                ));
            }
            return Err(Error::InvalidResponse {
                request: entry.message.msg_type(),
                response: msg.msg_type(),
            });
        }

        if msg.is_error_frame() {
            let return_code = msg.return_code().unwrap_or(crate::messaging::ReturnCode::Accepted);
            if let Some(token) = &entry.token {
                token.fail(format!("protocol error: {:?}", return_code));
            }
            if let Some(queued) = entry.queued {
                if queued.retry_count >= self.config.max_error_retries {
                    debug!(
                        "Giving up on {} for {peer:?} after {} attempts",
                        queued.uuid, queued.retry_count
                    );
                    self.emit(Event::MessageSendFailure {
                        peer: peer.clone(),
                        queued,
                    });
                } else {
                    match self.queue.offer(peer, queued).await {
                        Ok(()) => self.scheduler.schedule_flush(peer),
                        Err(error) => warn!("Could not re-offer rejected publish: {error}"),
                    }
                }
            }
            return Err(Error::Protocol(return_code));
        }

        if let Some(token) = &entry.token {
            token.complete(msg.clone());
        }
        match &msg {
            // inbound exactly-once commit point
            Message::Pubrel { .. } => {
                self.dispatch_inbound_commit(peer, entry.message.clone());
            }
            // outbound at-least-once commit point
            Message::Puback { .. } => {
                let uuid = entry.queued.as_ref().map(|q| q.uuid);
                self.dispatch_outbound_commit(peer, entry.message.clone(), uuid);
            }
            _ => {}
        }
        Ok(Some(entry.message))
    }

    /// A frame with no tracked exchange: a peer-initiated publish, or noise.
    async fn handle_unmatched(&self, peer: &Peer, msg: Message) {
        let (qos, msg_id) = match &msg {
            Message::Publish { qos, msg_id, .. } => (*qos, *msg_id),
            _ => return,
        };
        if qos == QoS::ExactlyOnce && msg_id != 0 {
            // pin it awaiting PUBREL
            let mut pin = msg;
            let mut no_queue = None;
            if let Err(error) = self.mark_inflight(peer, &mut pin, &mut no_queue).await {
                warn!("Could not pin inbound publish from {peer:?}: {error}");
            }
        } else {
            self.dispatch_inbound_commit(peer, msg);
        }
    }

    /// Deliver an inbound publish to the application executor, verifying the
    /// payload when a security service is wired in.
    fn dispatch_inbound_commit(&self, peer: &Peer, publish: Message) {
        let (topic, data) = match &publish {
            Message::Publish { topic, data, .. } => (*topic, data.clone()),
            other => {
                warn!("Commit of a non-publish {:?} dropped", other.msg_type());
                return;
            }
        };
        let data = match &self.integrity {
            Some(integrity) => match integrity.unwrap(&data) {
                Ok(data) => data,
                Err(_) => {
                    warn!("Dropping publish from {peer:?}: integrity check failed");
                    return;
                }
            },
            None => data,
        };
        self.emit(Event::MessageReceived {
            peer: peer.clone(),
            topic,
            data,
            publish,
        });
    }

    /// Notify the application executor that an outbound publish was confirmed.
    fn dispatch_outbound_commit(&self, peer: &Peer, publish: Message, uuid: Option<MessageUuid>) {
        self.emit(Event::MessageSent {
            peer: peer.clone(),
            uuid,
            publish,
        });
    }

    /// Hand an event to the application executor without blocking the
    /// protocol task.
    fn emit(&self, event: Event) {
        let events = self.events.clone();
        let _handle = tokio::spawn(async move {
            if events.send(event).await.is_err() {
                trace!("Event receiver gone");
            }
        });
    }

    /// Evict inflight entries past the eviction horizon; `None` forces a full
    /// clear. The sending direction is always swept, the receiving one only
    /// when configured. Requeueable evictions are re-offered to the queue.
    pub async fn clear_inflight(&self, peer: &Peer, eviction_time: Option<Instant>) {
        let tables = match self.inflight.get(peer) {
            Some(tables) => tables,
            None => return,
        };
        let max_age = self.config.max_time_inflight();
        let mut evicted = {
            let mut guard = lock(&tables);
            let mut evicted = guard.drain_expired(Direction::Local, eviction_time, max_age);
            if self.config.reap_receiving_messages {
                evicted.extend(guard.drain_expired(Direction::Remote, eviction_time, max_age));
            }
            evicted
        };

        let mut requeued = false;
        for entry in evicted.drain(..) {
            if let Some(token) = &entry.token {
                if !token.is_complete() {
                    token.fail("timed out in flight");
                }
            }
            let mut queued = match entry.queued {
                Some(queued) => queued,
                None => continue,
            };
            if !self.config.requeue_on_inflight_timeout {
                continue;
            }
            let exhausted = queued.retry_count > self.config.max_error_retries;
            if exhausted {
                queued.retry_count = 0;
            }
            match self.queue.offer(peer, queued).await {
                Ok(()) => requeued = true,
                Err(error) => warn!("Could not re-offer timed-out publish: {error}"),
            }
            if exhausted {
                self.emit(Event::ConnectionLost { peer: peer.clone() });
            }
        }
        if requeued {
            self.scheduler.schedule_flush(peer);
        }
    }

    /// Authoritative peer teardown: cancel the flush task, drop the activity
    /// clocks and the id allocator seeds. Inflight entries are purged by the
    /// caller via [`MessageStateService::clear_inflight`] if desired.
    pub fn clear(&self, peer: &Peer) {
        self.scheduler.unschedule_flush(peer);
        self.activity.forget(peer);
        if let Some(tables) = self.inflight.get(peer) {
            let empty = {
                let mut guard = lock(&tables);
                guard.reset_last_used();
                guard.is_empty()
            };
            if empty {
                self.inflight.forget(peer);
            }
        }
    }

    /// Block on a confirmation token. A timeout forces a full inflight clear
    /// for the peer before it is surfaced.
    pub async fn await_confirmation(
        &self,
        peer: &Peer,
        token: &WaitToken,
        timeout: std::time::Duration,
    ) -> Result<Message> {
        match token.wait(timeout).await {
            Ok(response) => Ok(response),
            Err(error @ Error::Timeout(_)) => {
                debug!("Confirmation wait for {peer:?} elapsed, clearing inflight");
                self.clear_inflight(peer, None).await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Spawn the periodic activity sweep and inflight reaper.
    pub fn spawn_state_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.config.state_loop_timeout());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                let _instant = interval.tick().await;
                for peer in service.activity.sweep(service.config.active_context_timeout()) {
                    debug!("Active context timed out for {peer:?}");
                    service.emit(Event::ActiveTimeout { peer });
                }
                let now = Instant::now();
                for peer in service.inflight.tracked_peers() {
                    service.clear_inflight(&peer, Some(now)).await;
                }
            }
        })
    }
}

/// The table slot a message belongs to: its direction (with the publish
/// override: local iff queued) and its key (wire id, or the weak attach
/// sentinel for id-less kinds).
fn entry_slot(msg: &Message, has_queued: bool) -> (Direction, PacketId) {
    let source = match msg {
        Message::Publish { .. } => {
            if has_queued {
                Direction::Local
            } else {
                Direction::Remote
            }
        }
        _ => {
            if msg.originates_exchange() {
                Direction::Local
            } else {
                Direction::Remote
            }
        }
    };
    let key = if msg.needs_id() {
        PacketId::from(msg.msg_id())
    } else {
        WEAK_ATTACH
    };
    (source, key)
}
