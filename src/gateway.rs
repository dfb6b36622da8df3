// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The MQTT-SN gateway: per-address client sessions, topic registration and
//! subscriptions, and fan-out of committed publishes through the per-peer
//! queues and the flush scheduler.

use crate::config::{Config, Mode};
use crate::errors::Result;
use crate::messaging::{decode, Message, QoS, ReturnCode, TopicRef, TopicSpec};
use crate::peers::Peer;
use crate::queue::{MessageQueue, QueuedPublish};
use crate::registry::MessageRegistry;
use crate::state::{Event, MessageStateService, QueueFlusher};
use crate::topics::TopicRegistry;
use crate::transport::UdpTransport;
use crate::EVENT_CHANNEL_SIZE;

use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An MQTT-SN gateway over one UDP socket.
pub struct Gateway {
    config: Config,
    service: Arc<MessageStateService>,
    transport: UdpTransport,
    registry: Arc<MessageRegistry>,
    topics: Arc<TopicRegistry>,
    queue: Arc<MessageQueue>,
    sessions: DashMap<SocketAddr, Peer>,
    subscriptions: DashMap<String, Vec<(Peer, QoS)>>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Gateway {
    /// Bind the listener socket and start the background loops. Call
    /// [`Gateway::run`] afterwards to serve frames.
    pub async fn bind(mut config: Config, addr: SocketAddr) -> Result<Arc<Self>> {
        config.mode = Mode::Gateway;
        let transport = UdpTransport::bind(addr).await?;
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let service =
            MessageStateService::new(config.clone(), Arc::new(transport.clone()), events_tx);
        let registry = Arc::new(MessageRegistry::new(Some(config.message_ttl())));
        let topics = Arc::new(TopicRegistry::new(&config.predefined_topics));
        let queue = service.queue();
        service.scheduler().set_processor(Arc::new(QueueFlusher::new(
            service.clone(),
            queue.clone(),
            registry.clone(),
            topics.clone(),
        )));

        let gateway = Arc::new(Self {
            config,
            service: service.clone(),
            transport,
            registry: registry.clone(),
            topics,
            queue,
            sessions: DashMap::new(),
            subscriptions: DashMap::new(),
        });

        // the application executor: commits and advisory notifications
        {
            let gateway = gateway.clone();
            let _handle = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    gateway.handle_event(event).await;
                }
            });
        }
        let _state_loop = service.spawn_state_loop();
        let _tidy_loop = registry.spawn_tidy_loop(gateway.config.state_loop_timeout());

        Ok(gateway)
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve datagrams until the socket loop ends.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let (frames_tx, mut frames_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let _receiver = self.transport.spawn_receiver(frames_tx);
        info!("Gateway listening on {}", self.local_addr()?);
        while let Some((addr, frame)) = frames_rx.recv().await {
            match decode(&frame) {
                Ok(msg) => self.handle_frame(addr, msg).await,
                Err(error) => warn!("Undecodable datagram from {addr}: {error}"),
            }
        }
        Ok(())
    }

    async fn handle_frame(self: &Arc<Self>, addr: SocketAddr, msg: Message) {
        if let Message::Connect {
            client_id,
            version,
            clean_session,
            ..
        } = &msg
        {
            let peer = Peer::with_version(client_id.clone(), addr, *version);
            if *clean_session {
                self.forget_peer_state(&peer);
            }
            let _previous = self.sessions.insert(addr, peer.clone());
            let _ = self.service.notify_received(&peer, msg.clone()).await;
            self.reply(
                &peer,
                Message::Connack {
                    return_code: ReturnCode::Accepted,
                },
            )
            .await;
            info!("Session established for {peer:?}");
            return;
        }

        let peer = match self.sessions.get(&addr).map(|entry| entry.value().clone()) {
            Some(peer) => peer,
            None => {
                self.handle_sessionless(addr, msg).await;
                return;
            }
        };

        // reject publishes whose topic reference we cannot resolve before the
        // state service tables or commits anything
        if let Message::Publish {
            qos, msg_id, topic, ..
        } = &msg
        {
            if !matches!(qos, QoS::MinusOne) && self.topics.resolve(&peer, topic).is_err() {
                debug!("Rejecting publish with unknown topic {topic:?} from {peer:?}");
                self.reply(
                    &peer,
                    Message::Puback {
                        topic_id: topic.raw_id(),
                        msg_id: *msg_id,
                        return_code: ReturnCode::InvalidTopicId,
                    },
                )
                .await;
                return;
            }
        }

        if let Err(error) = self.service.notify_received(&peer, msg.clone()).await {
            warn!("Frame from {peer:?} not accepted: {error}");
        }

        match &msg {
            Message::Register {
                msg_id, topic_name, ..
            } => {
                let alias = self.topics.register(&peer, topic_name);
                self.reply(
                    &peer,
                    Message::Regack {
                        topic_id: alias,
                        msg_id: *msg_id,
                        return_code: ReturnCode::Accepted,
                    },
                )
                .await;
            }
            Message::Subscribe {
                qos, msg_id, topic, ..
            } => self.handle_subscribe(&peer, *qos, *msg_id, topic).await,
            Message::Unsubscribe { msg_id, topic } => {
                if let Some(path) = self.spec_path(&peer, topic) {
                    self.remove_subscription(&peer, &path);
                }
                self.reply(&peer, Message::Unsuback { msg_id: *msg_id }).await;
            }
            Message::Publish {
                qos, msg_id, topic, ..
            } => match qos {
                QoS::AtLeastOnce => {
                    self.reply(
                        &peer,
                        Message::Puback {
                            topic_id: topic.raw_id(),
                            msg_id: *msg_id,
                            return_code: ReturnCode::Accepted,
                        },
                    )
                    .await;
                }
                QoS::ExactlyOnce => {
                    self.reply(&peer, Message::Pubrec { msg_id: *msg_id }).await;
                }
                _ => {}
            },
            // our exactly-once publish was received, release it
            Message::Pubrec { msg_id } => {
                self.reply(&peer, Message::Pubrel { msg_id: *msg_id }).await;
            }
            // the peer's exactly-once publish is released, close it
            Message::Pubrel { msg_id } => {
                self.reply(&peer, Message::Pubcomp { msg_id: *msg_id }).await;
            }
            Message::Pingreq { .. } => {
                self.reply(&peer, Message::Pingresp).await;
            }
            Message::Disconnect { .. } => {
                self.reply(&peer, Message::Disconnect { duration: None }).await;
                self.drop_session(&peer).await;
            }
            _ => {}
        }
    }

    /// The connectionless QoS -1 publish is allowed through without a
    /// session; everything else is noise.
    async fn handle_sessionless(self: &Arc<Self>, addr: SocketAddr, msg: Message) {
        match msg {
            Message::Publish {
                qos: QoS::MinusOne,
                topic,
                data,
                ..
            } => {
                let anonymous = Peer::new("", addr);
                let path = match self.topics.resolve(&anonymous, &topic) {
                    Ok(path) => path,
                    Err(error) => {
                        debug!("Dropping connectionless publish from {addr}: {error}");
                        return;
                    }
                };
                let data = match self.service.integrity() {
                    Some(integrity) => match integrity.unwrap(&data) {
                        Ok(data) => data,
                        Err(_) => {
                            warn!("Dropping connectionless publish from {addr}: integrity check failed");
                            return;
                        }
                    },
                    None => data,
                };
                self.route_publish(&anonymous, &path, QoS::AtMostOnce, false, data)
                    .await;
            }
            other => {
                debug!("Ignoring {:?} from unknown endpoint {addr}", other.msg_type());
            }
        }
    }

    async fn handle_subscribe(self: &Arc<Self>, peer: &Peer, qos: QoS, msg_id: u16, topic: &TopicSpec) {
        let resolved = match topic {
            TopicSpec::Name(name) => {
                let alias = self.topics.register(peer, name);
                Some((name.clone(), alias))
            }
            TopicSpec::Predefined(id) => self
                .config
                .predefined_topics
                .get(id)
                .map(|path| (path.clone(), *id)),
            TopicSpec::Short(chars) => TopicRef::Short(*chars)
                .short_path()
                .map(|path| (path, u16::from_be_bytes(*chars))),
        };
        let (path, topic_id) = match resolved {
            Some(resolved) => resolved,
            None => {
                self.reply(
                    peer,
                    Message::Suback {
                        qos: QoS::AtMostOnce,
                        topic_id: 0,
                        msg_id,
                        return_code: ReturnCode::InvalidTopicId,
                    },
                )
                .await;
                return;
            }
        };

        let granted = match qos {
            QoS::MinusOne => QoS::AtMostOnce,
            other => other,
        };
        {
            let mut subscribers = self.subscriptions.entry(path.clone()).or_default();
            subscribers.value_mut().retain(|(subscriber, _)| subscriber != peer);
            subscribers.value_mut().push((peer.clone(), granted));
        }
        debug!("{peer:?} subscribed to {path} at {granted:?}");
        self.reply(
            peer,
            Message::Suback {
                qos: granted,
                topic_id,
                msg_id,
                return_code: ReturnCode::Accepted,
            },
        )
        .await;
    }

    fn spec_path(&self, peer: &Peer, topic: &TopicSpec) -> Option<String> {
        match topic {
            TopicSpec::Name(name) => Some(name.clone()),
            TopicSpec::Predefined(id) => self.config.predefined_topics.get(id).cloned(),
            TopicSpec::Short(chars) => TopicRef::Short(*chars).short_path(),
        }
    }

    fn remove_subscription(&self, peer: &Peer, path: &str) {
        if let Some(mut subscribers) = self.subscriptions.get_mut(path) {
            subscribers.value_mut().retain(|(subscriber, _)| subscriber != peer);
        }
    }

    /// Commits and advisory notifications from the state service.
    async fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::MessageReceived {
                peer,
                topic,
                data,
                publish,
            } => {
                let path = match self.topics.resolve(&peer, &topic) {
                    Ok(path) => path,
                    Err(error) => {
                        warn!("Committed publish with unresolvable topic from {peer:?}: {error}");
                        return;
                    }
                };
                let qos = match publish.qos() {
                    Some(QoS::MinusOne) | None => QoS::AtMostOnce,
                    Some(qos) => qos,
                };
                let retain = matches!(publish, Message::Publish { retain: true, .. });
                self.route_publish(&peer, &path, qos, retain, data).await;
            }
            Event::MessageSent { peer, uuid, .. } => {
                trace!("Delivery to {peer:?} confirmed ({uuid:?})");
            }
            Event::MessageSendFailure { peer, queued } => {
                warn!(
                    "Giving up delivery of {} to {peer:?} after {} attempts",
                    queued.uuid, queued.retry_count
                );
            }
            Event::ActiveTimeout { peer } => {
                info!("{peer:?} idle past the active context timeout, dropping session");
                self.drop_session(&peer).await;
            }
            Event::RemoteDisconnect { peer } => {
                self.drop_session(&peer).await;
            }
            Event::ConnectionLost { peer } => {
                info!("Repeated delivery timeouts for {peer:?}, dropping session");
                self.drop_session(&peer).await;
            }
        }
    }

    /// Fan a committed publish out to every subscriber of the topic.
    async fn route_publish(
        self: &Arc<Self>,
        origin: &Peer,
        path: &str,
        qos: QoS,
        retain: bool,
        data: Bytes,
    ) {
        let subscribers = match self.subscriptions.get(path) {
            Some(subscribers) => subscribers.value().clone(),
            None => return,
        };
        if subscribers.is_empty() {
            return;
        }

        let payload = match self.service.integrity() {
            Some(integrity) => integrity.wrap(&data),
            None => data,
        };
        let uuid = self.registry.add(payload);
        for (subscriber, granted) in subscribers {
            if &subscriber == origin {
                continue;
            }
            // make sure the subscriber has a wire form for the topic; a fresh
            // alias is announced with REGISTER before the publish goes out
            if self.topics.topic_ref_for(&subscriber, path).is_none() {
                let alias = self.topics.register(&subscriber, path);
                let register = Message::Register {
                    topic_id: alias,
                    msg_id: 0,
                    topic_name: path.to_string(),
                };
                if let Err(error) = self.service.send_message(&subscriber, register, None).await {
                    warn!("Could not announce topic alias to {subscriber:?}: {error}");
                    continue;
                }
            }
            let delivery_qos = qos.min(granted);
            let queued = QueuedPublish::new(uuid, path, delivery_qos, retain);
            match self.queue.offer(&subscriber, queued).await {
                Ok(()) => self.service.scheduler().schedule_flush(&subscriber),
                Err(error) => warn!("Not queueing for {subscriber:?}: {error}"),
            }
        }
    }

    fn forget_peer_state(&self, peer: &Peer) {
        self.topics.forget(peer);
        self.queue.forget(peer);
        for mut entry in self.subscriptions.iter_mut() {
            entry.value_mut().retain(|(subscriber, _)| subscriber != peer);
        }
    }

    async fn drop_session(self: &Arc<Self>, peer: &Peer) {
        self.service.clear_inflight(peer, None).await;
        self.service.clear(peer);
        self.forget_peer_state(peer);
        let _session = self.sessions.remove(&peer.addr());
        debug!("Session for {peer:?} dropped");
    }

    async fn reply(&self, peer: &Peer, msg: Message) {
        if let Err(error) = self.service.send_message(peer, msg, None).await {
            warn!("Could not reply to {peer:?}: {error}");
        }
    }
}
