// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The MQTT-SN client: a UDP socket, a receive loop feeding the state
//! service, and the blocking request surface (connect, register, subscribe,
//! publish, ping, disconnect).

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::messaging::{decode, Message, QoS, ReturnCode, TopicRef, TopicSpec};
use crate::peers::Peer;
use crate::queue::{MessageQueue, QueuedPublish};
use crate::registry::{MessageRegistry, MessageUuid};
use crate::state::{Event, MessageStateService, QueueFlusher, WaitToken};
use crate::topics::TopicRegistry;
use crate::transport::UdpTransport;
use crate::EVENT_CHANNEL_SIZE;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;

/// An MQTT-SN client session against one gateway.
///
/// Commits, idle timeouts and delivery failures arrive on the [`Event`]
/// receiver returned by [`Client::connect`].
pub struct Client {
    peer: Peer,
    service: Arc<MessageStateService>,
    queue: Arc<MessageQueue>,
    registry: Arc<MessageRegistry>,
    topics: Arc<TopicRegistry>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("peer", &self.peer).finish()
    }
}

impl Client {
    /// Bind a local socket, start the protocol loops and run the CONNECT
    /// handshake against the gateway.
    pub async fn connect(
        gateway: SocketAddr,
        client_id: &str,
        config: Config,
    ) -> Result<(Self, Receiver<Event>)> {
        let transport = UdpTransport::bind(([0, 0, 0, 0], 0).into()).await?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let service = MessageStateService::new(config.clone(), Arc::new(transport.clone()), events_tx);
        let registry = Arc::new(MessageRegistry::new(Some(config.message_ttl())));
        let topics = Arc::new(TopicRegistry::new(&config.predefined_topics));
        let queue = service.queue();
        service.scheduler().set_processor(Arc::new(QueueFlusher::new(
            service.clone(),
            queue.clone(),
            registry.clone(),
            topics.clone(),
        )));

        let peer = Peer::new(client_id, gateway);

        let mut tasks = Vec::new();
        let (frames_tx, mut frames_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        tasks.push(transport.spawn_receiver(frames_tx));
        {
            let service = service.clone();
            let topics = topics.clone();
            let peer = peer.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((addr, frame)) = frames_rx.recv().await {
                    if addr != gateway {
                        warn!("Ignoring datagram from unexpected source {addr}");
                        continue;
                    }
                    match decode(&frame) {
                        Ok(msg) => handle_gateway_frame(&service, &topics, &peer, msg).await,
                        Err(error) => warn!("Undecodable datagram from gateway: {error}"),
                    }
                }
            }));
        }
        tasks.push(service.spawn_state_loop());
        tasks.push(registry.spawn_tidy_loop(config.state_loop_timeout()));

        let client = Self {
            peer,
            service,
            queue,
            registry,
            topics,
            tasks,
        };
        client.handshake(&config).await?;
        Ok((client, events_rx))
    }

    async fn handshake(&self, config: &Config) -> Result<()> {
        let keepalive = (config.active_context_timeout / 1_000).min(u64::from(u16::MAX)) as u16;
        let connect = Message::Connect {
            will: false,
            clean_session: true,
            version: self.peer.version(),
            duration: keepalive,
            client_id: self.peer.client_id().to_string(),
        };
        let token = self.send_tracked(connect).await?;
        let _connack = self.confirm(&token).await?;
        info!("Session established with gateway {}", self.peer.addr());
        Ok(())
    }

    async fn send_tracked(&self, msg: Message) -> Result<WaitToken> {
        self.service
            .send_message(&self.peer, msg, None)
            .await?
            .ok_or_else(|| {
                Error::ExpectationFailed("message carries no confirmation".to_string())
            })
    }

    async fn confirm(&self, token: &WaitToken) -> Result<Message> {
        self.service
            .await_confirmation(&self.peer, token, self.service.config().max_wait())
            .await
    }

    /// Register a topic name, returning the alias the gateway assigned.
    pub async fn register(&self, topic: &str) -> Result<u16> {
        let msg = Message::Register {
            topic_id: 0,
            msg_id: 0,
            topic_name: topic.to_string(),
        };
        let token = self.send_tracked(msg).await?;
        match self.confirm(&token).await? {
            Message::Regack { topic_id, .. } => {
                self.topics.learn(&self.peer, topic_id, topic);
                Ok(topic_id)
            }
            other => Err(Error::ExpectationFailed(format!(
                "register confirmed by {:?}",
                other.msg_type()
            ))),
        }
    }

    /// Subscribe to a topic, returning the granted QoS.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<QoS> {
        let by_name = matches!(self.topic_spec(topic), TopicSpec::Name(_));
        let msg = Message::Subscribe {
            dup: false,
            qos,
            msg_id: 0,
            topic: self.topic_spec(topic),
        };
        let token = self.send_tracked(msg).await?;
        match self.confirm(&token).await? {
            Message::Suback {
                qos: granted,
                topic_id,
                ..
            } => {
                if by_name && topic_id != 0 {
                    self.topics.learn(&self.peer, topic_id, topic);
                }
                Ok(granted)
            }
            other => Err(Error::ExpectationFailed(format!(
                "subscribe confirmed by {:?}",
                other.msg_type()
            ))),
        }
    }

    /// Drop a subscription.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let msg = Message::Unsubscribe {
            msg_id: 0,
            topic: self.topic_spec(topic),
        };
        let token = self.send_tracked(msg).await?;
        let _unsuback = self.confirm(&token).await?;
        Ok(())
    }

    fn topic_spec(&self, topic: &str) -> TopicSpec {
        match self.topics.topic_ref_for(&self.peer, topic) {
            Some(TopicRef::Short(chars)) => TopicSpec::Short(chars),
            Some(TopicRef::Predefined(id)) => TopicSpec::Predefined(id),
            _ => TopicSpec::Name(topic.to_string()),
        }
    }

    /// Queue a publish for delivery.
    ///
    /// The payload is handed to the message registry and the publish rides
    /// the flush scheduler; the confirmation arrives as
    /// [`Event::MessageSent`]. Topics without a wire form yet are REGISTERed
    /// first.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<MessageUuid> {
        if self.topics.topic_ref_for(&self.peer, topic).is_none() {
            let _alias = self.register(topic).await?;
        }
        let payload = match self.service.integrity() {
            Some(integrity) => integrity.wrap(&payload),
            None => payload,
        };
        let uuid = self.registry.add(payload);
        self.queue
            .offer(&self.peer, QueuedPublish::new(uuid, topic, qos, retain))
            .await?;
        self.service.scheduler().schedule_flush(&self.peer);
        Ok(uuid)
    }

    /// Keepalive round trip.
    pub async fn ping(&self) -> Result<()> {
        let msg = Message::Pingreq {
            client_id: Some(self.peer.client_id().to_string()),
        };
        let token = self.send_tracked(msg).await?;
        let _pingresp = self.confirm(&token).await?;
        Ok(())
    }

    /// Orderly session shutdown.
    pub async fn disconnect(&self) -> Result<()> {
        let token = self.send_tracked(Message::Disconnect { duration: None }).await?;
        let outcome = self.confirm(&token).await;
        self.service.clear_inflight(&self.peer, None).await;
        self.service.clear(&self.peer);
        outcome.map(|_ack| ())
    }

    /// Resolve a wire topic reference from a received publish to its path.
    pub fn resolve_topic(&self, topic: &TopicRef) -> Result<String> {
        self.topics.resolve(&self.peer, topic)
    }

    /// The gateway as tracked by the state service.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The underlying state service.
    pub fn service(&self) -> &Arc<MessageStateService> {
        &self.service
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Feed one gateway frame through the state service and answer the turns the
/// protocol expects from us.
async fn handle_gateway_frame(
    service: &Arc<MessageStateService>,
    topics: &Arc<TopicRegistry>,
    peer: &Peer,
    msg: Message,
) {
    if let Err(error) = service.notify_received(peer, msg.clone()).await {
        warn!("Frame from gateway not accepted: {error}");
    }

    let reply = match &msg {
        Message::Publish {
            qos, msg_id, topic, ..
        } => match qos {
            QoS::AtLeastOnce => Some(Message::Puback {
                topic_id: topic.raw_id(),
                msg_id: *msg_id,
                return_code: ReturnCode::Accepted,
            }),
            QoS::ExactlyOnce => Some(Message::Pubrec { msg_id: *msg_id }),
            _ => None,
        },
        // inbound exactly-once: the gateway finishes with PUBREL, we close
        // with PUBCOMP
        Message::Pubrel { msg_id } => Some(Message::Pubcomp { msg_id: *msg_id }),
        // outbound exactly-once: our publish was received, release it
        Message::Pubrec { msg_id } => Some(Message::Pubrel { msg_id: *msg_id }),
        Message::Register {
            topic_id,
            msg_id,
            topic_name,
        } => {
            topics.learn(peer, *topic_id, topic_name);
            Some(Message::Regack {
                topic_id: *topic_id,
                msg_id: *msg_id,
                return_code: ReturnCode::Accepted,
            })
        }
        Message::Pingreq { .. } => Some(Message::Pingresp),
        _ => None,
    };

    if let Some(reply) = reply {
        if let Err(error) = service.send_message(peer, reply, None).await {
            warn!("Could not answer gateway: {error}");
        }
    }
}
