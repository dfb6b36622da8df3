// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The queue drain run by flush tasks, shared by client and gateway: pop the
//! next queued publish, rebuild its frame and push it through the state
//! service.

use crate::errors::{Error, Result};
use crate::messaging::Message;
use crate::peers::Peer;
use crate::queue::MessageQueue;
use crate::registry::MessageRegistry;
use crate::state::{MessageStateService, ProcessResult, QueueProcessor};
use crate::topics::TopicRegistry;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Drains per-peer publish queues through the state service.
pub struct QueueFlusher {
    service: Arc<MessageStateService>,
    queue: Arc<MessageQueue>,
    registry: Arc<MessageRegistry>,
    topics: Arc<TopicRegistry>,
}

impl fmt::Debug for QueueFlusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueFlusher").finish()
    }
}

impl QueueFlusher {
    /// New drain over the shared collaborators.
    pub fn new(
        service: Arc<MessageStateService>,
        queue: Arc<MessageQueue>,
        registry: Arc<MessageRegistry>,
        topics: Arc<TopicRegistry>,
    ) -> Self {
        Self {
            service,
            queue,
            registry,
            topics,
        }
    }

    async fn more_or_done(&self, peer: &Peer) -> Result<ProcessResult> {
        if self.queue.depth(peer).await > 0 {
            Ok(ProcessResult::Reprocess)
        } else {
            Ok(ProcessResult::RemoveProcess)
        }
    }
}

#[async_trait]
impl QueueProcessor for QueueFlusher {
    async fn process(&self, peer: &Peer) -> Result<ProcessResult> {
        let mut queued = match self.queue.pop(peer).await {
            Some(queued) => queued,
            None => return Ok(ProcessResult::RemoveProcess),
        };

        let data = match self.registry.get(&queued.uuid) {
            Some(data) => data,
            None => {
                warn!(
                    "Payload {} for {peer:?} expired before delivery, dropping publish",
                    queued.uuid
                );
                return self.more_or_done(peer).await;
            }
        };
        let topic = match self.topics.topic_ref_for(peer, &queued.topic_path) {
            Some(topic) => topic,
            None => {
                warn!(
                    "Topic {} has no wire form for {peer:?}, dropping publish",
                    queued.topic_path
                );
                return self.more_or_done(peer).await;
            }
        };

        // kept aside in case the send window is saturated and the attempt
        // never leaves this process
        let rollback = queued.clone();
        queued.retry_count += 1;

        let publish = Message::Publish {
            dup: false, // derived from the queued history inside the send
            qos: queued.qos,
            retain: queued.retained,
            topic,
            msg_id: queued.last_assigned_msg_id,
            data,
        };

        match self.service.send_message(peer, publish, Some(queued)).await {
            Ok(_token) => self.more_or_done(peer).await,
            Err(Error::ExpectationFailed(reason)) => {
                debug!("Flush for {peer:?} could not send ({reason}), backing off");
                if let Err(error) = self.queue.offer(peer, rollback).await {
                    warn!("Could not re-offer publish after saturation: {error}");
                }
                Ok(ProcessResult::BackoffProcess)
            }
            Err(error) => Err(error),
        }
    }
}
