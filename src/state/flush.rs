// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Cooperative flush scheduling: at most one live flush task per peer, spawned
//! with a small random delay so a gateway restart does not thunder.

use crate::errors::Result;
use crate::peers::Peer;
use crate::state::ActivityClock;

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Spawn jitter bounds, in ms.
const JITTER_MIN_MS: u64 = 1;
const JITTER_MAX_MS: u64 = 250;

/// Floor of the backoff reschedule delay, in ms.
const BACKOFF_FLOOR_MS: u64 = 100;

/// What a flush pass asks the scheduler to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessResult {
    /// Done; drop the task from the per-peer slot.
    RemoveProcess,
    /// More work waiting; run again after the flush delay.
    Reprocess,
    /// Could not make progress; run again later unless the peer went idle.
    BackoffProcess,
}

/// The per-peer queue drain a flush task runs.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// One flush pass for the peer.
    async fn process(&self, peer: &Peer) -> Result<ProcessResult>;
}

struct FlushHandle {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Schedules at most one outstanding flush task per peer.
pub struct FlushScheduler {
    tasks: DashMap<Peer, FlushHandle>,
    processor: RwLock<Option<Arc<dyn QueueProcessor>>>,
    activity: Arc<ActivityClock>,
    min_flush_time: Duration,
    active_context_timeout: Duration,
    generation: AtomicU64,
}

impl fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("tasks", &self.tasks.len())
            .field("min_flush_time", &self.min_flush_time)
            .finish()
    }
}

impl FlushScheduler {
    /// New scheduler over the shared activity clocks.
    pub fn new(
        activity: Arc<ActivityClock>,
        min_flush_time: Duration,
        active_context_timeout: Duration,
    ) -> Self {
        Self {
            tasks: DashMap::new(),
            processor: RwLock::new(None),
            activity,
            min_flush_time,
            active_context_timeout,
            generation: AtomicU64::new(0),
        }
    }

    /// Wire in the queue processor. Scheduling before this is a no-op.
    pub fn set_processor(&self, processor: Arc<dyn QueueProcessor>) {
        *self
            .processor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(processor);
    }

    fn processor(&self) -> Option<Arc<dyn QueueProcessor>> {
        self.processor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Ensure a flush task exists for the peer. A live task keeps the slot;
    /// otherwise one is spawned after a uniform jitter in `[1, 250]` ms.
    pub fn schedule_flush(self: &Arc<Self>, peer: &Peer) {
        if self.processor().is_none() {
            warn!("No queue processor wired in, not scheduling flush for {peer:?}");
            return;
        }
        match self.tasks.entry(peer.clone()) {
            Entry::Occupied(_) => {
                trace!("Flush already scheduled for {peer:?}");
            }
            Entry::Vacant(slot) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let scheduler = self.clone();
                let peer = peer.clone();
                let handle = tokio::spawn(async move {
                    scheduler.run_flush(peer, generation).await;
                });
                let _ = slot.insert(FlushHandle { generation, handle });
            }
        }
    }

    /// Cancel any pending task and drop the handle.
    pub fn unschedule_flush(&self, peer: &Peer) {
        if let Some((_, flush)) = self.tasks.remove(peer) {
            flush.handle.abort();
        }
    }

    /// Whether a flush task currently owns the peer's slot.
    pub fn has_pending(&self, peer: &Peer) -> bool {
        self.tasks.contains_key(peer)
    }

    async fn run_flush(self: Arc<Self>, peer: Peer, generation: u64) {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN_MS..=JITTER_MAX_MS);
        sleep(Duration::from_millis(jitter)).await;
        loop {
            let processor = match self.processor() {
                Some(processor) => processor,
                None => break,
            };
            match processor.process(&peer).await {
                Ok(ProcessResult::RemoveProcess) => break,
                Ok(ProcessResult::Reprocess) => sleep(self.min_flush_time).await,
                Ok(ProcessResult::BackoffProcess) => {
                    match self.activity.last_received(&peer) {
                        Some(at) if at.elapsed() <= self.active_context_timeout => {
                            let delay = self
                                .min_flush_time
                                .max(Duration::from_millis(BACKOFF_FLOOR_MS));
                            sleep(delay).await;
                        }
                        _ => {
                            trace!("Peer {peer:?} idle past the backoff cutoff, dropping flush");
                            break;
                        }
                    }
                }
                Err(error) => {
                    warn!("Flush processing for {peer:?} failed: {error}");
                    break;
                }
            }
        }
        // only clear the slot if a newer task has not taken it over
        let _ = self
            .tasks
            .remove_if(&peer, |_, flush| flush.generation == generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> Peer {
        Peer::new("sensor-1", ([127, 0, 0, 1], 2442).into())
    }

    struct ScriptedProcessor {
        calls: AtomicUsize,
        script: Vec<ProcessResult>,
    }

    impl ScriptedProcessor {
        fn new(script: Vec<ProcessResult>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueueProcessor for ScriptedProcessor {
        async fn process(&self, _peer: &Peer) -> Result<ProcessResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .script
                .get(call)
                .copied()
                .unwrap_or(ProcessResult::RemoveProcess))
        }
    }

    fn scheduler() -> Arc<FlushScheduler> {
        Arc::new(FlushScheduler::new(
            Arc::new(ActivityClock::new()),
            Duration::from_millis(10),
            Duration::from_millis(200),
        ))
    }

    #[tokio::test]
    async fn at_most_one_task_owns_the_slot() {
        let scheduler = scheduler();
        let processor = ScriptedProcessor::new(vec![ProcessResult::RemoveProcess]);
        scheduler.set_processor(processor.clone());

        let peer = peer();
        for _ in 0..10 {
            scheduler.schedule_flush(&peer);
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(processor.calls(), 1);
        assert!(!scheduler.has_pending(&peer));
    }

    #[tokio::test]
    async fn reprocess_runs_the_drain_again() {
        let scheduler = scheduler();
        let processor = ScriptedProcessor::new(vec![
            ProcessResult::Reprocess,
            ProcessResult::Reprocess,
            ProcessResult::RemoveProcess,
        ]);
        scheduler.set_processor(processor.clone());

        scheduler.schedule_flush(&peer());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(processor.calls(), 3);
        assert!(!scheduler.has_pending(&peer()));
    }

    #[tokio::test]
    async fn backoff_without_traffic_drops_the_task() {
        let scheduler = scheduler();
        let processor = ScriptedProcessor::new(vec![ProcessResult::BackoffProcess]);
        scheduler.set_processor(processor.clone());

        scheduler.schedule_flush(&peer());
        tokio::time::sleep(Duration::from_millis(400)).await;
        // no last_received for the peer, so the backoff cutoff drops the task
        assert_eq!(processor.calls(), 1);
        assert!(!scheduler.has_pending(&peer()));
    }

    #[tokio::test]
    async fn backoff_with_recent_traffic_reschedules() {
        let scheduler = Arc::new(FlushScheduler::new(
            Arc::new(ActivityClock::new()),
            Duration::from_millis(10),
            Duration::from_secs(60),
        ));
        let processor = ScriptedProcessor::new(vec![
            ProcessResult::BackoffProcess,
            ProcessResult::RemoveProcess,
        ]);
        scheduler.set_processor(processor.clone());

        let peer = peer();
        scheduler.activity.on_received(&peer, true);
        scheduler.schedule_flush(&peer);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(processor.calls(), 2);
        assert!(!scheduler.has_pending(&peer));
    }

    #[tokio::test]
    async fn unschedule_cancels_before_the_jitter_fires() {
        let scheduler = scheduler();
        let processor = ScriptedProcessor::new(vec![ProcessResult::RemoveProcess]);
        scheduler.set_processor(processor.clone());

        let peer = peer();
        scheduler.schedule_flush(&peer);
        scheduler.unschedule_flush(&peer);
        assert!(!scheduler.has_pending(&peer));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(processor.calls(), 0);
    }
}
