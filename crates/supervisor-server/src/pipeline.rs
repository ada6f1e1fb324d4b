use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use supervisor_core::model::Event;
use supervisor_core::{Result, StateError};
use supervisor_storage::DurableStore;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Callback the pipeline uses to ask an agent to resend a gap. The Hub is
/// the only real implementation; kept as a trait so the pipeline's hot path
/// doesn't depend on the transport concretely, the same small-capability
/// shape the dispatcher's `Transport` trait uses.
pub trait ReplayRequester: Send + Sync {
    fn request_replay(&self, agent_id: &str, from: u64, to: u64);
}

struct AgentState {
    last_seq: u64,
    pending: BTreeMap<u64, Event>,
    dedup: LruCache<String, ()>,
}

impl AgentState {
    fn new(dedup_capacity: usize) -> Self {
        Self {
            last_seq: 0,
            pending: BTreeMap::new(),
            dedup: LruCache::new(NonZeroUsize::new(dedup_capacity.max(1)).unwrap()),
        }
    }
}

struct PersistJob {
    agent_id: String,
    event: Event,
}

/// Per-agent strictly-ordered, deduplicated event ingestion with gap
/// detection and a bounded async persistence worker. Buffering and dedup
/// state live under one mutex per pipeline (not per agent) — the critical
/// section only ever touches an in-memory map, never I/O, so contention is
/// short even with a single lock.
pub struct EventPipeline {
    agents: Mutex<HashMap<String, AgentState>>,
    tx: mpsc::Sender<PersistJob>,
    dedup_capacity: usize,
    replay: Arc<dyn ReplayRequester>,
}

impl EventPipeline {
    pub fn new(
        store: Arc<dyn DurableStore>,
        channel_capacity: usize,
        dedup_capacity: usize,
        replay: Arc<dyn ReplayRequester>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(channel_capacity);
        tokio::spawn(persistence_worker(rx, store));
        Arc::new(Self {
            agents: Mutex::new(HashMap::new()),
            tx,
            dedup_capacity,
            replay,
        })
    }

    /// Ingests one event for `agent_id`, advancing and draining contiguous
    /// buffered events, or buffering and requesting a replay on a gap.
    pub fn process_event(&self, agent_id: &str, event: Event) -> Result<()> {
        if agent_id.is_empty() || event.id.is_empty() {
            return Err(StateError::validation("agent_id and event.id must be non-empty"));
        }
        if event.seq == 0 {
            return Err(StateError::validation("seq must be >= 1"));
        }

        let mut to_enqueue = Vec::new();
        {
            let mut agents = self.agents.lock();
            let state = agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentState::new(self.dedup_capacity));

            if state.dedup.contains(&event.id) {
                return Ok(());
            }

            let expected = state.last_seq + 1;
            if event.seq < expected {
                return Ok(());
            }
            if event.seq > expected {
                let from = expected;
                let to = event.seq - 1;
                warn!(agent_id, from, to, "event gap detected, buffering and requesting replay");
                state.pending.insert(event.seq, event);
                drop(agents);
                self.replay.request_replay(agent_id, from, to);
                return Ok(());
            }

            // event.seq == expected: advance and drain contiguous pending.
            state.dedup.put(event.id.clone(), ());
            state.last_seq = event.seq;
            to_enqueue.push(event);
            while let Some(next) = state.pending.remove(&(state.last_seq + 1)) {
                state.dedup.put(next.id.clone(), ());
                state.last_seq = next.seq;
                to_enqueue.push(next);
            }
        }

        for event in to_enqueue {
            let job = PersistJob {
                agent_id: agent_id.to_string(),
                event,
            };
            if let Err(e) = self.tx.try_send(job) {
                warn!(agent_id, "persistence channel saturated, dropping event: {e}");
            }
        }
        Ok(())
    }

    pub fn last_seq(&self, agent_id: &str) -> u64 {
        self.agents
            .lock()
            .get(agent_id)
            .map(|s| s.last_seq)
            .unwrap_or(0)
    }
}

async fn persistence_worker(mut rx: mpsc::Receiver<PersistJob>, store: Arc<dyn DurableStore>) {
    while let Some(job) = rx.recv().await {
        let data = match serde_json::to_vec(&job.event.data) {
            Ok(d) => d,
            Err(e) => {
                warn!("failed to serialize event payload: {e}");
                continue;
            }
        };
        if let Err(e) = store
            .insert_event(
                &job.event.id,
                &job.event.session_id,
                &job.agent_id,
                &job.event.kind,
                &data,
                job.event.timestamp,
                job.event.seq,
            )
            .await
        {
            warn!(agent_id = %job.agent_id, "failed to persist event: {e}");
        }
    }
    info!("event persistence worker exiting, channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use supervisor_storage::SqliteStore;

    struct NoopReplay(Arc<Mutex<Vec<(String, u64, u64)>>>);
    impl ReplayRequester for NoopReplay {
        fn request_replay(&self, agent_id: &str, from: u64, to: u64) {
            self.0.lock().push((agent_id.to_string(), from, to));
        }
    }

    fn event(id: &str, seq: u64) -> Event {
        Event {
            id: id.into(),
            session_id: "s1".into(),
            kind: "test".into(),
            data: serde_json::json!({}),
            timestamp: Utc::now(),
            seq,
        }
    }

    async fn test_store() -> Arc<dyn DurableStore> {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        Arc::new(s)
    }

    #[tokio::test]
    async fn first_event_seq_zero_rejected() {
        let replay = Arc::new(NoopReplay(Arc::new(Mutex::new(vec![]))));
        let pipeline = EventPipeline::new(test_store().await, 16, 100, replay);
        assert!(pipeline.process_event("a1", event("e0", 0)).is_err());
    }

    #[tokio::test]
    async fn gap_buffers_and_requests_replay_then_drains() {
        let calls = Arc::new(Mutex::new(vec![]));
        let replay = Arc::new(NoopReplay(calls.clone()));
        let pipeline = EventPipeline::new(test_store().await, 16, 100, replay);

        pipeline.process_event("a1", event("e1", 1)).unwrap();
        pipeline.process_event("a1", event("e2", 2)).unwrap();
        pipeline.process_event("a1", event("e4", 4)).unwrap();

        assert_eq!(pipeline.last_seq("a1"), 2);
        assert_eq!(*calls.lock(), vec![("a1".to_string(), 3, 3)]);

        pipeline.process_event("a1", event("e3", 3)).unwrap();
        assert_eq!(pipeline.last_seq("a1"), 4);
    }

    #[tokio::test]
    async fn duplicate_event_is_a_noop() {
        let replay = Arc::new(NoopReplay(Arc::new(Mutex::new(vec![]))));
        let pipeline = EventPipeline::new(test_store().await, 16, 100, replay);
        pipeline.process_event("a1", event("e1", 1)).unwrap();
        pipeline.process_event("a1", event("e1", 1)).unwrap();
        assert_eq!(pipeline.last_seq("a1"), 1);
    }
}
