//! Fan-out of run events to streaming subscribers, with per-run replay.
//!
//! # Design Decisions
//! - One bounded ring per run; oldest events are evicted first
//! - Emission holds the run's ring lock while delivering, so history plus
//!   live delivery for a run is totally ordered
//! - Lock order is ring → clients; nothing takes them the other way
//! - Sinks never block; a failed send detaches that client only

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::envelope::EventEnvelope;
use crate::jobs::types::RunId;

pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("subscriber disconnected")]
    Closed,
    #[error("subscriber is not keeping up")]
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("unknown client {0}")]
    UnknownClient(String),
    #[error("delivery to client {client} failed: {source}")]
    Delivery {
        client: String,
        #[source]
        source: SinkError,
    },
}

/// Where a subscriber's events go.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &EventEnvelope) -> Result<(), SinkError>;

    fn close(&self) {}
}

/// Sink backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EventEnvelope>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: &EventEnvelope) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

struct Client {
    /// `None` receives every run.
    run: Option<RunId>,
    sink: Arc<dyn EventSink>,
}

type Ring = Arc<Mutex<VecDeque<EventEnvelope>>>;

pub struct EventBridge {
    capacity: usize,
    rings: DashMap<RunId, Ring>,
    clients: RwLock<HashMap<String, Client>>,
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl EventBridge {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: DashMap::new(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn ring(&self, run: RunId) -> Ring {
        self.rings.entry(run).or_default().clone()
    }

    /// Buffer and broadcast. Returns how many clients received the event.
    pub fn emit(&self, event: EventEnvelope) -> usize {
        let Some(run) = event.run_id else {
            tracing::warn!(event_type = %event.event_type, "Dropping event without run id");
            return 0;
        };

        let ring = self.ring(run);
        let mut buffer = ring.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());

        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            for (id, client) in clients.iter() {
                if client.run.is_some_and(|r| r != run) {
                    continue;
                }
                match client.sink.send(&event) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((id.clone(), e)),
                }
            }
        }
        drop(buffer);

        for (id, error) in failed {
            tracing::debug!(client = %id, error = %error, "Detaching subscriber after failed send");
            self.detach(&id);
        }
        delivered
    }

    /// Register a subscriber for one run, or every run when `run` is `None`.
    pub fn attach(&self, client_id: Option<String>, run: Option<RunId>, sink: Arc<dyn EventSink>) -> String {
        let id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = clients.insert(id.clone(), Client { run, sink }) {
            previous.sink.close();
        }
        tracing::debug!(client = %id, run = ?run, "Subscriber attached");
        id
    }

    /// Attach to a run and replay its history before any live event.
    pub fn attach_with_replay(
        &self,
        client_id: Option<String>,
        run: RunId,
        sink: Arc<dyn EventSink>,
    ) -> Result<String, BridgeError> {
        let ring = self.ring(run);
        let buffer = ring.lock().unwrap_or_else(|e| e.into_inner());

        let id = self.attach(client_id, Some(run), sink.clone());
        for event in buffer.iter() {
            if let Err(source) = sink.send(event) {
                drop(buffer);
                self.detach(&id);
                return Err(BridgeError::Delivery { client: id, source });
            }
        }
        Ok(id)
    }

    /// Remove and close a subscriber. Idempotent.
    pub fn detach(&self, client_id: &str) -> bool {
        let removed = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
        match removed {
            Some(client) => {
                client.sink.close();
                tracing::debug!(client = %client_id, "Subscriber detached");
                true
            }
            None => false,
        }
    }

    /// Push a run's buffered history to an attached client, oldest first.
    pub fn replay(&self, run: RunId, client_id: &str) -> Result<usize, BridgeError> {
        let ring = self.ring(run);
        let buffer = ring.lock().unwrap_or_else(|e| e.into_inner());

        let sink = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .map(|c| c.sink.clone())
            .ok_or_else(|| BridgeError::UnknownClient(client_id.to_string()))?;

        for event in buffer.iter() {
            if let Err(source) = sink.send(event) {
                drop(buffer);
                self.detach(client_id);
                return Err(BridgeError::Delivery {
                    client: client_id.to_string(),
                    source,
                });
            }
        }
        Ok(buffer.len())
    }

    pub fn history(&self, run: RunId) -> Vec<EventEnvelope> {
        match self.rings.get(&run) {
            Some(ring) => ring.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Release a run's buffer.
    pub fn drop_run(&self, run: RunId) -> bool {
        self.rings.remove(&run).is_some()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn run_count(&self) -> usize {
        self.rings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn event(run: RunId, n: u64) -> EventEnvelope {
        EventEnvelope::new("job.progress")
            .for_run(crate::jobs::types::JobId::new(), run)
            .with("n", n)
    }

    fn numbers(rx: &mut mpsc::Receiver<EventEnvelope>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e.payload["n"].as_u64().unwrap());
        }
        out
    }

    struct BrokenSink {
        closed: AtomicBool,
    }

    impl EventSink for BrokenSink {
        fn send(&self, _: &EventEnvelope) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn events_without_run_are_dropped() {
        let bridge = EventBridge::new(10);
        let (sink, mut rx) = ChannelSink::new(10);
        bridge.attach(None, None, Arc::new(sink));

        assert_eq!(bridge.emit(EventEnvelope::new("orphan")), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.run_count(), 0);
    }

    #[test]
    fn replay_then_live_in_order_bounded_by_capacity() {
        let bridge = EventBridge::new(3);
        let run = RunId::new();
        for n in 0..5 {
            bridge.emit(event(run, n));
        }

        let (sink, mut rx) = ChannelSink::new(16);
        bridge.attach_with_replay(None, run, Arc::new(sink)).unwrap();
        bridge.emit(event(run, 5));

        assert_eq!(numbers(&mut rx), vec![2, 3, 4, 5]);
    }

    #[test]
    fn run_filter_and_wildcard() {
        let bridge = EventBridge::new(10);
        let (a, b) = (RunId::new(), RunId::new());
        let (only_a, mut rx_a) = ChannelSink::new(10);
        let (all, mut rx_all) = ChannelSink::new(10);
        bridge.attach(Some("a".into()), Some(a), Arc::new(only_a));
        bridge.attach(None, None, Arc::new(all));

        bridge.emit(event(a, 1));
        bridge.emit(event(b, 2));

        assert_eq!(numbers(&mut rx_a), vec![1]);
        assert_eq!(numbers(&mut rx_all), vec![1, 2]);
    }

    #[test]
    fn failing_client_is_detached_without_affecting_others() {
        let bridge = EventBridge::new(10);
        let run = RunId::new();
        let broken = Arc::new(BrokenSink {
            closed: AtomicBool::new(false),
        });
        let (good, mut rx) = ChannelSink::new(10);
        bridge.attach(Some("broken".into()), None, broken.clone());
        bridge.attach(Some("good".into()), None, Arc::new(good));

        assert_eq!(bridge.emit(event(run, 1)), 1);
        assert_eq!(bridge.client_count(), 1);
        assert!(broken.closed.load(Ordering::SeqCst));
        assert_eq!(numbers(&mut rx), vec![1]);
    }

    #[test]
    fn explicit_replay_and_idempotent_detach() {
        let bridge = EventBridge::new(10);
        let run = RunId::new();
        bridge.emit(event(run, 1));
        bridge.emit(event(run, 2));

        let (sink, mut rx) = ChannelSink::new(10);
        let id = bridge.attach(None, Some(run), Arc::new(sink));
        assert_eq!(bridge.replay(run, &id).unwrap(), 2);
        assert_eq!(numbers(&mut rx), vec![1, 2]);

        assert!(bridge.detach(&id));
        assert!(!bridge.detach(&id));
        assert!(matches!(bridge.replay(run, &id), Err(BridgeError::UnknownClient(_))));
    }

    #[test]
    fn replay_failure_detaches() {
        let bridge = EventBridge::new(10);
        let run = RunId::new();
        bridge.emit(event(run, 1));
        let broken = Arc::new(BrokenSink {
            closed: AtomicBool::new(false),
        });
        let err = bridge.attach_with_replay(Some("x".into()), run, broken).unwrap_err();
        assert!(matches!(err, BridgeError::Delivery { .. }));
        assert_eq!(bridge.client_count(), 0);
    }

    #[test]
    fn full_channel_counts_as_failure() {
        let bridge = EventBridge::new(10);
        let run = RunId::new();
        let (sink, _rx) = ChannelSink::new(1);
        bridge.attach(None, None, Arc::new(sink));
        bridge.emit(event(run, 1));
        bridge.emit(event(run, 2));
        assert_eq!(bridge.client_count(), 0);
    }

    #[test]
    fn drop_run_releases_history() {
        let bridge = EventBridge::new(10);
        let run = RunId::new();
        bridge.emit(event(run, 1));
        assert!(bridge.drop_run(run));
        assert!(bridge.history(run).is_empty());
    }
}
