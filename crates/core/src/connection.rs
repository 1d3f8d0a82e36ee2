use crate::events::Event;
use crate::types::RunId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Unique identifier for an attached listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub uuid::Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives events for a run. `deliver` is called while the manager holds its
/// lock, so it must hand the event off without blocking.
pub trait Listener: Send + Sync {
    fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

/// Push-style listener forwarding into a channel (e.g. a WebSocket writer task)
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Listener for ChannelListener {
    fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("listener channel closed"))
    }
}

/// Pull-style listener: events queue up until the consumer drains them
#[derive(Debug, Default)]
pub struct QueueListener {
    queue: Mutex<VecDeque<Event>>,
}

impl QueueListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued event, oldest first
    pub fn drain(&self) -> Vec<Event> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Listener for QueueListener {
    fn deliver(&self, event: &Event) -> anyhow::Result<()> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Topics {
    listeners: HashMap<RunId, Vec<(ListenerId, Arc<dyn Listener>)>>,
    buffers: HashMap<RunId, VecDeque<Event>>,
}

/// Pub/sub topic per run with a short in-memory history.
///
/// Buffer append, eviction and delivery happen under one lock, so every
/// listener sees events in the order they were buffered.
pub struct ConnectionManager {
    capacity: usize,
    topics: tokio::sync::Mutex<Topics>,
}

impl ConnectionManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: tokio::sync::Mutex::new(Topics::default()),
        }
    }

    /// Attach a listener for live events only
    pub async fn connect(&self, run_id: RunId, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::new();
        let mut topics = self.topics.lock().await;
        topics
            .listeners
            .entry(run_id)
            .or_default()
            .push((id, listener));
        tracing::debug!(%run_id, "listener connected");
        id
    }

    /// Detach a listener; the run's listener entry goes away once empty
    pub async fn disconnect(&self, run_id: RunId, id: ListenerId) -> bool {
        let mut topics = self.topics.lock().await;
        let Some(listeners) = topics.listeners.get_mut(&run_id) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            topics.listeners.remove(&run_id);
        }
        if removed {
            tracing::debug!(%run_id, "listener disconnected");
        }
        removed
    }

    /// Buffer an event and deliver it to every live listener.
    ///
    /// A failing listener is logged and skipped.
    pub async fn broadcast(&self, run_id: RunId, event: Event) {
        let mut topics = self.topics.lock().await;

        let buffer = topics.buffers.entry(run_id).or_default();
        if self.capacity > 0 {
            while buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        if let Some(listeners) = topics.listeners.get(&run_id) {
            for (id, listener) in listeners {
                if let Err(e) = listener.deliver(&event) {
                    tracing::warn!(%run_id, listener = %id.0, error = %e, "event delivery failed");
                }
            }
        }
    }

    /// Deliver the buffered history to a listener, oldest first.
    ///
    /// Stops at the first delivery error; returns how many events were sent.
    pub async fn replay(&self, listener: &dyn Listener, run_id: RunId) -> usize {
        let topics = self.topics.lock().await;
        Self::replay_locked(&topics, listener, run_id)
    }

    /// Replay the history and attach for live events without a gap in between
    pub async fn subscribe(&self, run_id: RunId, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::new();
        let mut topics = self.topics.lock().await;
        let replayed = Self::replay_locked(&topics, listener.as_ref(), run_id);
        topics
            .listeners
            .entry(run_id)
            .or_default()
            .push((id, listener));
        tracing::debug!(%run_id, replayed, "listener subscribed");
        id
    }

    fn replay_locked(topics: &Topics, listener: &dyn Listener, run_id: RunId) -> usize {
        let Some(buffer) = topics.buffers.get(&run_id) else {
            return 0;
        };

        let mut delivered = 0;
        for event in buffer {
            if let Err(e) = listener.deliver(event) {
                tracing::warn!(%run_id, error = %e, delivered, "replay aborted");
                break;
            }
            delivered += 1;
        }
        delivered
    }

    /// Snapshot of the buffered events for a run
    pub async fn history(&self, run_id: RunId) -> Vec<Event> {
        let topics = self.topics.lock().await;
        topics
            .buffers
            .get(&run_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn listener_count(&self, run_id: RunId) -> usize {
        let topics = self.topics.lock().await;
        topics.listeners.get(&run_id).map_or(0, Vec::len)
    }

    /// Whether any listener entry exists for the run
    pub async fn has_listeners(&self, run_id: RunId) -> bool {
        self.topics.lock().await.listeners.contains_key(&run_id)
    }

    /// Drop the replay buffer for a finished run
    pub async fn clear_run(&self, run_id: RunId) {
        self.topics.lock().await.buffers.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use serde_json::json;

    fn event(run_id: RunId, n: u64) -> Event {
        Event::new(run_id, EventType::StepStart, json!({ "n": n }))
    }

    fn numbers(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.data["n"].as_u64().unwrap()).collect()
    }

    struct FailingListener;

    impl Listener for FailingListener {
        fn deliver(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("socket closed")
        }
    }

    /// Accepts a fixed number of events then fails
    struct FlakyListener {
        accepted: QueueListener,
        limit: usize,
    }

    impl Listener for FlakyListener {
        fn deliver(&self, event: &Event) -> anyhow::Result<()> {
            if self.accepted.len() >= self.limit {
                anyhow::bail!("buffer full");
            }
            self.accepted.deliver(event)
        }
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest() {
        let manager = ConnectionManager::new(3);
        let run_id = RunId::new();

        for n in 0..4 {
            manager.broadcast(run_id, event(run_id, n)).await;
        }

        assert_eq!(numbers(&manager.history(run_id).await), vec![1, 2, 3]);

        let late = QueueListener::new();
        assert_eq!(manager.replay(&late, run_id).await, 3);
        assert_eq!(numbers(&late.drain()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let manager = ConnectionManager::new(10);
        let run_id = RunId::new();
        let good = Arc::new(QueueListener::new());

        manager.connect(run_id, Arc::new(FailingListener)).await;
        manager.connect(run_id, good.clone()).await;

        manager.broadcast(run_id, event(run_id, 1)).await;
        manager.broadcast(run_id, event(run_id, 2)).await;

        assert_eq!(numbers(&good.drain()), vec![1, 2]);
        assert_eq!(manager.history(run_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_stops_at_first_failure() {
        let manager = ConnectionManager::new(10);
        let run_id = RunId::new();
        for n in 0..5 {
            manager.broadcast(run_id, event(run_id, n)).await;
        }

        let flaky = FlakyListener {
            accepted: QueueListener::new(),
            limit: 2,
        };
        assert_eq!(manager.replay(&flaky, run_id).await, 2);
        assert_eq!(numbers(&flaky.accepted.drain()), vec![0, 1]);

        let healthy = QueueListener::new();
        assert_eq!(manager.replay(&healthy, run_id).await, 5);
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_receives_live() {
        let manager = ConnectionManager::new(10);
        let run_id = RunId::new();
        manager.broadcast(run_id, event(run_id, 1)).await;

        let (listener, mut rx) = ChannelListener::new();
        manager.subscribe(run_id, Arc::new(listener)).await;
        manager.broadcast(run_id, event(run_id, 2)).await;

        assert_eq!(rx.recv().await.unwrap().data["n"], 1);
        assert_eq!(rx.recv().await.unwrap().data["n"], 2);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_empty_entry() {
        let manager = ConnectionManager::new(10);
        let run_id = RunId::new();

        let a = manager.connect(run_id, Arc::new(QueueListener::new())).await;
        let b = manager.connect(run_id, Arc::new(QueueListener::new())).await;
        assert_eq!(manager.listener_count(run_id).await, 2);

        assert!(manager.disconnect(run_id, a).await);
        assert!(manager.has_listeners(run_id).await);
        assert!(manager.disconnect(run_id, b).await);
        assert!(!manager.has_listeners(run_id).await);
        assert!(!manager.disconnect(run_id, b).await);
    }

    #[tokio::test]
    async fn test_runs_are_isolated() {
        let manager = ConnectionManager::new(10);
        let (run_a, run_b) = (RunId::new(), RunId::new());
        let listener = Arc::new(QueueListener::new());
        manager.connect(run_a, listener.clone()).await;

        manager.broadcast(run_b, event(run_b, 9)).await;
        assert!(listener.is_empty());

        manager.clear_run(run_b).await;
        assert!(manager.history(run_b).await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel_listener_reports_error() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        assert!(listener
            .deliver(&event(RunId::new(), 1))
            .is_err());
    }
}
