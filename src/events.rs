//! Per-project progress event bus.
//!
//! Every published event is persisted to the journal first, then fanned out
//! to live subscribers. Each subscriber owns a bounded queue: on overflow the
//! oldest event is dropped and the subscriber is flagged as lagged. Delivery
//! is per-project, per-subscriber FIFO; there is no ordering across projects
//! and no delivery across processes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{OrchestrationError, Result};
use crate::store::{EventKind, EventRecord, Store};

#[derive(Debug)]
struct SubscriberQueue {
    events: Mutex<VecDeque<EventRecord>>,
    notify: Notify,
    capacity: usize,
    lagged: AtomicBool,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            lagged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: EventRecord) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
            self.lagged.store(true, Ordering::Relaxed);
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<EventRecord> {
        self.events.lock().unwrap().pop_front()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// A live event stream for one project. Dropping the subscription removes it
/// from the bus.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Wait for the next event. Events arrive in publish order.
    pub async fn recv(&self) -> EventRecord {
        loop {
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.pop() {
                return event;
            }
            notified.await;
        }
    }

    /// Non-blocking pop for draining after a terminal event.
    pub fn try_recv(&self) -> Option<EventRecord> {
        self.queue.pop()
    }

    /// Whether events were dropped because this subscriber fell behind.
    pub fn lagged(&self) -> bool {
        self.queue.lagged.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::Relaxed);
    }
}

/// Publish/subscribe hub, persisting every event in the store.
pub struct EventBus {
    store: Arc<Store>,
    subscribers: Mutex<HashMap<String, Vec<Arc<SubscriberQueue>>>>,
    queue_capacity: usize,
    max_subscribers: usize,
}

impl EventBus {
    pub fn new(store: Arc<Store>, queue_capacity: usize, max_subscribers: usize) -> Self {
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            max_subscribers: max_subscribers.max(1),
        }
    }

    /// Persist an event and broadcast it to this project's subscribers.
    pub async fn publish(
        &self,
        project_id: &str,
        task_id: Option<&str>,
        kind: EventKind,
        message: impl AsRef<str>,
        extras: Value,
    ) -> Result<EventRecord> {
        let event = self
            .store
            .insert_event(project_id, task_id, kind, message.as_ref(), &extras)
            .await?;

        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(queues) = subscribers.get_mut(project_id) {
            queues.retain(|q| !q.is_closed());
            for queue in queues.iter() {
                queue.push(event.clone());
            }
            if queues.is_empty() {
                subscribers.remove(project_id);
            }
        }
        Ok(event)
    }

    /// Register a live subscriber for a project. Enforces the per-project
    /// subscriber cap.
    pub fn subscribe(&self, project_id: &str) -> Result<Subscription> {
        let mut subscribers = self.subscribers.lock().unwrap();
        let queues = subscribers.entry(project_id.to_string()).or_default();
        queues.retain(|q| !q.is_closed());
        if queues.len() >= self.max_subscribers {
            return Err(OrchestrationError::Conflict(format!(
                "too many subscribers for project {project_id}"
            )));
        }
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        queues.push(queue.clone());
        Ok(Subscription { queue })
    }

    /// Number of live subscribers for a project.
    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(project_id)
            .map(|qs| qs.iter().filter(|q| !q.is_closed()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use serde_json::json;

    async fn bus() -> (Arc<Store>, EventBus) {
        let store = Arc::new(
            Store::open_in_memory(Arc::new(SystemClock)).await.unwrap(),
        );
        let bus = EventBus::new(store.clone(), 4, 2);
        (store, bus)
    }

    async fn project(store: &Store) -> String {
        store.create_project("p", "reqs").await.unwrap().id
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let (store, bus) = bus().await;
        let pid = project(&store).await;
        let sub = bus.subscribe(&pid).unwrap();

        for i in 0..3 {
            bus.publish(&pid, None, EventKind::TaskStart, format!("t{i}"), json!({}))
                .await
                .unwrap();
        }
        for i in 0..3 {
            let event = sub.recv().await;
            assert_eq!(event.message, format!("t{i}"));
        }
        assert!(!sub.lagged());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_flags_subscriber() {
        let (store, bus) = bus().await;
        let pid = project(&store).await;
        let sub = bus.subscribe(&pid).unwrap();

        // Queue capacity is 4; publish 6 without draining.
        for i in 0..6 {
            bus.publish(&pid, None, EventKind::ToolCall, format!("e{i}"), json!({}))
                .await
                .unwrap();
        }
        assert!(sub.lagged());
        // The two oldest were dropped.
        assert_eq!(sub.recv().await.message, "e2");

        // The journal still has all six.
        let persisted = store.recent_events(&pid, None, 10).await.unwrap();
        assert_eq!(persisted.len(), 6);
    }

    #[tokio::test]
    async fn subscriber_cap_enforced() {
        let (store, bus) = bus().await;
        let pid = project(&store).await;
        let _a = bus.subscribe(&pid).unwrap();
        let _b = bus.subscribe(&pid).unwrap();
        let err = bus.subscribe(&pid).unwrap_err();
        assert!(err.to_string().contains("too many subscribers"));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let (store, bus) = bus().await;
        let pid = project(&store).await;
        let sub = bus.subscribe(&pid).unwrap();
        assert_eq!(bus.subscriber_count(&pid), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(&pid), 0);

        // Publishing after the last subscriber left drops the bucket.
        bus.publish(&pid, None, EventKind::TaskStart, "x", json!({}))
            .await
            .unwrap();
        assert!(bus.subscribers.lock().unwrap().get(&pid).is_none());

        // And the cap frees up.
        let _c = bus.subscribe(&pid).unwrap();
        let _d = bus.subscribe(&pid).unwrap();
    }

    #[tokio::test]
    async fn subscribers_are_isolated_per_project() {
        let (store, bus) = bus().await;
        let p1 = project(&store).await;
        let p2 = project(&store).await;
        let sub1 = bus.subscribe(&p1).unwrap();
        let _sub2 = bus.subscribe(&p2).unwrap();

        bus.publish(&p2, None, EventKind::TaskStart, "other", json!({}))
            .await
            .unwrap();
        bus.publish(&p1, None, EventKind::TaskStart, "mine", json!({}))
            .await
            .unwrap();
        assert_eq!(sub1.recv().await.message, "mine");
        assert!(sub1.try_recv().is_none());
    }
}
