//! The ordered, durable, multi-subscriber event log for one session.
//!
//! The stream is the sole coordination medium between the controller, the
//! runtime, and memory: everything they say to each other goes through
//! `add_event`. Append order is the only order; ids are assigned under the
//! stream lock, the event is persisted, and only then are subscribers
//! notified. Each subscriber drains its own queue on its own task, so a slow
//! or failing callback cannot stall the others.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::warn;

use windlass_protocol::Event;
use windlass_protocol::EventSource;

use crate::error::Result;
use crate::error::WindlassErr;
use crate::metrics::Metrics;
use crate::metrics::MetricsSnapshot;
use crate::store::FileStore;

/// Which component a subscription belongs to. Together with the caller's
/// `callback_id` this keys the subscription; re-subscribing under the same
/// key replaces the previous callback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriberKind {
    AgentController,
    Runtime,
    Memory,
    Server,
    Test,
}

pub type SubscriberCallback = Arc<
    dyn Fn(Event) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync,
>;

struct Subscriber {
    tx: mpsc::UnboundedSender<Event>,
    forwarder: JoinHandle<()>,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

pub struct EventStream {
    session_id: String,
    store: Arc<dyn FileStore>,
    /// Guards id assignment and the persist step so appends are serialized.
    next_id: Mutex<i64>,
    subscribers: Mutex<HashMap<(SubscriberKind, String), Subscriber>>,
    metrics: Metrics,
}

impl EventStream {
    /// Open (or resume) the stream for `session_id`. `next_id` is rebuilt by
    /// scanning the persisted events, so a restarted process continues the
    /// id sequence instead of forking it.
    pub fn new(session_id: impl Into<String>, store: Arc<dyn FileStore>) -> Self {
        let session_id = session_id.into();
        let latest = latest_persisted_id(&session_id, store.as_ref());
        Self {
            session_id,
            store,
            next_id: Mutex::new(latest + 1),
            subscribers: Mutex::new(HashMap::new()),
            metrics: Metrics::default(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The backing store, shared with components that persist session-scoped
    /// artifacts next to the events (state snapshots, metrics aggregates).
    pub fn store(&self) -> Arc<dyn FileStore> {
        Arc::clone(&self.store)
    }

    /// The conversation-wide metrics handle. Controllers clone this so the
    /// stream can answer `get_metrics` for the whole session.
    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Assign the next id, persist, then fan out. Returns the assigned id.
    /// On a persistence failure nothing was handed out and no subscriber
    /// heard about the event.
    pub fn add_event(&self, mut event: Event, source: EventSource) -> Result<i64> {
        event.source = source;
        event.timestamp = chrono::Utc::now();

        let assigned = {
            let mut next_id = lock_unpoisoned(&self.next_id);
            event.id = *next_id;
            let serialized = serde_json::to_string(&event)?;
            self.store
                .write(&event_path(&self.session_id, event.id), &serialized)
                .map_err(|source| WindlassErr::Persist {
                    session_id: self.session_id.clone(),
                    id: event.id,
                    source,
                })?;
            *next_id += 1;
            event.id
        };

        self.notify(event);
        Ok(assigned)
    }

    pub fn get_event(&self, id: i64) -> Result<Event> {
        let raw = self
            .store
            .read(&event_path(&self.session_id, id))
            .map_err(|_| WindlassErr::EventNotFound {
                session_id: self.session_id.clone(),
                id,
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Lazy scan over the id range in order (or reverse). Missing ids inside
    /// the range (explicit deletions) are skipped.
    pub fn get_events(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
        reverse: bool,
        filter: Option<Box<dyn Fn(&Event) -> bool>>,
    ) -> impl Iterator<Item = Event> + '_ {
        let start = start_id.unwrap_or(0).max(0);
        let end = end_id.unwrap_or_else(|| self.get_latest_event_id());
        let ids: Vec<i64> = if reverse {
            (start..=end.max(start - 1)).rev().collect()
        } else {
            (start..=end.max(start - 1)).collect()
        };
        ids.into_iter().filter_map(move |id| {
            let event = self.get_event(id).ok()?;
            match &filter {
                Some(predicate) if !predicate(&event) => None,
                _ => Some(event),
            }
        })
    }

    /// Largest assigned id, or −1 when the session has no events.
    pub fn get_latest_event_id(&self) -> i64 {
        *lock_unpoisoned(&self.next_id) - 1
    }

    /// Register `callback` for every future event. Delivery to one
    /// subscriber is sequential and in append order; subscribers run
    /// concurrently with each other. In-memory only: subscriptions do not
    /// survive a restart.
    pub fn subscribe(
        &self,
        kind: SubscriberKind,
        callback: SubscriberCallback,
        callback_id: impl Into<String>,
    ) {
        let callback_id = callback_id.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let forwarder = tokio::spawn({
            let key = format!("{kind}/{callback_id}");
            async move {
                while let Some(event) = rx.recv().await {
                    let event_id = event.id;
                    if let Err(e) = callback(event).await {
                        // Callback failures are isolated: log and keep
                        // delivering.
                        error!("subscriber {key} failed on event {event_id}: {e:#}");
                    }
                }
            }
        });

        let mut subscribers = lock_unpoisoned(&self.subscribers);
        if subscribers
            .insert((kind, callback_id.clone()), Subscriber { tx, forwarder })
            .is_some()
        {
            warn!("replaced existing subscriber {kind}/{callback_id}");
        }
    }

    /// Best-effort removal; unknown keys are ignored.
    pub fn unsubscribe(&self, kind: SubscriberKind, callback_id: &str) {
        let mut subscribers = lock_unpoisoned(&self.subscribers);
        subscribers.remove(&(kind, callback_id.to_string()));
    }

    fn notify(&self, event: Event) {
        let subscribers = lock_unpoisoned(&self.subscribers);
        for ((kind, callback_id), subscriber) in subscribers.iter() {
            if subscriber.tx.send(event.clone()).is_err() {
                warn!("subscriber {kind}/{callback_id} queue closed; dropping event");
            }
        }
    }
}

fn event_path(session_id: &str, id: i64) -> String {
    format!("sessions/{session_id}/events/{id:020}.json")
}

fn latest_persisted_id(session_id: &str, store: &dyn FileStore) -> i64 {
    let prefix = format!("sessions/{session_id}/events/");
    let paths = match store.list(&prefix) {
        Ok(paths) => paths,
        Err(_) => return -1,
    };
    paths
        .iter()
        .filter_map(|path| {
            path.strip_prefix(&prefix)?
                .strip_suffix(".json")?
                .parse::<i64>()
                .ok()
        })
        .max()
        .unwrap_or(-1)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryFileStore;
    use windlass_protocol::Action;
    use windlass_protocol::ActionKind;
    use windlass_protocol::Observation;

    fn message(text: &str) -> Event {
        Event::action(
            EventSource::User,
            Action::from(ActionKind::Message {
                content: text.to_string(),
                wait_for_response: false,
            }),
        )
    }

    #[tokio::test]
    async fn ids_are_contiguous_from_zero() {
        let stream = EventStream::new("s1", Arc::new(InMemoryFileStore::new()));
        assert_eq!(stream.get_latest_event_id(), -1);
        for expected in 0..3 {
            let id = stream
                .add_event(message("hi"), EventSource::User)
                .unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(stream.get_latest_event_id(), 2);
    }

    #[tokio::test]
    async fn next_id_is_rebuilt_from_the_store() {
        let store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
        {
            let stream = EventStream::new("s1", Arc::clone(&store));
            stream.add_event(message("one"), EventSource::User).unwrap();
            stream.add_event(message("two"), EventSource::User).unwrap();
        }
        let resumed = EventStream::new("s1", store);
        assert_eq!(resumed.get_latest_event_id(), 1);
        let id = resumed
            .add_event(message("three"), EventSource::User)
            .unwrap();
        assert_eq!(id, 2);
    }

    #[tokio::test]
    async fn get_events_respects_range_order_and_filter() {
        let stream = EventStream::new("s1", Arc::new(InMemoryFileStore::new()));
        for i in 0..5 {
            stream
                .add_event(message(&format!("m{i}")), EventSource::User)
                .unwrap();
        }

        let forward: Vec<i64> = stream
            .get_events(Some(1), Some(3), false, None)
            .map(|e| e.id)
            .collect();
        assert_eq!(forward, vec![1, 2, 3]);

        let reversed: Vec<i64> = stream
            .get_events(None, None, true, None)
            .map(|e| e.id)
            .collect();
        assert_eq!(reversed, vec![4, 3, 2, 1, 0]);

        let odd_only: Vec<i64> = stream
            .get_events(None, None, false, Some(Box::new(|e: &Event| e.id % 2 == 1)))
            .map(|e| e.id)
            .collect();
        assert_eq!(odd_only, vec![1, 3]);
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_order_and_failures_are_isolated() {
        let stream = EventStream::new("s1", Arc::new(InMemoryFileStore::new()));
        let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        let seen_by_good = Arc::clone(&seen);
        stream.subscribe(
            SubscriberKind::Test,
            Arc::new(move |event: Event| {
                let seen = Arc::clone(&seen_by_good);
                Box::pin(async move {
                    seen.lock().unwrap().push(event.id);
                    Ok(())
                })
            }),
            "good",
        );
        stream.subscribe(
            SubscriberKind::Test,
            Arc::new(|_event: Event| {
                Box::pin(async move { Err(anyhow::anyhow!("subscriber blew up")) })
            }),
            "faulty",
        );

        for _ in 0..4 {
            stream.add_event(message("x"), EventSource::User).unwrap();
        }

        // Queues drain asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn resubscribe_with_same_key_replaces() {
        let stream = EventStream::new("s1", Arc::new(InMemoryFileStore::new()));
        let first: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let second: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

        for sink in [&first, &second] {
            let sink = Arc::clone(sink);
            stream.subscribe(
                SubscriberKind::Test,
                Arc::new(move |event: Event| {
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.lock().unwrap().push(event.id);
                        Ok(())
                    })
                }),
                "same-key",
            );
        }

        stream.add_event(message("x"), EventSource::User).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(*second.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn concurrent_appends_get_distinct_ids() {
        let stream = Arc::new(EventStream::new(
            "s1",
            Arc::new(InMemoryFileStore::new()) as Arc<dyn FileStore>,
        ));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stream = Arc::clone(&stream);
            handles.push(std::thread::spawn(move || {
                stream.add_event(message("x"), EventSource::User).unwrap()
            }));
        }
        let mut ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8, "double-append must be impossible");
    }

    #[tokio::test]
    async fn observation_cause_links_back() {
        let stream = EventStream::new("s1", Arc::new(InMemoryFileStore::new()));
        let action_id = stream
            .add_event(message("run it"), EventSource::User)
            .unwrap();
        let obs = Event::observation(EventSource::Environment, Observation::error("nope"))
            .with_cause(action_id);
        let obs_id = stream.add_event(obs, EventSource::Environment).unwrap();

        let loaded = stream.get_event(obs_id).unwrap();
        assert_eq!(loaded.cause, Some(action_id));
        assert!(loaded.cause.unwrap() < obs_id);
    }
}
