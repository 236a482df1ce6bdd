//! In-process domain pub/sub.
//!
//! Thin topic-keyed fan-out: subsystems publish JSON payloads under
//! string topics (`thing:created`, `cascade:failed`, ...) and any
//! number of subscribers receive them. Two delivery flavors:
//!
//! - callbacks registered with [`PubSub::on`], invoked synchronously at
//!   emit time; a panicking subscriber is caught and logged, never
//!   affecting the publisher;
//! - bounded channel subscriptions from [`PubSub::subscribe`], with
//!   drop-on-full semantics so a slow consumer cannot stall the
//!   instance.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde_json::Value;
use tracing::warn;

/// A published event: topic plus JSON payload.
pub type Published = (String, Value);

type Handler = Box<dyn Fn(&Value) + Send + Sync>;

/// Topic-keyed publish/subscribe bus.
#[derive(Default)]
pub struct PubSub {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    channels: Mutex<Vec<(Option<String>, Sender<Published>)>>,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.handlers.read().unwrap().len();
        f.debug_struct("PubSub")
            .field("topics", &topics)
            .finish_non_exhaustive()
    }
}

impl PubSub {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for one topic.
    pub fn on(&self, topic: impl Into<String>, handler: impl Fn(&Value) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap()
            .entry(topic.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Opens a bounded channel subscription.
    ///
    /// `topic_filter = None` receives everything. When the channel is
    /// full new events are dropped, not blocked on.
    pub fn subscribe(&self, topic_filter: Option<String>, capacity: usize) -> Receiver<Published> {
        let (tx, rx) = bounded(capacity.max(1));
        self.channels.lock().unwrap().push((topic_filter, tx));
        rx
    }

    /// Publishes an event to all matching subscribers.
    pub fn emit(&self, topic: &str, payload: &Value) {
        {
            let handlers = self.handlers.read().unwrap();
            if let Some(subscribers) = handlers.get(topic) {
                for handler in subscribers {
                    // A panicking subscriber must not take the publisher down
                    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                        warn!(topic, "Subscriber panicked; continuing");
                    }
                }
            }
        }

        let mut channels = self.channels.lock().unwrap();
        channels.retain(|(filter, tx)| {
            if filter.as_deref().is_some_and(|f| f != topic) {
                return true;
            }
            match tx.try_send((topic.to_string(), payload.clone())) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(topic, "Subscriber channel full; dropping event");
                    true
                }
                // Receiver gone: forget the subscription
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_multiple_subscribers_all_called() {
        let bus = PubSub::new();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            bus.on("thing:created", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit("thing:created", &serde_json::json!({ "id": "x" }));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = PubSub::new();
        let count = Arc::new(AtomicU32::new(0));
        {
            let count = Arc::clone(&count);
            bus.on("thing:created", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit("thing:deleted", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_others() {
        let bus = PubSub::new();
        let count = Arc::new(AtomicU32::new(0));
        bus.on("t", |_| panic!("bad subscriber"));
        {
            let count = Arc::clone(&count);
            bus.on("t", move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit("t", &Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_subscription_receives() {
        let bus = PubSub::new();
        let rx = bus.subscribe(Some("cascade:queued".to_string()), 8);
        bus.emit("cascade:queued", &serde_json::json!({ "id": 1 }));
        bus.emit("cascade:failed", &serde_json::json!({ "id": 2 }));

        let (topic, payload) = rx.try_recv().unwrap();
        assert_eq!(topic, "cascade:queued");
        assert_eq!(payload["id"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unfiltered_channel_receives_everything() {
        let bus = PubSub::new();
        let rx = bus.subscribe(None, 8);
        bus.emit("a", &Value::Null);
        bus.emit("b", &Value::Null);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let bus = PubSub::new();
        let rx = bus.subscribe(None, 1);
        bus.emit("a", &Value::Null);
        bus.emit("b", &Value::Null);
        assert_eq!(rx.len(), 1);
        let (topic, _) = rx.try_recv().unwrap();
        assert_eq!(topic, "a");
    }

    #[test]
    fn test_disconnected_channel_is_pruned() {
        let bus = PubSub::new();
        let rx = bus.subscribe(None, 1);
        drop(rx);
        bus.emit("a", &Value::Null);
        assert!(bus.channels.lock().unwrap().is_empty());
    }
}
