//! Named-event publish/subscribe.
//!
//! [`EventDispatcher`] is the only channel through which the client's
//! components talk to each other and to UI collaborators. Handlers run
//! synchronously inside [`publish`](EventDispatcher::publish), in priority
//! order (higher first) and then subscription order.
//!
//! # Example
//!
//! ```
//! use round_client::dispatcher::{EventDispatcher, SubscribeOptions};
//! use round_client::event::{Event, EventData};
//!
//! let events = EventDispatcher::new();
//! let sub = events.subscribe_with(
//!     "greeting",
//!     SubscribeOptions::default().with_priority(10),
//!     |event: &Event| {
//!         println!("got {}", event.name);
//!         Ok(())
//!     },
//! );
//!
//! assert_eq!(events.publish("greeting", EventData::None), 1);
//! assert!(sub.unsubscribe());
//! assert!(!sub.unsubscribe());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::HandlerError;
use crate::event::{Event, EventData};
use crate::registry::Service;

type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

// ── Error reporting ─────────────────────────────────────────────────

/// Receives errors returned by event handlers.
///
/// A failing handler never stops dispatch; its error is handed here instead.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, event: &Event, context: Option<&str>, error: &HandlerError);
}

/// Default [`ErrorReporter`] that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, event: &Event, context: Option<&str>, error: &HandlerError) {
        error!(
            event = %event.name,
            context = context.unwrap_or("-"),
            "event handler failed: {error}"
        );
    }
}

// ── Subscription options ────────────────────────────────────────────

/// Options for [`EventDispatcher::subscribe_with`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first invocation.
    pub once: bool,
    /// Higher values run first. Defaults to 0.
    pub priority: i32,
    /// Label for the receiver the handler is bound to, used in error reports.
    pub context: Option<String>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

struct Entry {
    id: u64,
    handler: Handler,
    once: bool,
    priority: i32,
    context: Option<String>,
    fired: AtomicBool,
}

struct Inner {
    subscribers: Mutex<HashMap<String, Vec<Arc<Entry>>>>,
    next_id: AtomicU64,
    reporter: Arc<dyn ErrorReporter>,
}

impl Inner {
    fn remove(&self, event: &str, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| entry.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(event);
        }
        removed
    }
}

/// Publish/subscribe hub keyed by event name.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`.
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl EventDispatcher {
    /// Create a dispatcher that reports handler errors through `tracing`.
    pub fn new() -> Self {
        Self::with_reporter(Arc::new(TracingReporter))
    }

    /// Create a dispatcher with a custom error-reporting collaborator.
    pub fn with_reporter(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                reporter,
            }),
        }
    }

    /// Subscribe `handler` to `event` with default options.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_with(event, SubscribeOptions::default(), handler)
    }

    /// Subscribe `handler` for a single invocation.
    pub fn subscribe_once<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_with(event, SubscribeOptions::default().once(), handler)
    }

    /// Subscribe `handler` to `event`.
    ///
    /// The returned [`Subscription`] is the only way to remove the handler
    /// short of [`clear`](Self::clear). Dropping it leaves the handler in place.
    pub fn subscribe_with<F>(
        &self,
        event: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            handler: Arc::new(handler),
            once: options.once,
            priority: options.priority,
            context: options.context,
            fired: AtomicBool::new(false),
        });

        let mut subscribers = self.inner.subscribers.lock();
        let list = subscribers.entry(event.to_string()).or_default();
        // Keep the list sorted: higher priority first, ties in insertion order.
        let position = list
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(list.len());
        list.insert(position, entry);

        Subscription {
            event: event.to_string(),
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Publish `data` under `event`. Returns the number of handlers invoked.
    pub fn publish(&self, event: &str, data: EventData) -> usize {
        self.publish_event(Event::new(event, data))
    }

    /// Publish `data` under `event`, tagged with the publishing component.
    pub fn publish_from(&self, event: &str, data: EventData, source: &str) -> usize {
        self.publish_event(Event::new(event, data).with_source(source))
    }

    /// Publish a fully built [`Event`].
    ///
    /// Handlers are taken from a snapshot of the subscriber list, so
    /// subscriptions added or removed while dispatching do not affect this
    /// call. Re-entrant publishing from a handler is allowed.
    pub fn publish_event(&self, event: Event) -> usize {
        let snapshot: Vec<Arc<Entry>> = match self.inner.subscribers.lock().get(&event.name) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut invoked = 0;
        for entry in snapshot {
            if entry.once {
                if entry.fired.swap(true, Ordering::AcqRel) {
                    continue;
                }
                self.inner.remove(&event.name, entry.id);
            }
            invoked += 1;
            if let Err(err) = (entry.handler)(&event) {
                self.inner
                    .reporter
                    .report(&event, entry.context.as_deref(), &err);
            }
        }
        invoked
    }

    /// Remove every subscription for every event.
    pub fn clear(&self) {
        let mut subscribers = self.inner.subscribers.lock();
        debug!(events = subscribers.len(), "dispatcher: clearing all subscriptions");
        subscribers.clear();
    }

    /// Remove every subscription for `event`.
    pub fn clear_event(&self, event: &str) {
        self.inner.subscribers.lock().remove(event);
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn has_subscribers(&self, event: &str) -> bool {
        self.subscriber_count(event) > 0
    }

    /// Names of events with at least one subscriber, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.subscribers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn total_subscriptions(&self) -> usize {
        self.inner.subscribers.lock().values().map(Vec::len).sum()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("events", &self.event_names())
            .field("subscriptions", &self.total_subscriptions())
            .finish()
    }
}

impl Service for EventDispatcher {
    fn teardown(&self) -> Result<(), HandlerError> {
        self.clear();
        Ok(())
    }
}

// ── Subscription handle ─────────────────────────────────────────────

/// Capability to remove one subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    event: String,
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Remove the handler. Returns `true` if it was still registered.
    ///
    /// Safe to call any number of times, after [`EventDispatcher::clear`],
    /// and after the dispatcher itself has been dropped.
    pub fn unsubscribe(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.remove(&self.event, self.id),
            None => false,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> Handler {
            let sink = Arc::clone(&sink);
            Arc::new(move |_event: &Event| {
                sink.lock().push(label.to_string());
                Ok(())
            })
        };
        (log, make)
    }

    #[derive(Default)]
    struct CountingReporter {
        reports: Mutex<Vec<(String, Option<String>, String)>>,
    }

    impl ErrorReporter for CountingReporter {
        fn report(&self, event: &Event, context: Option<&str>, error: &HandlerError) {
            self.reports.lock().push((
                event.name.clone(),
                context.map(str::to_string),
                error.to_string(),
            ));
        }
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let events = EventDispatcher::new();
        assert_eq!(events.publish("nothing", EventData::None), 0);
    }

    #[test]
    fn subscribers_run_in_subscription_order() {
        let events = EventDispatcher::new();
        let (log, make) = recorder();
        for label in ["a", "b", "c"] {
            let handler = make(label);
            let _ = events.subscribe("e", move |ev: &Event| handler(ev));
        }
        assert_eq!(events.publish("e", EventData::None), 3);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn priority_orders_before_subscription_order() {
        let events = EventDispatcher::new();
        let (log, make) = recorder();
        for (label, priority) in [("low", -1), ("first", 0), ("high", 5), ("second", 0), ("top", 9)] {
            let handler = make(label);
            let _ = events.subscribe_with(
                "e",
                SubscribeOptions::default().with_priority(priority),
                move |ev: &Event| handler(ev),
            );
        }
        events.publish("e", EventData::None);
        assert_eq!(*log.lock(), vec!["top", "high", "first", "second", "low"]);
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        let reporter = Arc::new(CountingReporter::default());
        let events = EventDispatcher::with_reporter(reporter.clone());
        let (log, make) = recorder();

        let _ = events.subscribe_with(
            "e",
            SubscribeOptions::default().with_context("broken-view"),
            |_event: &Event| Err("boom".into()),
        );
        for label in ["b", "c"] {
            let handler = make(label);
            let _ = events.subscribe("e", move |ev: &Event| handler(ev));
        }

        assert_eq!(events.publish("e", EventData::None), 3);
        assert_eq!(*log.lock(), vec!["b", "c"]);
        let reports = reporter.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0],
            ("e".to_string(), Some("broken-view".to_string()), "boom".to_string())
        );
    }

    #[test]
    fn once_fires_a_single_time_even_on_error() {
        let events = EventDispatcher::with_reporter(Arc::new(CountingReporter::default()));
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let _ = events.subscribe_once("e", move |_event: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("fails".into())
        });

        events.publish("e", EventData::None);
        events.publish("e", EventData::None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!events.has_subscribers("e"));
    }

    #[test]
    fn once_is_not_reinvoked_by_reentrant_publish() {
        let events = Arc::new(EventDispatcher::new());
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let weak = Arc::downgrade(&events);
        let _ = events.subscribe_once("e", move |_event: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(events) = weak.upgrade() {
                events.publish("e", EventData::None);
            }
            Ok(())
        });
        events.publish("e", EventData::None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_safe_after_clear() {
        let events = EventDispatcher::new();
        let first = events.subscribe("e", |_event: &Event| Ok(()));
        let second = events.subscribe("e", |_event: &Event| Ok(()));

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert_eq!(events.subscriber_count("e"), 1);

        events.clear();
        assert!(!second.unsubscribe());
        assert_eq!(events.total_subscriptions(), 0);
    }

    #[test]
    fn unsubscribe_after_dispatcher_dropped() {
        let events = EventDispatcher::new();
        let sub = events.subscribe("e", |_event: &Event| Ok(()));
        drop(events);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn changes_during_dispatch_do_not_affect_current_publish() {
        let events = Arc::new(EventDispatcher::new());
        let (log, make) = recorder();

        let later = Arc::new(Mutex::new(None::<Subscription>));
        let slot = Arc::clone(&later);
        let weak = Arc::downgrade(&events);
        let add = make("added");
        let _ = events.subscribe("e", move |_event: &Event| {
            if let Some(sub) = slot.lock().as_ref() {
                sub.unsubscribe();
            }
            if let Some(events) = weak.upgrade() {
                let add = add.clone();
                let _ = events.subscribe("e", move |ev: &Event| add(ev));
            }
            Ok(())
        });
        let removed = make("removed");
        *later.lock() = Some(events.subscribe("e", move |ev: &Event| removed(ev)));

        // The removed handler still runs this time; the added one does not.
        assert_eq!(events.publish("e", EventData::None), 2);
        assert_eq!(*log.lock(), vec!["removed"]);

        log.lock().clear();
        events.publish("e", EventData::None);
        assert_eq!(*log.lock(), vec!["added"]);
    }

    #[test]
    fn introspection_reports_live_subscriptions() {
        let events = EventDispatcher::new();
        let _a = events.subscribe("b-event", |_event: &Event| Ok(()));
        let _b = events.subscribe("a-event", |_event: &Event| Ok(()));
        let _c = events.subscribe("a-event", |_event: &Event| Ok(()));

        assert_eq!(events.event_names(), vec!["a-event", "b-event"]);
        assert_eq!(events.subscriber_count("a-event"), 2);
        assert_eq!(events.total_subscriptions(), 3);

        events.clear_event("a-event");
        assert!(!events.has_subscribers("a-event"));
    }

    #[test]
    fn source_is_passed_to_handlers() {
        let events = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let _ = events.subscribe("e", move |event: &Event| {
            *sink.lock() = event.source.clone();
            Ok(())
        });
        events.publish_from("e", EventData::None, "session");
        assert_eq!(seen.lock().as_deref(), Some("session"));
    }
}
