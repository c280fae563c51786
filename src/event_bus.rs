//! Event Bus (spec §4.4). Bounded ring-buffer history plus registration-order
//! dispatch, fault-isolated per handler.
//!
//! The history/fan-out shape is grounded directly in the teacher's
//! `comms::server::to_broadcast_stream`, which keeps an
//! `Arc<Mutex<Vec<Arc<[u8]>>>>` history alongside a live fan-out channel.
//! Here the history is a fixed-capacity ring (spec requires O(1) eviction,
//! which an ever-growing `Vec` is not), and dispatch goes to explicitly
//! registered handlers instead of raw byte fan-out, since subscribers need
//! per-kind filtering and ordered sync/async dispatch.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event::{Event, EventKindTag};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

type SyncHandler = Arc<dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Event) -> BoxFuture<'static> + Send + Sync>;

#[derive(Clone)]
pub enum Dispatch {
    /// Must not block the caller for more than ~1ms (spec §4.4); enforced
    /// by convention, not by the bus.
    Sync(SyncHandler),
    /// Awaited sequentially unless `parallel` is set, in which case it is
    /// spawned onto the runtime alongside the other parallel handlers of
    /// this publication and joined before `publish` returns.
    Async { handler: AsyncHandler, parallel: bool },
}

pub type MiddlewareResult = Result<(), ()>; // Err = drop

type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: Option<Filter>,
    dispatch: Dispatch,
}

pub struct Subscription {
    pub id: u64,
    kind: EventKindTag,
}

const DEFAULT_HISTORY_CAPACITY: usize = 100;

pub struct EventBus {
    middleware: Mutex<Vec<Box<dyn Fn(&Event) -> MiddlewareResult + Send + Sync>>>,
    subscribers: Mutex<HashMap<EventKindTag, Vec<Subscriber>>>,
    history: Mutex<VecDeque<Event>>,
    history_capacity: usize,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            middleware: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn use_middleware(
        &self,
        middleware: impl Fn(&Event) -> MiddlewareResult + Send + Sync + 'static,
    ) {
        self.middleware.lock().push(Box::new(middleware));
    }

    pub fn subscribe(
        &self,
        kind: EventKindTag,
        dispatch: Dispatch,
        filter: Option<Filter>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, filter, dispatch });
        Subscription { id, kind }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(subs) = self.subscribers.lock().get_mut(&subscription.kind) {
            subs.retain(|s| s.id != subscription.id);
        }
    }

    pub fn history(&self) -> Vec<Event> {
        self.history.lock().iter().cloned().collect()
    }

    /// Publishes `event`. Per spec §4.4:
    /// 1. middleware chain runs, any "drop" halts dispatch;
    /// 2. event is appended to the bounded history, oldest evicted;
    /// 3. handlers dispatch in registration order, a failing handler is
    ///    logged and does not stop the rest;
    /// 4. async handlers are awaited sequentially unless marked parallel.
    pub async fn publish(&self, event: Event) {
        {
            let middleware = self.middleware.lock();
            for mw in middleware.iter() {
                if mw(&event).is_err() {
                    tracing::debug!(kind = ?event.kind_tag(), "event dropped by middleware");
                    return;
                }
            }
        }

        {
            let mut history = self.history.lock();
            if history.len() == self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let kind = event.kind_tag();
        // Snapshot the dispatch list under the lock, then release it before
        // running any handler: a handler that calls back into
        // `subscribe`/`publish` must never deadlock on this mutex.
        let targets: Vec<(Dispatch, bool)> = {
            let subs = self.subscribers.lock();
            subs.get(&kind)
                .map(|v| {
                    v.iter()
                        .filter(|s| s.filter.as_ref().map_or(true, |f| f(&event)))
                        .map(|s| (s.dispatch.clone(), true))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut parallel_set = tokio::task::JoinSet::new();
        for (dispatch, _) in targets {
            match dispatch {
                Dispatch::Sync(handler) => {
                    if let Err(err) = handler(&event) {
                        tracing::error!(kind = ?kind, %err, "event handler failed");
                    }
                }
                Dispatch::Async { handler, parallel } if parallel => {
                    let event = event.clone();
                    parallel_set.spawn(async move { handler(event).await });
                }
                Dispatch::Async { handler, .. } => {
                    if let Err(err) = handler(event.clone()).await {
                        tracing::error!(kind = ?kind, %err, "async event handler failed");
                    }
                }
            }
        }

        while let Some(joined) = parallel_set.join_next().await {
            match joined {
                Ok(Err(err)) => tracing::error!(kind = ?kind, %err, "parallel event handler failed"),
                Err(join_err) => tracing::error!(kind = ?kind, %join_err, "parallel event handler panicked"),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind, SourceType};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn kp(key: &str) -> Event {
        Event::new(
            EventKind::KeyPress { key: key.into() },
            None,
            SourceType::Internal,
        )
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            bus.subscribe(
                EventKindTag::KeyPress,
                Dispatch::Sync(Arc::new(move |_| {
                    order.lock().push(tag);
                    Ok(())
                })),
                None,
            );
        }
        bus.publish(kp("x")).await;
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            EventKindTag::KeyPress,
            Dispatch::Sync(Arc::new(|_| Err("boom".into()))),
            None,
        );
        let ran2 = ran.clone();
        bus.subscribe(
            EventKindTag::KeyPress,
            Dispatch::Sync(Arc::new(move |_| {
                ran2.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })),
            None,
        );
        bus.publish(kp("x")).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn history_evicts_oldest_at_capacity() {
        let bus = EventBus::with_history_capacity(2);
        bus.publish(kp("1")).await;
        bus.publish(kp("2")).await;
        bus.publish(kp("3")).await;
        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert!(matches!(&history[0].kind, EventKind::KeyPress { key } if key == "2"));
        assert!(matches!(&history[1].kind, EventKind::KeyPress { key } if key == "3"));
    }

    #[tokio::test]
    async fn middleware_drop_halts_dispatch() {
        let bus = EventBus::new();
        bus.use_middleware(|_| Err(()));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        bus.subscribe(
            EventKindTag::KeyPress,
            Dispatch::Sync(Arc::new(move |_| {
                ran2.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })),
            None,
        );
        bus.publish(kp("x")).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 0);
        assert!(bus.history().is_empty());
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_events() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        bus.subscribe(
            EventKindTag::KeyPress,
            Dispatch::Sync(Arc::new(move |_| {
                ran2.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })),
            Some(Arc::new(|e: &Event| {
                matches!(&e.kind, EventKind::KeyPress { key } if key == "match")
            })),
        );
        bus.publish(kp("nope")).await;
        bus.publish(kp("match")).await;
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }
}
