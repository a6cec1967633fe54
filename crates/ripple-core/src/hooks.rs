//! Channel lifecycle hook bus.
//!
//! Components subscribe to lifecycle events instead of calling back
//! into the orchestrator. Handlers run sequentially; a failing handler
//! is logged and the remaining handlers still run.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::warn;

/// A channel lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// First subscriber arrived and the channel was created.
    Created { channel: String },
    /// A socket subscribed; `count` is the new subscriber count.
    Subscribed {
        channel: String,
        socket_id: String,
        count: usize,
    },
    /// A socket unsubscribed; `count` is the remaining count.
    Unsubscribed {
        channel: String,
        socket_id: String,
        count: usize,
    },
    /// The last subscriber left.
    Empty { channel: String },
    /// The channel entry was dropped from the registry.
    Destroyed { channel: String },
}

impl ChannelEvent {
    /// The hook kind this event fires.
    #[must_use]
    pub fn kind(&self) -> HookKind {
        match self {
            ChannelEvent::Created { .. } => HookKind::Created,
            ChannelEvent::Subscribed { .. } => HookKind::Subscribed,
            ChannelEvent::Unsubscribed { .. } => HookKind::Unsubscribed,
            ChannelEvent::Empty { .. } => HookKind::Empty,
            ChannelEvent::Destroyed { .. } => HookKind::Destroyed,
        }
    }

    /// The channel the event concerns.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            ChannelEvent::Created { channel }
            | ChannelEvent::Subscribed { channel, .. }
            | ChannelEvent::Unsubscribed { channel, .. }
            | ChannelEvent::Empty { channel }
            | ChannelEvent::Destroyed { channel } => channel,
        }
    }
}

/// Hook registration selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Created,
    Subscribed,
    Unsubscribed,
    Empty,
    Destroyed,
    /// Fires for every lifecycle event.
    All,
}

impl HookKind {
    fn accepts(self, event: &ChannelEvent) -> bool {
        self == HookKind::All || self == event.kind()
    }
}

/// Handler error type; failures are logged, never propagated.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// An async lifecycle handler.
pub type HookHandler =
    Arc<dyn Fn(ChannelEvent) -> BoxFuture<'static, Result<(), HookError>> + Send + Sync>;

/// The lifecycle event bus.
#[derive(Default)]
pub struct HookBus {
    handlers: RwLock<Vec<(HookKind, HookHandler)>>,
}

impl HookBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a hook kind.
    pub fn on(&self, kind: HookKind, handler: HookHandler) {
        self.handlers
            .write()
            .expect("hook bus lock poisoned")
            .push((kind, handler));
    }

    /// Emit an event to every matching handler, sequentially and in
    /// registration order. Handler failures are logged and swallowed.
    pub async fn emit(&self, event: ChannelEvent) {
        let matching: Vec<HookHandler> = {
            let handlers = self.handlers.read().expect("hook bus lock poisoned");
            handlers
                .iter()
                .filter(|(kind, _)| kind.accepts(&event))
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in matching {
            if let Err(e) = handler(event.clone()).await {
                warn!(channel = %event.channel(), error = %e, "Lifecycle hook failed");
            }
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().expect("hook bus lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> HookHandler {
        Arc::new(move |_event| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_kind_filtering() {
        let bus = HookBus::new();
        let created = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        bus.on(HookKind::Created, counting_handler(Arc::clone(&created)));
        bus.on(HookKind::All, counting_handler(Arc::clone(&all)));

        bus.emit(ChannelEvent::Created {
            channel: "news".into(),
        })
        .await;
        bus.emit(ChannelEvent::Empty {
            channel: "news".into(),
        })
        .await;

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_the_chain() {
        let bus = HookBus::new();
        let counter = Arc::new(AtomicUsize::new(0));

        bus.on(
            HookKind::All,
            Arc::new(|_| Box::pin(async { Err("boom".into()) })),
        );
        bus.on(HookKind::All, counting_handler(Arc::clone(&counter)));

        bus.emit(ChannelEvent::Destroyed {
            channel: "news".into(),
        })
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let bus = HookBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(
                HookKind::All,
                Arc::new(move |_| {
                    let order = Arc::clone(&order);
                    Box::pin(async move {
                        order.lock().unwrap().push(tag);
                        Ok(())
                    })
                }),
            );
        }

        bus.emit(ChannelEvent::Created {
            channel: "c".into(),
        })
        .await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
