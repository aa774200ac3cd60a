//! Per-module lifecycle event bus.
//!
//! Strictly in-module: events never cross module boundaries. Fan-out is
//! synchronous on the publisher's thread; a panicking handler is caught and
//! logged and never prevents the remaining handlers from running.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;

use crate::domain::{ModuleId, ServiceId, Version};
use crate::instance::ModuleInstance;

/// Everything that can happen inside one module runtime.
#[derive(Clone)]
pub enum RuntimeEvent {
    InstanceStarting {
        module: ModuleId,
        version: Version,
    },
    InstanceUpgrading {
        module: ModuleId,
        new_version: Version,
    },
    InstanceReady {
        module: ModuleId,
        version: Version,
        instance: Arc<ModuleInstance>,
    },
    InstanceStarted {
        module: ModuleId,
        version: Version,
    },
    InstanceDying {
        module: ModuleId,
        version: Version,
        instance: Arc<ModuleInstance>,
    },
    InstanceDestroyed {
        module: ModuleId,
        version: Version,
    },
    RuntimeShuttingDown {
        module: ModuleId,
    },
    RuntimeShutdown {
        module: ModuleId,
    },
    InvocationStarted {
        module: ModuleId,
        service: ServiceId,
        caller: ModuleId,
    },
    InvocationCompleted {
        module: ModuleId,
        service: ServiceId,
        duration: Duration,
        success: bool,
    },
    InvocationRejected {
        module: ModuleId,
        service: ServiceId,
        reason: String,
    },
}

impl RuntimeEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::InstanceStarting { .. } => EventKind::InstanceStarting,
            Self::InstanceUpgrading { .. } => EventKind::InstanceUpgrading,
            Self::InstanceReady { .. } => EventKind::InstanceReady,
            Self::InstanceStarted { .. } => EventKind::InstanceStarted,
            Self::InstanceDying { .. } => EventKind::InstanceDying,
            Self::InstanceDestroyed { .. } => EventKind::InstanceDestroyed,
            Self::RuntimeShuttingDown { .. } => EventKind::RuntimeShuttingDown,
            Self::RuntimeShutdown { .. } => EventKind::RuntimeShutdown,
            Self::InvocationStarted { .. } => EventKind::InvocationStarted,
            Self::InvocationCompleted { .. } => EventKind::InvocationCompleted,
            Self::InvocationRejected { .. } => EventKind::InvocationRejected,
        }
    }
}

impl std::fmt::Debug for RuntimeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind())
    }
}

/// Discriminant of [`RuntimeEvent`] used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    InstanceStarting,
    InstanceUpgrading,
    InstanceReady,
    InstanceStarted,
    InstanceDying,
    InstanceDestroyed,
    RuntimeShuttingDown,
    RuntimeShutdown,
    InvocationStarted,
    InvocationCompleted,
    InvocationRejected,
}

type Handler = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Typed publish/subscribe bus scoped to one module runtime.
pub struct EventBus {
    subscribers: DashMap<EventKind, Vec<(u64, Handler)>>,
    next_id: AtomicU64,
    this: Weak<EventBus>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            this: Weak::clone(this),
        })
    }

    /// Registers a handler for one event kind.
    ///
    /// The returned handle removes the handler on `unsubscribe`; dropping the
    /// handle keeps the subscription alive.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&RuntimeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Weak::clone(&self.this),
            kind,
            id,
        }
    }

    /// Dispatches to every handler currently subscribed to the event's kind.
    pub fn publish(&self, event: &RuntimeEvent) {
        // Snapshot outside the shard lock so handlers can re-enter the bus.
        let handlers: Vec<Handler> = match self.subscribers.get(&event.kind()) {
            Some(entry) => entry.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(kind = ?event.kind(), "event handler panicked; continuing fan-out");
            }
        }
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.subscribers.clear();
    }

    /// Total live subscriptions, for diagnostics.
    #[must_use]
    pub fn count(&self) -> usize {
        self.subscribers.iter().map(|e| e.value().len()).sum()
    }

    fn unsubscribe(&self, kind: EventKind, id: u64) {
        if let Some(mut entry) = self.subscribers.get_mut(&kind) {
            entry.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.count())
            .finish()
    }
}

/// Handle for one registered handler. Holds only a weak bus reference.
pub struct Subscription {
    bus: Weak<EventBus>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.kind, self.id);
        }
    }
}
