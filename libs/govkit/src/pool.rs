//! The set of instances backing one module.
//!
//! Writers (the lifecycle manager) are serialized by a single mutex held only
//! for pointer manipulation; readers (routing) observe a snapshot of the
//! active list and an atomic default pointer, never the write lock.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;

use crate::domain::ModuleId;
use crate::events::{EventBus, RuntimeEvent};
use crate::instance::ModuleInstance;

pub struct InstancePool {
    module: ModuleId,
    active: ArcSwap<Vec<Arc<ModuleInstance>>>,
    default_instance: ArcSwapOption<ModuleInstance>,
    dying: Mutex<VecDeque<Arc<ModuleInstance>>>,
    max_dying: usize,
    write_lock: Mutex<()>,
    bus: Arc<EventBus>,
}

impl InstancePool {
    #[must_use]
    pub fn new(module: ModuleId, max_dying: usize, bus: Arc<EventBus>) -> Self {
        Self {
            module,
            active: ArcSwap::from_pointee(Vec::new()),
            default_instance: ArcSwapOption::empty(),
            dying: Mutex::new(VecDeque::new()),
            max_dying: max_dying.max(1),
            write_lock: Mutex::new(()),
            bus,
        }
    }

    /// Appends an instance to the active set. When `is_default`, atomically
    /// swaps the default pointer and returns the previous default; the caller
    /// decides whether to retire it.
    pub fn add(&self, instance: Arc<ModuleInstance>, is_default: bool) -> Option<Arc<ModuleInstance>> {
        let _w = self.write_lock.lock();
        let mut list = Vec::clone(&self.active.load());
        list.push(Arc::clone(&instance));
        self.active.store(Arc::new(list));
        if is_default {
            self.default_instance.swap(Some(instance))
        } else {
            None
        }
    }

    /// Atomically retires an instance: marks it dying, removes it from the
    /// active set (no-op if already absent) and enqueues it for draining.
    pub fn move_to_dying(&self, instance: &Arc<ModuleInstance>) {
        {
            let _w = self.write_lock.lock();
            instance.mark_dying();
            let list: Vec<_> = self
                .active
                .load()
                .iter()
                .filter(|i| !Arc::ptr_eq(i, instance))
                .cloned()
                .collect();
            self.active.store(Arc::new(list));
            let clear_default = self
                .default_instance
                .load()
                .as_ref()
                .is_some_and(|d| Arc::ptr_eq(d, instance));
            if clear_default {
                self.default_instance.store(None);
            }
            self.dying.lock().push_back(Arc::clone(instance));
        }
        // Fan-out happens outside the write lock; handlers may be slow.
        self.bus.publish(&RuntimeEvent::InstanceDying {
            module: self.module.clone(),
            version: instance.version().clone(),
            instance: Arc::clone(instance),
        });
    }

    #[must_use]
    pub fn get_default(&self) -> Option<Arc<ModuleInstance>> {
        self.default_instance.load_full()
    }

    /// Lock-free snapshot of the active set.
    #[must_use]
    pub fn active_instances(&self) -> Arc<Vec<Arc<ModuleInstance>>> {
        self.active.load_full()
    }

    /// Backpressure point: refuses new versions while too many superseded
    /// instances are still draining.
    #[must_use]
    pub fn can_add(&self) -> bool {
        self.dying.lock().len() < self.max_dying
    }

    /// Whether any active instance can serve a call right now.
    #[must_use]
    pub fn has_available(&self) -> bool {
        self.active
            .load()
            .iter()
            .any(|i| i.is_ready() && !i.is_dying())
    }

    #[must_use]
    pub fn dying_count(&self) -> usize {
        self.dying.lock().len()
    }

    /// Pulls the idle instances out of the dying queue, keeping busy ones.
    /// The caller destroys the returned instances.
    #[must_use]
    pub fn drain_idle_dying(&self) -> Vec<Arc<ModuleInstance>> {
        let mut dying = self.dying.lock();
        let mut idle = Vec::new();
        dying.retain(|i| {
            if i.is_idle() {
                idle.push(Arc::clone(i));
                false
            } else {
                true
            }
        });
        idle
    }

    /// Drains the whole dying queue regardless of idleness (shutdown
    /// escalation).
    #[must_use]
    pub fn drain_dying_all(&self) -> Vec<Arc<ModuleInstance>> {
        self.dying.lock().drain(..).collect()
    }

    /// Clears the default pointer and retires every active instance.
    /// Returns the instances that were moved to the dying queue.
    pub fn shutdown(&self) -> Vec<Arc<ModuleInstance>> {
        let moved: Vec<_> = {
            let _w = self.write_lock.lock();
            self.default_instance.store(None);
            let list = self.active.swap(Arc::new(Vec::new()));
            let mut dying = self.dying.lock();
            for instance in list.iter() {
                instance.mark_dying();
                dying.push_back(Arc::clone(instance));
            }
            list.iter().cloned().collect()
        };
        for instance in &moved {
            self.bus.publish(&RuntimeEvent::InstanceDying {
                module: self.module.clone(),
                version: instance.version().clone(),
                instance: Arc::clone(instance),
            });
        }
        moved
    }

    /// Active and dying sets both empty.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.active.load().is_empty() && self.dying.lock().is_empty()
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("module", &self.module)
            .field("active", &self.active.load().len())
            .field("dying", &self.dying_count())
            .field("has_default", &self.get_default().is_some())
            .finish()
    }
}
