//! Instance lifecycle transitions for one module.
//!
//! The lifecycle manager owns the single writer lock for a module's instance
//! transitions. Container start/stop runs outside the lock; the lock guards
//! only pool pointer manipulation. Idle cleanup is a background best-effort
//! activity and never contends with a writer.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::PluginContext;
use crate::contracts::LifecycleHook;
use crate::domain::ModuleId;
use crate::errors::{GovError, GovResult};
use crate::events::{EventBus, RuntimeEvent};
use crate::instance::ModuleInstance;
use crate::pool::InstancePool;

pub struct LifecycleManager {
    module: ModuleId,
    pool: Arc<InstancePool>,
    bus: Arc<EventBus>,
    hooks: Arc<[Arc<dyn LifecycleHook>]>,
    writer: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
    force_cleanup_delay: Duration,
    cancel: CancellationToken,
    this: Weak<Self>,
}

impl LifecycleManager {
    #[must_use]
    pub fn new(
        module: ModuleId,
        pool: Arc<InstancePool>,
        bus: Arc<EventBus>,
        hooks: Arc<[Arc<dyn LifecycleHook>]>,
        force_cleanup_delay: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            module,
            pool,
            bus,
            hooks,
            writer: tokio::sync::Mutex::new(()),
            shutdown: AtomicBool::new(false),
            force_cleanup_delay,
            cancel,
            this: Weak::clone(this),
        })
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Starts and publishes a new instance, optionally making it the default
    /// (blue/green swap). The superseded default is moved to the dying queue
    /// and drains its in-flight calls.
    ///
    /// # Errors
    /// `LIFECYCLE_ERROR` when already shut down or the container fails to
    /// start; `RESOURCE_EXHAUSTED` while too many old versions are draining.
    pub async fn add_instance(
        &self,
        instance: Arc<ModuleInstance>,
        ctx: &PluginContext,
        is_default: bool,
    ) -> GovResult<()> {
        if self.is_shutdown() {
            return Err(GovError::Lifecycle {
                module: self.module.clone(),
                source: anyhow::anyhow!("module runtime is shut down"),
            });
        }
        // Early backpressure, re-checked under the lock after the
        // (unlocked, potentially slow) container start.
        if !self.pool.can_add() {
            return Err(self.backpressure_error());
        }

        let upgrading = is_default && self.pool.get_default().is_some();
        if upgrading {
            self.bus.publish(&RuntimeEvent::InstanceUpgrading {
                module: self.module.clone(),
                new_version: instance.version().clone(),
            });
        } else {
            self.bus.publish(&RuntimeEvent::InstanceStarting {
                module: self.module.clone(),
                version: instance.version().clone(),
            });
        }

        if let Err(source) = instance.container().start(ctx).await {
            tracing::warn!(module = %self.module, version = %instance.version(), error = %source,
                "container start failed; destroying instance");
            self.destroy_instance(&instance).await;
            return Err(GovError::Lifecycle {
                module: self.module.clone(),
                source,
            });
        }
        instance.mark_ready();

        {
            let _w = self.writer.lock().await;
            if !self.pool.can_add() {
                self.destroy_instance(&instance).await;
                return Err(self.backpressure_error());
            }
            if is_default && !instance.is_ready() {
                self.destroy_instance(&instance).await;
                return Err(GovError::Lifecycle {
                    module: self.module.clone(),
                    source: anyhow::anyhow!("instance not ready after start"),
                });
            }
            let previous_default = self.pool.add(Arc::clone(&instance), is_default);
            self.bus.publish(&RuntimeEvent::InstanceReady {
                module: self.module.clone(),
                version: instance.version().clone(),
                instance: Arc::clone(&instance),
            });
            if let Some(old) = previous_default {
                if !Arc::ptr_eq(&old, &instance) {
                    tracing::info!(module = %self.module, old = %old.version(), new = %instance.version(),
                        "default instance swapped; draining old version");
                    self.pool.move_to_dying(&old);
                }
            }
        }

        self.bus.publish(&RuntimeEvent::InstanceStarted {
            module: self.module.clone(),
            version: instance.version().clone(),
        });
        Ok(())
    }

    fn backpressure_error(&self) -> GovError {
        GovError::ResourceExhausted(format!(
            "module '{}' has {} draining instances pending",
            self.module,
            self.pool.dying_count()
        ))
    }

    /// One cleanup tick: destroys idle dying instances. Skips the tick
    /// entirely when a writer holds the lock.
    pub async fn cleanup_idle(&self) -> usize {
        let Ok(_w) = self.writer.try_lock() else {
            return 0;
        };
        self.cleanup_idle_locked().await
    }

    async fn cleanup_idle_locked(&self) -> usize {
        let idle = self.pool.drain_idle_dying();
        let count = idle.len();
        for instance in &idle {
            self.destroy_instance(instance).await;
        }
        if count > 0 {
            tracing::debug!(module = %self.module, destroyed = count, "idle instances cleaned up");
        }
        count
    }

    /// Destroys every dying instance regardless of in-flight work.
    pub async fn force_cleanup_all(&self) {
        let doomed = self.pool.drain_dying_all();
        if doomed.is_empty() {
            return;
        }
        tracing::warn!(module = %self.module, count = doomed.len(),
            "force-destroying dying instances that did not drain");
        for instance in &doomed {
            self.destroy_instance(instance).await;
        }
    }

    /// Retires every instance and schedules the force-cleanup escalation.
    /// Second and later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _w = self.writer.lock().await;
            self.bus.publish(&RuntimeEvent::RuntimeShuttingDown {
                module: self.module.clone(),
            });
            let moved = self.pool.shutdown();
            tracing::info!(module = %self.module, retired = moved.len(), "module runtime shutting down");
            let _ = self.cleanup_idle_locked().await;
        }

        if !self.pool.is_drained() {
            if self.cancel.is_cancelled() {
                // Scheduler already closed: escalate on the calling task.
                self.force_cleanup_all().await;
            } else {
                let weak = Weak::clone(&self.this);
                let delay = self.force_cleanup_delay;
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {}
                    }
                    if let Some(manager) = weak.upgrade() {
                        manager.force_cleanup_all().await;
                    }
                });
            }
        }

        self.bus.publish(&RuntimeEvent::RuntimeShutdown {
            module: self.module.clone(),
        });
    }

    /// Spawns the periodic idle-cleanup tick. The task stops when the
    /// runtime is dropped or the token fires; losing a tick is acceptable.
    pub fn start_periodic_cleanup(&self, every: Duration) {
        let weak = Weak::clone(&self.this);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                if manager.is_shutdown() {
                    break;
                }
                let _ = manager.cleanup_idle().await;
            }
        });
    }

    /// Tears one instance down, firing the stop hooks around it. Failures
    /// are logged and never abort the surrounding cleanup loop.
    pub async fn destroy_instance(&self, instance: &Arc<ModuleInstance>) {
        if instance.is_destroyed() {
            return;
        }
        for hook in self.hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook.before_instance_stop(instance))).is_err() {
                tracing::warn!(module = %self.module, "pre-stop hook panicked; continuing");
            }
        }
        instance.destroy().await;
        self.bus.publish(&RuntimeEvent::InstanceDestroyed {
            module: self.module.clone(),
            version: instance.version().clone(),
        });
        for hook in self.hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook.after_instance_stop(instance))).is_err() {
                tracing::warn!(module = %self.module, "post-stop hook panicked; continuing");
            }
        }
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("module", &self.module)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
