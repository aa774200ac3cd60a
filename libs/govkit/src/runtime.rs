//! Composition root for one installed module.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::GovConfig;
use crate::context::{InvocationContext, PluginContext};
use crate::contracts::{ContextPropagator, LifecycleHook, TransactionVerifier};
use crate::domain::{Labels, ModuleId, ModuleInfo, ModuleStatus, StatusCell, TrafficStats, Version};
use crate::errors::{GovError, GovResult};
use crate::events::EventBus;
use crate::executor::InvocationExecutor;
use crate::instance::ModuleInstance;
use crate::lifecycle::LifecycleManager;
use crate::pool::InstancePool;
use crate::registry::{ServiceArgs, ServiceRegistry};
use crate::routing::TrafficRouter;

/// One module's runtime: pool, registry, executor, lifecycle and event bus,
/// plus the status machine and traffic counters.
pub struct ModuleRuntime {
    id: ModuleId,
    status: StatusCell,
    bus: Arc<EventBus>,
    pool: Arc<InstancePool>,
    services: Arc<ServiceRegistry>,
    executor: Arc<InvocationExecutor>,
    lifecycle: Arc<LifecycleManager>,
    router: Arc<dyn TrafficRouter>,
    total_requests: AtomicU64,
    stable_requests: AtomicU64,
    canary_requests: AtomicU64,
    window_started: Mutex<SystemTime>,
    installed_at: SystemTime,
}

impl ModuleRuntime {
    #[must_use]
    pub fn new(
        id: ModuleId,
        config: &GovConfig,
        router: Arc<dyn TrafficRouter>,
        verifier: Arc<dyn TransactionVerifier>,
        propagators: Arc<[Arc<dyn ContextPropagator>]>,
        hooks: Arc<[Arc<dyn LifecycleHook>]>,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let pool = Arc::new(InstancePool::new(
            id.clone(),
            config.max_dying,
            Arc::clone(&bus),
        ));
        let services = ServiceRegistry::new(id.clone());
        services.subscribe_to(&bus);
        let executor = Arc::new(InvocationExecutor::new(
            id.clone(),
            config,
            verifier,
            propagators,
            Some(Arc::clone(&bus)),
        ));
        let lifecycle = LifecycleManager::new(
            id.clone(),
            Arc::clone(&pool),
            Arc::clone(&bus),
            hooks,
            config.force_cleanup_delay(),
            cancel.child_token(),
        );
        lifecycle.start_periodic_cleanup(config.idle_check_interval());

        let now = SystemTime::now();
        Arc::new(Self {
            id,
            status: StatusCell::new(ModuleStatus::Loaded),
            bus,
            pool,
            services,
            executor,
            lifecycle,
            router,
            total_requests: AtomicU64::new(0),
            stable_requests: AtomicU64::new(0),
            canary_requests: AtomicU64::new(0),
            window_started: Mutex::new(now),
            installed_at: now,
        })
    }

    #[must_use]
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    #[must_use]
    pub fn status(&self) -> ModuleStatus {
        self.status.get()
    }

    #[must_use]
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<InvocationExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Adds a new instance via the lifecycle manager and activates the
    /// runtime once it has a servable instance.
    ///
    /// # Errors
    /// Propagates lifecycle failures and dying-queue backpressure.
    pub async fn add_instance(
        &self,
        instance: Arc<ModuleInstance>,
        ctx: &PluginContext,
        is_default: bool,
    ) -> GovResult<()> {
        if self.status.get() == ModuleStatus::Shutdown {
            return Err(GovError::Lifecycle {
                module: self.id.clone(),
                source: anyhow::anyhow!("module runtime is shut down"),
            });
        }
        self.lifecycle.add_instance(instance, ctx, is_default).await?;
        let _ = self.activate();
        Ok(())
    }

    /// `LOADED -> ACTIVE`, guarded by instance availability.
    pub fn activate(&self) -> bool {
        self.pool.has_available() && self.status.transition(ModuleStatus::Loaded, ModuleStatus::Active)
    }

    /// `ACTIVE -> LOADED`.
    pub fn deactivate(&self) -> bool {
        self.status.transition(ModuleStatus::Active, ModuleStatus::Loaded)
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status.get() == ModuleStatus::Active && self.pool.has_available()
    }

    /// Selects the instance serving `resource_id`: the traffic router may
    /// override, otherwise the default instance serves.
    ///
    /// # Errors
    /// `SERVICE_UNAVAILABLE` when no servable instance exists.
    pub fn route_to_available_instance(
        &self,
        resource_id: &str,
        labels: &Labels,
    ) -> GovResult<Arc<ModuleInstance>> {
        let ctx = InvocationContext::route_probe(self.id.clone(), resource_id, labels.clone());
        let snapshot = self.pool.active_instances();
        let instance = self
            .router
            .route(&snapshot, &ctx)
            .or_else(|| self.pool.get_default())
            .ok_or_else(|| {
                GovError::ServiceUnavailable(format!("module '{}' has no instance", self.id))
            })?;
        if !instance.is_ready() || instance.is_dying() || !instance.container().is_active() {
            return Err(GovError::ServiceUnavailable(format!(
                "instance {} of module '{}' cannot serve",
                instance.version(),
                self.id
            )));
        }
        Ok(instance)
    }

    /// Invokes a service on this module with default routing.
    ///
    /// # Errors
    /// See [`Self::invoke_labeled`].
    pub async fn invoke(
        &self,
        caller: &ModuleId,
        service: &crate::domain::ServiceId,
        args: ServiceArgs,
    ) -> GovResult<serde_json::Value> {
        self.invoke_labeled(caller, service, args, &Labels::new()).await
    }

    /// Invokes a service, feeding request labels to the traffic router
    /// (canary selection).
    ///
    /// # Errors
    /// `SERVICE_UNAVAILABLE` unless the runtime is active with a servable
    /// instance, `SERVICE_NOT_FOUND` for an unknown id, plus the executor's
    /// failure taxonomy.
    pub async fn invoke_labeled(
        &self,
        caller: &ModuleId,
        service: &crate::domain::ServiceId,
        args: ServiceArgs,
        labels: &Labels,
    ) -> GovResult<serde_json::Value> {
        if self.status.get() != ModuleStatus::Active {
            return Err(GovError::ServiceUnavailable(format!(
                "module '{}' is not active",
                self.id
            )));
        }
        let instance = self.route_to_available_instance(service.as_str(), labels)?;

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let is_stable = self
            .pool
            .get_default()
            .is_some_and(|d| Arc::ptr_eq(&d, &instance));
        if is_stable {
            self.stable_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.canary_requests.fetch_add(1, Ordering::Relaxed);
        }

        let binding = self.services.get_required(service)?;
        self.executor
            .execute(&instance, &binding, args, caller, service)
            .await
    }

    /// Typed client exposed by this module.
    ///
    /// # Errors
    /// `SERVICE_NOT_FOUND` when the module does not expose `T`.
    pub fn client<T>(&self) -> GovResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.services.client::<T>().ok_or_else(|| {
            GovError::ServiceNotFound(format!(
                "module '{}' does not expose {}",
                self.id,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Memoized per-interface proxy. Resolved from the exposed clients on
    /// first use and invalidated when a new version starts.
    ///
    /// # Errors
    /// `SERVICE_NOT_FOUND` when the module does not expose `T`.
    pub fn get_service_proxy<T>(&self, caller: &ModuleId) -> GovResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        tracing::debug!(module = %self.id, caller = %caller,
            interface = std::any::type_name::<T>(), "resolving service proxy");
        let client = self.client::<T>()?;
        Ok(self.services.get_or_create_proxy(move || client))
    }

    /// Versions of all active instances, default first.
    #[must_use]
    pub fn versions(&self) -> Vec<Version> {
        let default = self.pool.get_default();
        let mut versions: Vec<Version> = Vec::new();
        if let Some(d) = &default {
            versions.push(d.version().clone());
        }
        for instance in self.pool.active_instances().iter() {
            if default.as_ref().is_none_or(|d| !Arc::ptr_eq(d, instance)) {
                versions.push(instance.version().clone());
            }
        }
        versions
    }

    /// First active non-default version, if any.
    #[must_use]
    pub fn canary_version(&self) -> Option<Version> {
        let default = self.pool.get_default();
        self.pool
            .active_instances()
            .iter()
            .find(|i| default.as_ref().is_none_or(|d| !Arc::ptr_eq(d, i)))
            .map(|i| i.version().clone())
    }

    #[must_use]
    pub fn traffic_stats(&self) -> TrafficStats {
        TrafficStats {
            total: self.total_requests.load(Ordering::Relaxed),
            stable: self.stable_requests.load(Ordering::Relaxed),
            canary: self.canary_requests.load(Ordering::Relaxed),
            window_started: *self.window_started.lock(),
        }
    }

    /// Zeroes the counters and opens a new measurement window.
    pub fn reset_traffic_stats(&self) {
        *self.window_started.lock() = SystemTime::now();
        self.total_requests.store(0, Ordering::Relaxed);
        self.stable_requests.store(0, Ordering::Relaxed);
        self.canary_requests.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id.clone(),
            status: self.status.get(),
            versions: self.versions(),
            default_version: self.pool.get_default().map(|i| i.version().clone()),
            canary_version: self.canary_version(),
            traffic: self.traffic_stats(),
            installed_at: self.installed_at,
        }
    }

    /// Retires all instances and clears the event bus. Idempotent.
    pub async fn shutdown(&self) {
        self.status.set(ModuleStatus::Shutdown);
        self.lifecycle.shutdown().await;
        self.bus.clear();
    }
}

impl std::fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .field("pool", &self.pool)
            .field("services", &self.services.count())
            .finish()
    }
}
