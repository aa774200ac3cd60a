//! Top-level coordinator: the registry of module runtimes, the global
//! service route table, interface routing and install/uninstall/reload.
//!
//! Install and uninstall for the same module id are serialized by a per-id
//! lock; operations on different ids run independently. A failure while
//! stopping one module never prevents other modules from operating.

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditManager, AuditSink, LogAuditSink};
use crate::config::GovConfig;
use crate::context::{InvocationContext, PluginContext};
use crate::contracts::{
    AllowAllPermissions, ContainerFactory, ContextPropagator, LifecycleHook, ModuleLoader,
    NonTransactional, PermissionService, SecurityVerifier, TransactionVerifier,
};
use crate::domain::{
    Labels, ModuleDefinition, ModuleId, ModuleInfo, ModuleSource, ServiceId, Version,
};
use crate::errors::{GovError, GovResult};
use crate::instance::ModuleInstance;
use crate::kernel::GovernanceKernel;
use crate::registry::{ServiceArgs, ServiceHandler, ServiceMethod, TypeKey};
use crate::routing::{LabelScoreRouter, TrafficRouter};
use crate::runtime::ModuleRuntime;

/// Builder for [`ModuleManager`]. Loader and container factory are required;
/// everything else has a permissive default.
pub struct ModuleManagerBuilder {
    config: GovConfig,
    loader: Option<Arc<dyn ModuleLoader>>,
    containers: Option<Arc<dyn ContainerFactory>>,
    permissions: Arc<dyn PermissionService>,
    router: Arc<dyn TrafficRouter>,
    tx_verifier: Arc<dyn TransactionVerifier>,
    security: Vec<Arc<dyn SecurityVerifier>>,
    propagators: Vec<Arc<dyn ContextPropagator>>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
    audit_sink: Arc<dyn AuditSink>,
}

impl ModuleManagerBuilder {
    #[must_use]
    pub fn with_config(mut self, config: GovConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[must_use]
    pub fn with_container_factory(mut self, containers: Arc<dyn ContainerFactory>) -> Self {
        self.containers = Some(containers);
        self
    }

    #[must_use]
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionService>) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub fn with_router(mut self, router: Arc<dyn TrafficRouter>) -> Self {
        self.router = router;
        self
    }

    #[must_use]
    pub fn with_transaction_verifier(mut self, verifier: Arc<dyn TransactionVerifier>) -> Self {
        self.tx_verifier = verifier;
        self
    }

    #[must_use]
    pub fn add_security_verifier(mut self, verifier: Arc<dyn SecurityVerifier>) -> Self {
        self.security.push(verifier);
        self
    }

    #[must_use]
    pub fn add_propagator(mut self, propagator: Arc<dyn ContextPropagator>) -> Self {
        self.propagators.push(propagator);
        self
    }

    #[must_use]
    pub fn add_lifecycle_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    /// Builds the manager and spawns its audit recorder. Must be called on a
    /// tokio runtime.
    ///
    /// # Errors
    /// `INVALID_ARGUMENT` when the loader or container factory is missing.
    pub fn build(self) -> GovResult<Arc<ModuleManager>> {
        let loader = self
            .loader
            .ok_or_else(|| GovError::InvalidArgument("module loader is required".to_owned()))?;
        let containers = self.containers.ok_or_else(|| {
            GovError::InvalidArgument("container factory is required".to_owned())
        })?;
        let audit = Arc::new(AuditManager::new(self.audit_sink));
        let kernel = GovernanceKernel::new(Arc::clone(&self.permissions), Arc::clone(&audit));
        Ok(Arc::new_cyclic(|this| ModuleManager {
            config: self.config,
            runtimes: DashMap::new(),
            protocol_index: DashMap::new(),
            interface_cache: DashMap::new(),
            sources: DashMap::new(),
            install_locks: DashMap::new(),
            loader,
            containers,
            permissions: self.permissions,
            router: self.router,
            tx_verifier: self.tx_verifier,
            security: self.security,
            propagators: Arc::from(self.propagators),
            hooks: Arc::from(self.hooks),
            audit,
            kernel,
            cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
            this: Weak::clone(this),
        }))
    }
}

pub struct ModuleManager {
    config: GovConfig,
    runtimes: DashMap<ModuleId, Arc<ModuleRuntime>>,
    protocol_index: DashMap<ServiceId, ModuleId>,
    interface_cache: DashMap<TypeKey, ModuleId>,
    sources: DashMap<ModuleId, ModuleSource>,
    install_locks: DashMap<ModuleId, Arc<tokio::sync::Mutex<()>>>,
    loader: Arc<dyn ModuleLoader>,
    containers: Arc<dyn ContainerFactory>,
    permissions: Arc<dyn PermissionService>,
    router: Arc<dyn TrafficRouter>,
    tx_verifier: Arc<dyn TransactionVerifier>,
    security: Vec<Arc<dyn SecurityVerifier>>,
    propagators: Arc<[Arc<dyn ContextPropagator>]>,
    hooks: Arc<[Arc<dyn LifecycleHook>]>,
    audit: Arc<AuditManager>,
    kernel: GovernanceKernel,
    cancel: CancellationToken,
    shutdown: AtomicBool,
    this: Weak<Self>,
}

impl ModuleManager {
    #[must_use]
    pub fn builder() -> ModuleManagerBuilder {
        ModuleManagerBuilder {
            config: GovConfig::default(),
            loader: None,
            containers: None,
            permissions: Arc::new(AllowAllPermissions),
            router: Arc::new(LabelScoreRouter),
            tx_verifier: Arc::new(NonTransactional),
            security: Vec::new(),
            propagators: Vec::new(),
            hooks: Vec::new(),
            audit_sink: Arc::new(LogAuditSink),
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn permission_service(&self) -> Arc<dyn PermissionService> {
        Arc::clone(&self.permissions)
    }

    #[must_use]
    pub fn audit_manager(&self) -> &Arc<AuditManager> {
        &self.audit
    }

    #[must_use]
    pub fn runtime(&self, id: &ModuleId) -> Option<Arc<ModuleRuntime>> {
        self.runtimes.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshots of all installed modules.
    #[must_use]
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut infos: Vec<ModuleInfo> =
            self.runtimes.iter().map(|e| e.value().info()).collect();
        infos.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        infos
    }

    #[must_use]
    pub fn module_info(&self, id: &ModuleId) -> Option<ModuleInfo> {
        self.runtime(id).map(|r| r.info())
    }

    fn install_lock(&self, id: &ModuleId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            &self
                .install_locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn purge_interface_cache(&self, id: &ModuleId) {
        self.interface_cache.retain(|_, module| module != id);
    }

    /// Installs a module version as the new default (blue/green swap when
    /// one is already running).
    ///
    /// # Errors
    /// `SECURITY_VIOLATION` from a verifier, `LIFECYCLE_ERROR` on loader or
    /// container failure, `RESOURCE_EXHAUSTED` while old versions drain.
    pub async fn install(
        &self,
        definition: ModuleDefinition,
        source: ModuleSource,
    ) -> GovResult<()> {
        self.install_inner(definition, source, true).await
    }

    /// Installs from an exploded development directory.
    ///
    /// # Errors
    /// See [`Self::install`].
    pub async fn install_dev(
        &self,
        definition: ModuleDefinition,
        source_dir: impl Into<std::path::PathBuf>,
    ) -> GovResult<()> {
        self.install_inner(definition, ModuleSource::directory(source_dir.into()), true)
            .await
    }

    /// Deploys a non-default instance carrying the given labels for the
    /// traffic router.
    ///
    /// # Errors
    /// See [`Self::install`].
    pub async fn deploy_canary(
        &self,
        definition: ModuleDefinition,
        mut source: ModuleSource,
        labels: Labels,
    ) -> GovResult<()> {
        source.labels.extend(labels);
        self.install_inner(definition, source, false).await
    }

    async fn install_inner(
        &self,
        definition: ModuleDefinition,
        source: ModuleSource,
        is_default: bool,
    ) -> GovResult<()> {
        if self.is_shutdown() {
            return Err(GovError::Lifecycle {
                module: definition.id.clone(),
                source: anyhow::anyhow!("module manager is shut down"),
            });
        }
        let id = definition.id.clone();
        let serial = self.install_lock(&id);
        let _serial = serial.lock().await;

        self.sources.insert(id.clone(), source.clone());

        for verifier in &self.security {
            verifier
                .verify(&id, &source)
                .map_err(|source| GovError::SecurityViolation {
                    module: id.clone(),
                    source,
                })?;
        }

        let existed = self.runtimes.contains_key(&id);
        if existed {
            // The module's interface set may change across the upgrade.
            self.purge_interface_cache(&id);
        }

        let handle =
            self.loader
                .create(&id, &source, None)
                .map_err(|source| GovError::Lifecycle {
                    module: id.clone(),
                    source,
                })?;
        let container = match self.containers.create(&id, &source, Arc::clone(&handle)) {
            Ok(container) => container,
            Err(source) => {
                handle.close();
                return Err(GovError::Lifecycle {
                    module: id.clone(),
                    source,
                });
            }
        };

        let definition = Arc::new(definition);
        let instance = ModuleInstance::new(
            definition.version.clone(),
            source.labels.clone(),
            container,
            Arc::clone(&definition),
        );

        for hook in self.hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook.before_install(&id))).is_err() {
                tracing::warn!(module = %id, "install hook panicked; continuing");
            }
        }

        let runtime = Arc::clone(
            &self.runtimes.entry(id.clone()).or_insert_with(|| {
                ModuleRuntime::new(
                    id.clone(),
                    &self.config,
                    Arc::clone(&self.router),
                    Arc::clone(&self.tx_verifier),
                    Arc::clone(&self.propagators),
                    Arc::clone(&self.hooks),
                    &self.cancel,
                )
            }),
        );
        let ctx = PluginContext::new(
            id.clone(),
            Arc::clone(&definition),
            Weak::clone(&self.this),
            Arc::downgrade(&runtime),
        );

        match runtime.add_instance(instance, &ctx, is_default).await {
            Ok(()) => {
                for hook in self.hooks.iter() {
                    if catch_unwind(AssertUnwindSafe(|| hook.after_install(&id))).is_err() {
                        tracing::warn!(module = %id, "install hook panicked; continuing");
                    }
                }
                tracing::info!(module = %id, version = %definition.version, default = is_default,
                    "module instance installed");
                Ok(())
            }
            Err(err) => {
                // The lifecycle manager already destroyed the failed
                // instance; finish the rollback so no half-built state leaks.
                handle.close();
                if !existed {
                    if let Some((_, runtime)) = self.runtimes.remove(&id) {
                        runtime.shutdown().await;
                    }
                    self.protocol_index.retain(|_, module| module != &id);
                    self.purge_interface_cache(&id);
                }
                tracing::warn!(module = %id, error = %err, "install failed and was rolled back");
                Err(err)
            }
        }
    }

    /// Reinstalls a module from its remembered source under a fabricated
    /// reload version. Missing source or runtime logs and returns.
    ///
    /// # Errors
    /// See [`Self::install`].
    pub async fn reload(&self, id: &ModuleId) -> GovResult<()> {
        let Some(source) = self.sources.get(id).map(|e| e.value().clone()) else {
            tracing::warn!(module = %id, "no source registered; reload skipped");
            return Ok(());
        };
        let Some(default) = self.runtime(id).and_then(|r| r.pool().get_default()) else {
            tracing::warn!(module = %id, "no running default instance; reload skipped");
            return Ok(());
        };
        // Work on a copy so outside holders of the definition are untouched.
        let mut definition = ModuleDefinition::clone(default.definition());
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        definition.version = Version::new(format!("reload-{epoch_ms}"))?;
        self.install_inner(definition, source, true).await
    }

    /// Uninstalls a module: retires its runtime and purges every global
    /// index entry pointing at it. Unknown ids are a logged no-op.
    ///
    /// # Errors
    /// A `before_uninstall` hook may veto, aborting before teardown.
    pub async fn uninstall(&self, id: &ModuleId) -> GovResult<()> {
        let serial = self.install_lock(id);
        let _serial = serial.lock().await;

        for hook in self.hooks.iter() {
            hook.before_uninstall(id)
                .map_err(|source| GovError::Lifecycle {
                    module: id.clone(),
                    source,
                })?;
        }

        let Some((_, runtime)) = self.runtimes.remove(id) else {
            tracing::warn!(module = %id, "uninstall of unknown module ignored");
            return Ok(());
        };
        self.purge_interface_cache(id);
        runtime.shutdown().await;
        self.protocol_index.retain(|_, module| module != id);
        self.permissions.remove_module(id);

        for hook in self.hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook.after_uninstall(id))).is_err() {
                tracing::warn!(module = %id, "uninstall hook panicked; continuing");
            }
        }
        tracing::info!(module = %id, "module uninstalled");
        Ok(())
    }

    /// Registers a service endpoint in the global route table and the
    /// owning module's registry. A conflicting owner is overwritten with a
    /// warning (last write wins).
    ///
    /// # Errors
    /// Fails when the module has no runtime or the id is invalid.
    pub fn register_protocol_service(
        &self,
        module: &ModuleId,
        sid: ServiceId,
        bean: Arc<dyn std::any::Any + Send + Sync>,
        method: ServiceMethod,
        handler: ServiceHandler,
    ) -> GovResult<bool> {
        let Some(runtime) = self.runtime(module) else {
            return Err(GovError::ServiceUnavailable(format!(
                "module '{module}' has no runtime"
            )));
        };
        if let Some(previous) = self.protocol_index.get(&sid) {
            if previous.value() != module {
                tracing::warn!(
                    service = %sid,
                    previous = %previous.value(),
                    new = %module,
                    "protocol service conflict; overwriting route"
                );
            }
        }
        self.protocol_index.insert(sid.clone(), module.clone());
        runtime.services().register(sid, bean, method, handler)
    }

    /// Invokes a service by id through the governance kernel.
    ///
    /// `Ok(None)` means the id is not routable (unknown service, missing
    /// runtime or binding); governance and execution failures propagate.
    ///
    /// # Errors
    /// `PERMISSION_DENIED`, plus the runtime invocation taxonomy.
    pub async fn invoke_service(
        &self,
        caller: &ModuleId,
        service: &ServiceId,
        args: ServiceArgs,
    ) -> GovResult<Option<serde_json::Value>> {
        self.invoke_service_labeled(caller, service, args, &Labels::new())
            .await
    }

    /// Labeled variant of [`Self::invoke_service`]; labels steer the
    /// traffic router (canary selection).
    ///
    /// # Errors
    /// See [`Self::invoke_service`].
    pub async fn invoke_service_labeled(
        &self,
        caller: &ModuleId,
        service: &ServiceId,
        args: ServiceArgs,
        labels: &Labels,
    ) -> GovResult<Option<serde_json::Value>> {
        let Some(module) = self.protocol_index.get(service).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let Some(runtime) = self.runtime(&module) else {
            return Ok(None);
        };
        if runtime.services().get(service).is_none() {
            return Ok(None);
        }
        let ctx = InvocationContext::host_invoke(caller.clone(), module, service);
        let digest = AuditManager::digest_args(&args);
        let value = self
            .kernel
            .invoke(
                &ctx,
                digest,
                runtime.invoke_labeled(caller, service, args, labels),
            )
            .await?;
        Ok(Some(value))
    }

    /// Resolves the interface `T` to the module currently implementing it.
    ///
    /// Consults the interface cache first; on miss, scans all runtimes and
    /// breaks ties deterministically by lexicographic module id.
    ///
    /// # Errors
    /// `SERVICE_NOT_FOUND` when no installed module exposes `T`.
    pub fn get_service<T>(&self, caller: &ModuleId) -> GovResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = TypeKey::of::<T>();
        if let Some(cached) = self.interface_cache.get(&key).map(|e| e.value().clone()) {
            if let Some(runtime) = self.runtime(&cached) {
                if let Ok(proxy) = runtime.get_service_proxy::<T>(caller) {
                    return Ok(proxy);
                }
            }
            // Stale entry; drop it and fall through to a fresh scan.
            self.interface_cache.remove(&key);
        }

        let module = self.scan_for_interface(&key, caller)?;
        let runtime = self.runtime(&module).ok_or_else(|| {
            GovError::ServiceNotFound(format!("no implementation of {}", key.name()))
        })?;
        runtime.get_service_proxy::<T>(caller)
    }

    fn scan_for_interface(&self, key: &TypeKey, caller: &ModuleId) -> GovResult<ModuleId> {
        let mut candidates: Vec<ModuleId> = self
            .runtimes
            .iter()
            .filter(|e| e.value().services().has_client_key(key))
            .map(|e| e.key().clone())
            .collect();
        if candidates.is_empty() {
            return Err(GovError::ServiceNotFound(format!(
                "no implementation of {}",
                key.name()
            )));
        }
        candidates.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        if candidates.len() > 1 {
            tracing::warn!(
                interface = key.name(),
                caller = %caller,
                candidates = ?candidates,
                "multiple modules implement interface; picking lexicographic first"
            );
        }
        let chosen = candidates.swap_remove(0);
        self.interface_cache.insert(key.clone(), chosen.clone());
        Ok(chosen)
    }

    /// Creates a lazy-binding handle for interface `T`. The handle is
    /// creatable even when no module currently implements `T`; each
    /// [`LazyService::resolve`] re-runs target resolution.
    #[must_use]
    pub fn get_global_service_proxy<T>(
        &self,
        caller: &ModuleId,
        preferred: Option<ModuleId>,
    ) -> LazyService<T>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        LazyService {
            manager: Weak::clone(&self.this),
            caller: caller.clone(),
            preferred,
            _interface: PhantomData,
        }
    }

    /// Stops everything: retires every runtime (failures logged, never
    /// propagated), waits for in-flight work to drain up to the configured
    /// bound, then force-destroys what is left and clears all indexes.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(modules = self.runtimes.len(), "module manager shutting down");

        let snapshot: Vec<Arc<ModuleRuntime>> = self
            .runtimes
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for runtime in &snapshot {
            runtime.shutdown().await;
        }

        let deadline = Instant::now() + self.config.shutdown_timeout();
        while Instant::now() < deadline && snapshot.iter().any(|r| !r.pool().is_drained()) {
            for runtime in &snapshot {
                let _ = runtime.lifecycle().cleanup_idle().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        self.cancel.cancel();
        for runtime in &snapshot {
            runtime.lifecycle().force_cleanup_all().await;
        }

        self.runtimes.clear();
        self.protocol_index.clear();
        self.interface_cache.clear();
        self.sources.clear();
        tracing::info!("module manager shut down");
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.runtimes.len())
            .field("services", &self.protocol_index.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Lazy-binding handle to an interface implementation.
///
/// Resolution order per call: the preferred module if it exposes the
/// interface, then the interface cache, then a full scan with lexicographic
/// tie-break.
pub struct LazyService<T: ?Sized> {
    manager: Weak<ModuleManager>,
    caller: ModuleId,
    preferred: Option<ModuleId>,
    _interface: PhantomData<fn() -> Arc<T>>,
}

impl<T> LazyService<T>
where
    T: ?Sized + Send + Sync + 'static,
{
    /// Resolves the current implementation.
    ///
    /// # Errors
    /// `SERVICE_NOT_FOUND` when nothing implements `T` right now;
    /// `SERVICE_UNAVAILABLE` when the manager is gone.
    pub fn resolve(&self) -> GovResult<Arc<T>> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| GovError::ServiceUnavailable("module manager is gone".to_owned()))?;
        if let Some(preferred) = &self.preferred {
            if let Some(runtime) = manager.runtime(preferred) {
                if let Some(client) = runtime.services().client::<T>() {
                    return Ok(client);
                }
            }
        }
        manager.get_service::<T>(&self.caller)
    }
}

impl<T: ?Sized> Clone for LazyService<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Weak::clone(&self.manager),
            caller: self.caller.clone(),
            preferred: self.preferred.clone(),
            _interface: PhantomData,
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for LazyService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyService")
            .field("interface", &std::any::type_name::<T>())
            .field("preferred", &self.preferred)
            .finish()
    }
}
