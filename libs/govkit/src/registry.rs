//! Per-module service registry.
//!
//! Maps fully qualified service ids to invokable bindings, holds the
//! interface implementations a module exposes to other modules, and memoizes
//! governed per-interface proxies. Lookups are lock-free in the common case;
//! proxy creation is single-flight.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};

use crate::domain::{ModuleId, ServiceId};
use crate::errors::{GovError, GovResult};
use crate::events::{EventBus, EventKind, Subscription};

/// Stable key for an interface type; works for `T = dyn Trait`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct TypeKey(&'static str);

impl TypeKey {
    #[inline]
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey(std::any::type_name::<T>())
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Descriptor of the method behind a binding, consumed by the transaction
/// verifier and diagnostics.
#[derive(Clone)]
pub struct ServiceMethod {
    name: Arc<str>,
    declaring_type: TypeKey,
}

impl ServiceMethod {
    /// # Errors
    /// Returns `GovError::InvalidArgument` when the method name is blank.
    pub fn new(name: impl AsRef<str>, declaring_type: TypeKey) -> GovResult<Self> {
        let name = name.as_ref();
        if name.trim().is_empty() {
            return Err(GovError::InvalidArgument(
                "service method name must not be blank".to_owned(),
            ));
        }
        Ok(Self {
            name: Arc::from(name),
            declaring_type,
        })
    }

    /// Descriptor for a method declared on `T`.
    ///
    /// # Errors
    /// Returns `GovError::InvalidArgument` when the method name is blank.
    pub fn of<T: ?Sized + 'static>(name: impl AsRef<str>) -> GovResult<Self> {
        Self::new(name, TypeKey::of::<T>())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn declaring_type(&self) -> &TypeKey {
        &self.declaring_type
    }
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type.0, self.name)
    }
}

/// Dynamic call arguments.
pub type ServiceArgs = Vec<serde_json::Value>;
/// Future returned by a service handler.
pub type ServiceFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;
/// Pre-bound dispatch closure: the bean is already baked in.
pub type ServiceHandler = Arc<dyn Fn(ServiceArgs) -> ServiceFuture + Send + Sync>;

/// Immutable invokable binding for one service id.
#[derive(Clone)]
pub struct ServiceBinding {
    bean: Arc<dyn Any + Send + Sync>,
    method: ServiceMethod,
    handler: ServiceHandler,
}

impl ServiceBinding {
    #[must_use]
    pub fn new(
        bean: Arc<dyn Any + Send + Sync>,
        method: ServiceMethod,
        handler: ServiceHandler,
    ) -> Self {
        Self {
            bean,
            method,
            handler,
        }
    }

    #[must_use]
    pub fn bean(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.bean
    }

    #[must_use]
    pub fn method(&self) -> &ServiceMethod {
        &self.method
    }

    /// Invokes the pre-bound handler.
    #[must_use]
    pub fn invoke(&self, args: ServiceArgs) -> ServiceFuture {
        (self.handler)(args)
    }

    #[must_use]
    pub fn handler(&self) -> ServiceHandler {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

type Boxed = Box<dyn Any + Send + Sync>;

pub struct ServiceRegistry {
    module: ModuleId,
    services: DashMap<ServiceId, ServiceBinding>,
    clients: RwLock<HashMap<TypeKey, Boxed>>,
    proxies: RwLock<HashMap<TypeKey, Boxed>>,
    proxy_init: Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
    this: Weak<Self>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new(module: ModuleId) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            module,
            services: DashMap::new(),
            clients: RwLock::new(HashMap::new()),
            proxies: RwLock::new(HashMap::new()),
            proxy_init: Mutex::new(()),
            subscriptions: Mutex::new(Vec::new()),
            this: Weak::clone(this),
        })
    }

    /// Wires cache invalidation to the module's event bus: proxies are
    /// cleared when a new version starts, everything on runtime shutdown.
    pub fn subscribe_to(&self, bus: &EventBus) {
        let on_upgrade = Weak::clone(&self.this);
        let upgrading = bus.subscribe(EventKind::InstanceUpgrading, move |_| {
            if let Some(registry) = Weak::upgrade(&on_upgrade) {
                registry.clear_proxies();
            }
        });
        let on_shutdown = Weak::clone(&self.this);
        let shutting_down = bus.subscribe(EventKind::RuntimeShuttingDown, move |_| {
            if let Some(registry) = Weak::upgrade(&on_shutdown) {
                registry.clear();
            }
        });
        self.subscriptions.lock().extend([upgrading, shutting_down]);
    }

    /// Registers a binding. Overwriting an existing id is allowed but logged;
    /// returns `false` on overwrite.
    ///
    /// # Errors
    /// Returns `GovError::InvalidArgument` when the id belongs to another module.
    pub fn register(
        &self,
        sid: ServiceId,
        bean: Arc<dyn Any + Send + Sync>,
        method: ServiceMethod,
        handler: ServiceHandler,
    ) -> GovResult<bool> {
        if sid.module_part() != self.module.as_str() {
            return Err(GovError::InvalidArgument(format!(
                "service id '{sid}' does not belong to module '{}'",
                self.module
            )));
        }
        let binding = ServiceBinding::new(bean, method, handler);
        let replaced = self.services.insert(sid.clone(), binding);
        if replaced.is_some() {
            tracing::warn!(module = %self.module, service = %sid, "service binding overwritten");
            return Ok(false);
        }
        tracing::debug!(module = %self.module, service = %sid, "service registered");
        Ok(true)
    }

    /// Registers a batch of bindings; returns how many were new.
    ///
    /// # Errors
    /// Fails fast on the first invalid entry.
    pub fn register_batch(
        &self,
        bindings: Vec<(ServiceId, Arc<dyn Any + Send + Sync>, ServiceMethod, ServiceHandler)>,
    ) -> GovResult<usize> {
        let mut fresh = 0;
        for (sid, bean, method, handler) in bindings {
            if self.register(sid, bean, method, handler)? {
                fresh += 1;
            }
        }
        Ok(fresh)
    }

    pub fn unregister(&self, sid: &ServiceId) -> bool {
        self.services.remove(sid).is_some()
    }

    #[must_use]
    pub fn get(&self, sid: &ServiceId) -> Option<ServiceBinding> {
        self.services.get(sid).map(|b| b.clone())
    }

    /// # Errors
    /// `SERVICE_NOT_FOUND` on miss.
    pub fn get_required(&self, sid: &ServiceId) -> GovResult<ServiceBinding> {
        self.get(sid)
            .ok_or_else(|| GovError::ServiceNotFound(sid.as_str().to_owned()))
    }

    #[must_use]
    pub fn has(&self, sid: &ServiceId) -> bool {
        self.services.contains_key(sid)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ServiceId> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.services.len()
    }

    /// Exposes an interface implementation under its type key. Re-exposing
    /// overwrites; existing `Arc`s held by consumers stay valid.
    pub fn expose_client<T>(&self, client: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.clients
            .write()
            .insert(TypeKey::of::<T>(), Box::new(client));
    }

    /// Typed fetch of an exposed interface implementation.
    #[must_use]
    pub fn client<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let clients = self.clients.read();
        let boxed = clients.get(&TypeKey::of::<T>())?;
        boxed.downcast_ref::<Arc<T>>().cloned()
    }

    #[must_use]
    pub fn has_client_key(&self, key: &TypeKey) -> bool {
        self.clients.read().contains_key(key)
    }

    /// Memoized per-interface proxy. The factory runs at most once per
    /// interface even under concurrent callers.
    pub fn get_or_create_proxy<T, F>(&self, factory: F) -> Arc<T>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let key = TypeKey::of::<T>();
        if let Some(existing) = self.proxy_for::<T>(&key) {
            return existing;
        }
        let _flight = self.proxy_init.lock();
        if let Some(existing) = self.proxy_for::<T>(&key) {
            return existing;
        }
        let proxy = factory();
        self.proxies
            .write()
            .insert(key, Box::new(Arc::clone(&proxy)));
        proxy
    }

    fn proxy_for<T>(&self, key: &TypeKey) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let proxies = self.proxies.read();
        proxies
            .get(key)
            .and_then(|boxed| boxed.downcast_ref::<Arc<T>>().cloned())
    }

    /// Invalidates every memoized proxy (the target bindings may have
    /// changed under an upgrade).
    pub fn clear_proxies(&self) {
        self.proxies.write().clear();
    }

    /// Wipes bindings, clients and proxies.
    pub fn clear(&self) {
        self.services.clear();
        self.clients.write().clear();
        self.clear_proxies();
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("module", &self.module)
            .field("services", &self.count())
            .field("clients", &self.clients.read().len())
            .finish()
    }
}
