//! Shared fixtures: scripted containers, a static loader, a deny-list
//! permission service and a preconfigured manager harness.
#![allow(dead_code)]

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use govkit::audit::MemoryAuditSink;
use govkit::config::GovConfig;
use govkit::context::PluginContext;
use govkit::contracts::{
    ContainerFactory, ModuleContainer, ModuleLoader, PermissionService, ResolutionHandle,
};
use govkit::domain::{AccessKind, ModuleDefinition, ModuleId, ModuleSource, Version};
use govkit::manager::ModuleManager;
use govkit::registry::{ServiceHandler, ServiceMethod, TypeKey};

/// Closure run during container start, e.g. to expose interface clients.
pub type OnStart = Arc<dyn Fn(&PluginContext) -> anyhow::Result<()> + Send + Sync>;

/// Scripted behavior for the next container created for a module.
#[derive(Default)]
pub struct ContainerPlan {
    services: Vec<(String, ServiceHandler)>,
    fail_start: Option<String>,
    panic_on_stop: bool,
    stops: Option<Arc<AtomicUsize>>,
    on_start: Option<OnStart>,
}

impl ContainerPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, short_id: &str, handler: ServiceHandler) -> Self {
        self.services.push((short_id.to_owned(), handler));
        self
    }

    pub fn fail_start(mut self, message: &str) -> Self {
        self.fail_start = Some(message.to_owned());
        self
    }

    pub fn panic_on_stop(mut self) -> Self {
        self.panic_on_stop = true;
        self
    }

    pub fn with_stop_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.stops = Some(counter);
        self
    }

    pub fn on_start(mut self, hook: OnStart) -> Self {
        self.on_start = Some(hook);
        self
    }
}

pub struct TestContainer {
    module: ModuleId,
    active: AtomicBool,
    services: Vec<(String, ServiceHandler)>,
    fail_start: Option<String>,
    panic_on_stop: bool,
    stops: Arc<AtomicUsize>,
    on_start: Option<OnStart>,
    handle: Arc<dyn ResolutionHandle>,
}

#[async_trait::async_trait]
impl ModuleContainer for TestContainer {
    async fn start(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        if let Some(message) = &self.fail_start {
            anyhow::bail!("{message}");
        }
        for (short_id, handler) in &self.services {
            ctx.register_service(
                short_id,
                Arc::new(()),
                ServiceMethod::of::<TestContainer>(short_id)?,
                Arc::clone(handler),
            )?;
        }
        if let Some(hook) = &self.on_start {
            hook(ctx)?;
        }
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        assert!(!self.panic_on_stop, "scripted stop failure for {}", self.module);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn bean_by_type(&self, _key: &TypeKey) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    fn bean_by_name(&self, _name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    fn resolution_handle(&self) -> Option<Arc<dyn ResolutionHandle>> {
        Some(Arc::clone(&self.handle))
    }
}

/// Creates containers according to queued plans, in install order.
#[derive(Default)]
pub struct TestContainerFactory {
    plans: Mutex<HashMap<String, VecDeque<ContainerPlan>>>,
    fail_create: Mutex<HashSet<String>>,
}

impl TestContainerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues the plan used for the module's next container.
    pub fn plan(&self, module: &str, plan: ContainerPlan) {
        self.plans
            .lock()
            .entry(module.to_owned())
            .or_default()
            .push_back(plan);
    }

    pub fn fail_create_for(&self, module: &str) {
        self.fail_create.lock().insert(module.to_owned());
    }
}

impl ContainerFactory for TestContainerFactory {
    fn create(
        &self,
        module: &ModuleId,
        _source: &ModuleSource,
        handle: Arc<dyn ResolutionHandle>,
    ) -> anyhow::Result<Arc<dyn ModuleContainer>> {
        if self.fail_create.lock().contains(module.as_str()) {
            anyhow::bail!("scripted container creation failure for {module}");
        }
        let plan = self
            .plans
            .lock()
            .get_mut(module.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        Ok(Arc::new(TestContainer {
            module: module.clone(),
            active: AtomicBool::new(false),
            services: plan.services,
            fail_start: plan.fail_start,
            panic_on_stop: plan.panic_on_stop,
            stops: plan.stops.unwrap_or_default(),
            on_start: plan.on_start,
            handle,
        }))
    }
}

pub struct TestHandle {
    closed: AtomicUsize,
}

impl ResolutionHandle for TestHandle {
    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl TestHandle {
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Loader producing in-memory handles; remembers them for assertions.
#[derive(Default)]
pub struct StaticLoader {
    handles: Mutex<Vec<Arc<TestHandle>>>,
    fail_for: Mutex<HashSet<String>>,
}

impl StaticLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, module: &str) {
        self.fail_for.lock().insert(module.to_owned());
    }

    pub fn handles(&self) -> Vec<Arc<TestHandle>> {
        self.handles.lock().clone()
    }
}

impl ModuleLoader for StaticLoader {
    fn create(
        &self,
        module: &ModuleId,
        _source: &ModuleSource,
        _parent: Option<&Arc<dyn ResolutionHandle>>,
    ) -> anyhow::Result<Arc<dyn ResolutionHandle>> {
        if self.fail_for.lock().contains(module.as_str()) {
            anyhow::bail!("scripted loader failure for {module}");
        }
        let handle = Arc::new(TestHandle {
            closed: AtomicUsize::new(0),
        });
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}

/// Deny-list permission service; everything not denied is allowed.
#[derive(Default)]
pub struct TestPermissions {
    denied: Mutex<HashSet<(String, String)>>,
    removed: Mutex<Vec<String>>,
}

impl TestPermissions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny(&self, caller: &str, permission: &str) {
        self.denied
            .lock()
            .insert((caller.to_owned(), permission.to_owned()));
    }

    pub fn removed_modules(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

impl PermissionService for TestPermissions {
    fn is_allowed(&self, module: &ModuleId, permission: &str, _access: AccessKind) -> bool {
        !self
            .denied
            .lock()
            .contains(&(module.as_str().to_owned(), permission.to_owned()))
    }

    fn remove_module(&self, module: &ModuleId) {
        self.removed.lock().push(module.as_str().to_owned());
    }

    fn audit(&self, _module: &ModuleId, _capability: &str, _operation: &str, _allowed: bool) {}
}

/// A manager wired to the scripted fixtures.
pub struct TestHost {
    pub manager: Arc<ModuleManager>,
    pub factory: Arc<TestContainerFactory>,
    pub loader: Arc<StaticLoader>,
    pub permissions: Arc<TestPermissions>,
    pub sink: Arc<MemoryAuditSink>,
}

impl TestHost {
    pub fn with_config(config: GovConfig) -> Self {
        let factory = TestContainerFactory::new();
        let loader = StaticLoader::new();
        let permissions = TestPermissions::new();
        let sink = Arc::new(MemoryAuditSink::new());
        let manager = ModuleManager::builder()
            .with_config(config)
            .with_loader(loader.clone())
            .with_container_factory(factory.clone())
            .with_permissions(permissions.clone())
            .with_audit_sink(sink.clone())
            .build()
            .unwrap();
        Self {
            manager,
            factory,
            loader,
            permissions,
            sink,
        }
    }

    pub fn new() -> Self {
        Self::with_config(GovConfig::default())
    }
}

pub fn module_id(id: &str) -> ModuleId {
    ModuleId::new(id).unwrap()
}

pub fn definition(id: &str, version: &str) -> ModuleDefinition {
    ModuleDefinition::new(module_id(id), Version::new(version).unwrap())
}

/// `hello(name) -> "Hello, <name>"`.
pub fn greet_handler() -> ServiceHandler {
    Arc::new(|args| {
        Box::pin(async move {
            let name = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or("stranger")
                .to_owned();
            Ok(serde_json::json!(format!("Hello, {name}")))
        })
    })
}

/// `wait(ms) -> "done"`: sleeps for the requested milliseconds.
pub fn wait_handler() -> ServiceHandler {
    Arc::new(|args| {
        Box::pin(async move {
            let ms = args.first().and_then(serde_json::Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(serde_json::json!("done"))
        })
    })
}

/// Sleeps a fixed time, then returns the given reply (blue/green probes).
pub fn slow_reply_handler(reply: &str, sleep: Duration) -> ServiceHandler {
    let reply = reply.to_owned();
    Arc::new(move |_args| {
        let reply = reply.clone();
        Box::pin(async move {
            tokio::time::sleep(sleep).await;
            Ok(serde_json::json!(reply))
        })
    })
}

/// Returns a fixed value immediately.
pub fn value_handler(value: serde_json::Value) -> ServiceHandler {
    Arc::new(move |_args| {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}
