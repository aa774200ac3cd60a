//! Interfaces of the external collaborators the core delegates to.
//!
//! Implementations live outside this crate: code isolation, bean wiring,
//! policy stores and infrastructure proxies are all pluggable behind these
//! narrow seams.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::PluginContext;
use crate::domain::{AccessKind, ModuleId, ModuleSource};
use crate::instance::ModuleInstance;
use crate::registry::{ServiceMethod, TypeKey};

/// Closeable handle to a module's resolved code (the isolation boundary).
pub trait ResolutionHandle: Send + Sync {
    /// Releases the resolution resources. Idempotent; must not panic.
    fn close(&self);
}

/// Creates per-module code-resolution handles.
pub trait ModuleLoader: Send + Sync {
    /// Creates a resolution handle for `module` from `source`.
    ///
    /// # Errors
    /// Fails without exposing a partial handle.
    fn create(
        &self,
        module: &ModuleId,
        source: &ModuleSource,
        parent: Option<&Arc<dyn ResolutionHandle>>,
    ) -> anyhow::Result<Arc<dyn ResolutionHandle>>;
}

/// The embedded bean-wiring container of one module instance.
#[async_trait]
pub trait ModuleContainer: Send + Sync {
    /// Starts the container; may block for seconds.
    ///
    /// # Errors
    /// A failed start leaves the container inactive.
    async fn start(&self, ctx: &PluginContext) -> anyhow::Result<()>;

    /// Stops the container. Idempotent; implementations swallow and log.
    async fn stop(&self);

    fn is_active(&self) -> bool;

    fn bean_by_type(&self, key: &TypeKey) -> Option<Arc<dyn Any + Send + Sync>>;

    fn bean_by_name(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;

    fn resolution_handle(&self) -> Option<Arc<dyn ResolutionHandle>>;
}

/// Builds containers from a module source and its resolution handle.
pub trait ContainerFactory: Send + Sync {
    /// # Errors
    /// A failed creation must not leak the handle; the manager closes it.
    fn create(
        &self,
        module: &ModuleId,
        source: &ModuleSource,
        handle: Arc<dyn ResolutionHandle>,
    ) -> anyhow::Result<Arc<dyn ModuleContainer>>;
}

/// The governance policy store consulted before every governed call.
pub trait PermissionService: Send + Sync {
    fn is_allowed(&self, module: &ModuleId, permission: &str, access: AccessKind) -> bool;

    /// Cleanup hook invoked when a module is uninstalled.
    fn remove_module(&self, module: &ModuleId);

    /// Direct policy-side audit channel, independent of the audit pipeline.
    fn audit(&self, module: &ModuleId, capability: &str, operation: &str, allowed: bool);
}

/// Permissive default policy: every caller may do everything. Hosts that
/// need governance plug in a real store.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPermissions;

impl PermissionService for AllowAllPermissions {
    fn is_allowed(&self, _module: &ModuleId, _permission: &str, _access: AccessKind) -> bool {
        true
    }

    fn remove_module(&self, _module: &ModuleId) {}

    fn audit(&self, module: &ModuleId, capability: &str, operation: &str, allowed: bool) {
        tracing::debug!(module = %module, capability, operation, allowed, "policy audit");
    }
}

/// Decides whether a binding must stay on the caller's task.
pub trait TransactionVerifier: Send + Sync {
    fn is_transactional(&self, method: &ServiceMethod) -> bool;
}

/// Default verifier: nothing is transactional, every call is dispatched async.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonTransactional;

impl TransactionVerifier for NonTransactional {
    fn is_transactional(&self, _method: &ServiceMethod) -> bool {
        false
    }
}

/// Pre-install gate; any failing verifier aborts the install.
pub trait SecurityVerifier: Send + Sync {
    /// # Errors
    /// An error rejects the module source.
    fn verify(&self, module: &ModuleId, source: &ModuleSource) -> anyhow::Result<()>;
}

/// Carries one slice of caller-side ambient state onto worker tasks.
///
/// `capture` runs on the submitting task, `replay` on the worker before the
/// user code (returning a backup of the worker's previous state), `restore`
/// on every worker exit path. Implementations must only touch their own state.
pub trait ContextPropagator: Send + Sync {
    fn capture(&self) -> Box<dyn Any + Send>;

    fn replay(&self, snapshot: &(dyn Any + Send)) -> Box<dyn Any + Send>;

    fn restore(&self, backup: Box<dyn Any + Send>);
}

/// Host hooks around module lifecycle transitions.
///
/// Unlike event-bus handlers, `before_uninstall` is consulted and may veto by
/// returning an error. The remaining hooks are observational.
pub trait LifecycleHook: Send + Sync {
    fn before_install(&self, _module: &ModuleId) {}

    fn after_install(&self, _module: &ModuleId) {}

    /// # Errors
    /// An error aborts the uninstall before anything is torn down.
    fn before_uninstall(&self, _module: &ModuleId) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_uninstall(&self, _module: &ModuleId) {}

    fn before_instance_stop(&self, _instance: &ModuleInstance) {}

    fn after_instance_stop(&self, _instance: &ModuleInstance) {}
}
