//! Per-call metadata, the task-scoped call context, and the module-facing
//! plugin context.

use std::future::Future;
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::domain::{AccessKind, Labels, ModuleDefinition, ModuleId, ServiceId};
use crate::errors::{GovError, GovResult};
use crate::events::RuntimeEvent;
use crate::registry::{ServiceArgs, ServiceHandler, ServiceMethod};

/// Resource type tag for host-initiated protocol invocations.
pub const RESOURCE_RPC_HOST_INVOKE: &str = "RPC_HOST_INVOKE";
/// Resource type tag for routing probes.
pub const RESOURCE_ROUTE: &str = "ROUTE";

/// Mutable per-call record assembled by the kernel before delegation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub trace_id: Option<Uuid>,
    pub caller: ModuleId,
    pub target: ModuleId,
    pub resource_type: &'static str,
    pub resource_id: String,
    pub operation: String,
    pub required_permission: Option<String>,
    pub access: AccessKind,
    pub should_audit: bool,
    pub audit_action: Option<String>,
    pub labels: Labels,
}

impl InvocationContext {
    /// Context for a governed host-to-module service call.
    #[must_use]
    pub fn host_invoke(caller: ModuleId, target: ModuleId, service: &ServiceId) -> Self {
        Self {
            trace_id: current_trace_id(),
            caller,
            target,
            resource_type: RESOURCE_RPC_HOST_INVOKE,
            resource_id: service.as_str().to_owned(),
            operation: service.short_part().to_owned(),
            required_permission: Some(service.as_str().to_owned()),
            access: AccessKind::Execute,
            should_audit: true,
            audit_action: Some(service.short_part().to_owned()),
            labels: Labels::new(),
        }
    }

    /// Context for an instance-selection probe inside one module.
    #[must_use]
    pub fn route_probe(module: ModuleId, resource_id: impl Into<String>, labels: Labels) -> Self {
        let resource_id = resource_id.into();
        Self {
            trace_id: current_trace_id(),
            caller: module.clone(),
            target: module,
            resource_type: RESOURCE_ROUTE,
            operation: resource_id.clone(),
            resource_id,
            required_permission: None,
            access: AccessKind::Execute,
            should_audit: false,
            audit_action: None,
            labels,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

/// The ambient state every governed call runs under.
#[derive(Debug, Clone)]
pub struct CallScope {
    pub trace_id: Uuid,
    pub caller: ModuleId,
}

tokio::task_local! {
    static CALL_SCOPE: CallScope;
}

/// Runs `fut` under the given call scope. The enclosing task's scope (if any)
/// is untouched once the future completes.
pub async fn with_call_scope<F: Future>(scope: CallScope, fut: F) -> F::Output {
    CALL_SCOPE.scope(scope, fut).await
}

/// Trace id of the current governed call, if inside one.
#[must_use]
pub fn current_trace_id() -> Option<Uuid> {
    CALL_SCOPE.try_with(|s| s.trace_id).ok()
}

/// Module on whose behalf the current governed call runs, if inside one.
#[must_use]
pub fn current_caller() -> Option<ModuleId> {
    CALL_SCOPE.try_with(|s| s.caller.clone()).ok()
}

/// Immutable capture of the submitting task's ambient state: the trace id
/// plus one opaque value per registered propagator, in registration order.
pub struct ContextSnapshot {
    pub trace_id: Uuid,
    pub caller: ModuleId,
    values: Vec<Box<dyn std::any::Any + Send>>,
}

impl ContextSnapshot {
    #[must_use]
    pub fn capture(
        caller: ModuleId,
        propagators: &[Arc<dyn crate::contracts::ContextPropagator>],
    ) -> Self {
        Self {
            trace_id: current_trace_id().unwrap_or_else(Uuid::now_v7),
            caller,
            values: propagators.iter().map(|p| p.capture()).collect(),
        }
    }

    #[must_use]
    pub fn value(&self, index: usize) -> Option<&(dyn std::any::Any + Send)> {
        self.values.get(index).map(|boxed| &**boxed)
    }
}

impl std::fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("trace_id", &self.trace_id)
            .field("caller", &self.caller)
            .field("values", &self.values.len())
            .finish()
    }
}

/// What the core exposes to module code. One per running instance.
///
/// Holds only weak back-references; a context outliving its runtime fails
/// calls instead of keeping the module alive.
#[derive(Clone)]
pub struct PluginContext {
    module: ModuleId,
    definition: Arc<ModuleDefinition>,
    manager: Weak<crate::manager::ModuleManager>,
    runtime: Weak<crate::runtime::ModuleRuntime>,
}

impl PluginContext {
    #[must_use]
    pub fn new(
        module: ModuleId,
        definition: Arc<ModuleDefinition>,
        manager: Weak<crate::manager::ModuleManager>,
        runtime: Weak<crate::runtime::ModuleRuntime>,
    ) -> Self {
        Self {
            module,
            definition,
            manager,
            runtime,
        }
    }

    #[must_use]
    pub fn module_id(&self) -> &ModuleId {
        &self.module
    }

    #[must_use]
    pub fn definition(&self) -> &ModuleDefinition {
        &self.definition
    }

    /// String property from the module definition, if present.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.definition.property(key).and_then(|v| v.as_str())
    }

    fn manager(&self) -> GovResult<Arc<crate::manager::ModuleManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| GovError::ServiceUnavailable("module manager is gone".to_owned()))
    }

    fn runtime(&self) -> GovResult<Arc<crate::runtime::ModuleRuntime>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| GovError::ServiceUnavailable("module runtime is gone".to_owned()))
    }

    /// Registers a service endpoint under this module's id.
    ///
    /// # Errors
    /// Fails on blank short id or when the runtime is gone.
    pub fn register_service(
        &self,
        short_id: &str,
        bean: Arc<dyn std::any::Any + Send + Sync>,
        method: ServiceMethod,
        handler: ServiceHandler,
    ) -> GovResult<bool> {
        let sid = ServiceId::new(&self.module, short_id)?;
        self.manager()?
            .register_protocol_service(&self.module, sid, bean, method, handler)
    }

    /// Exposes an interface implementation for cross-module consumers.
    ///
    /// # Errors
    /// Fails when the runtime is gone.
    pub fn expose_client<T>(&self, client: Arc<T>) -> GovResult<()>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.runtime()?.services().expose_client(client);
        Ok(())
    }

    /// Resolves a cross-module interface implementation.
    ///
    /// # Errors
    /// `SERVICE_NOT_FOUND` when no installed module exposes `T`.
    pub fn get_service<T>(&self) -> GovResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.manager()?.get_service::<T>(&self.module)
    }

    /// Invokes a service by id through the governed pipeline.
    ///
    /// # Errors
    /// Propagates governance and execution failures; `Ok(None)` when the
    /// service id is not routable.
    pub async fn invoke(
        &self,
        service: &ServiceId,
        args: ServiceArgs,
    ) -> GovResult<Option<serde_json::Value>> {
        self.manager()?
            .invoke_service(&self.module, service, args)
            .await
    }

    /// Publishes an event on this module's bus.
    pub fn publish_event(&self, event: &RuntimeEvent) {
        if let Ok(runtime) = self.runtime() {
            runtime.event_bus().publish(event);
        }
    }

    /// Handle to the governance policy store.
    ///
    /// # Errors
    /// Fails when the manager is gone.
    pub fn permission_service(&self) -> GovResult<Arc<dyn crate::contracts::PermissionService>> {
        Ok(self.manager()?.permission_service())
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("module", &self.module)
            .field("version", &self.definition.version)
            .finish()
    }
}
