//! govkit — in-process module governance runtime.
//!
//! A host process embeds govkit to run many independently deployed modules:
//! the runtime isolates their lifecycles, routes typed service calls between
//! them under per-caller permission checks and audit recording, executes
//! calls behind per-module bulkheads and timeouts, and swaps module versions
//! blue/green while draining in-flight work.
//!
//! The building blocks, leaves first:
//! - [`events::EventBus`] — per-module lifecycle pub/sub.
//! - [`instance::ModuleInstance`] — one running version with admission
//!   counting and destroy-once teardown.
//! - [`pool::InstancePool`] — active set, atomic default pointer, dying
//!   queue with backpressure.
//! - [`registry::ServiceRegistry`] — service-id bindings, exposed interface
//!   clients, memoized proxies.
//! - [`executor::InvocationExecutor`] — bulkhead admission, sync/async
//!   dispatch, timeout, context snapshot replay.
//! - [`lifecycle::LifecycleManager`] — instance transitions, idle cleanup,
//!   shutdown escalation.
//! - [`runtime::ModuleRuntime`] — composition root for one module.
//! - [`manager::ModuleManager`] — install/uninstall/reload, the global
//!   service route table and interface routing.
//! - [`kernel::GovernanceKernel`] — permission check, call scope, audit.
//!
//! External collaborators (code isolation, bean wiring, policy stores) stay
//! behind the seams in [`contracts`].

pub mod audit;
pub mod config;
pub mod context;
pub mod contracts;
pub mod domain;
pub mod errors;
pub mod events;
pub mod executor;
pub mod instance;
pub mod kernel;
pub mod lifecycle;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod routing;
pub mod runtime;

pub use audit::{AuditManager, AuditRecord, AuditSink, LogAuditSink, MemoryAuditSink};
pub use config::GovConfig;
pub use context::{InvocationContext, PluginContext};
pub use contracts::{
    AllowAllPermissions, ContainerFactory, ContextPropagator, LifecycleHook, ModuleContainer,
    ModuleLoader, NonTransactional, PermissionService, ResolutionHandle, SecurityVerifier,
    TransactionVerifier,
};
pub use domain::{
    AccessKind, Labels, ModuleDefinition, ModuleId, ModuleInfo, ModuleSource, ModuleStatus,
    ServiceId, SourceLocation, TrafficStats, Version,
};
pub use errors::{GovError, GovResult};
pub use events::{EventBus, EventKind, RuntimeEvent, Subscription};
pub use instance::ModuleInstance;
pub use kernel::GovernanceKernel;
pub use manager::{LazyService, ModuleManager, ModuleManagerBuilder};
pub use registry::{
    ServiceArgs, ServiceBinding, ServiceHandler, ServiceMethod, ServiceRegistry, TypeKey,
};
pub use routing::{LabelScoreRouter, TrafficRouter};
pub use runtime::ModuleRuntime;
