//! Governed invocation execution: admission, dispatch, timeout, context
//! replay.
//!
//! Transactional bindings run on the caller's task, unbulkheaded by design
//! (callers needing throttling enforce it upstream). Everything else is
//! dispatched to the shared worker runtime behind the module's semaphore and
//! an overall execution timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::config::GovConfig;
use crate::context::{CallScope, ContextSnapshot, with_call_scope};
use crate::contracts::{ContextPropagator, TransactionVerifier};
use crate::domain::ModuleId;
use crate::errors::{GovError, GovResult};
use crate::events::{EventBus, RuntimeEvent};
use crate::instance::ModuleInstance;
use crate::registry::{ServiceArgs, ServiceBinding};

/// Releases an instance admission on every exit path, including worker
/// cancellation.
struct EnterGuard(Arc<ModuleInstance>);

impl Drop for EnterGuard {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Replays a context snapshot onto the worker and restores the worker's
/// previous state on drop, in reverse registration order.
struct ReplayGuard<'a> {
    propagators: &'a [Arc<dyn ContextPropagator>],
    backups: Vec<Option<Box<dyn std::any::Any + Send>>>,
}

impl<'a> ReplayGuard<'a> {
    fn apply(propagators: &'a [Arc<dyn ContextPropagator>], snapshot: &ContextSnapshot) -> Self {
        let backups = propagators
            .iter()
            .enumerate()
            .map(|(i, p)| snapshot.value(i).map(|v| p.replay(v)))
            .collect();
        Self {
            propagators,
            backups,
        }
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        for (propagator, backup) in self.propagators.iter().zip(&mut self.backups).rev() {
            if let Some(backup) = backup.take() {
                propagator.restore(backup);
            }
        }
    }
}

pub struct InvocationExecutor {
    module: ModuleId,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    exec_timeout: Duration,
    verifier: Arc<dyn TransactionVerifier>,
    propagators: Arc<[Arc<dyn ContextPropagator>]>,
    bus: Option<Arc<EventBus>>,
}

impl InvocationExecutor {
    #[must_use]
    pub fn new(
        module: ModuleId,
        config: &GovConfig,
        verifier: Arc<dyn TransactionVerifier>,
        propagators: Arc<[Arc<dyn ContextPropagator>]>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            module,
            permits: Arc::new(Semaphore::new(config.permits)),
            acquire_timeout: config.acquire_timeout(),
            exec_timeout: config.exec_timeout(),
            verifier,
            propagators,
            bus,
        }
    }

    /// Currently free bulkhead permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn publish(&self, event: &RuntimeEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    /// Runs one governed invocation against an instance.
    ///
    /// # Errors
    /// `SERVICE_UNAVAILABLE` when the instance refuses admission, `REJECTED`
    /// on bulkhead exhaustion, `TIMEOUT` past the execution bound,
    /// `INVOCATION_ERROR` when the binding raises, `INTERRUPTED` on worker
    /// cancellation.
    pub async fn execute(
        &self,
        instance: &Arc<ModuleInstance>,
        binding: &ServiceBinding,
        args: ServiceArgs,
        caller: &ModuleId,
        service: &crate::domain::ServiceId,
    ) -> GovResult<serde_json::Value> {
        self.publish(&RuntimeEvent::InvocationStarted {
            module: self.module.clone(),
            service: service.clone(),
            caller: caller.clone(),
        });
        let started = Instant::now();
        let result = self.dispatch(instance, binding, args, caller, service).await;
        self.publish(&RuntimeEvent::InvocationCompleted {
            module: self.module.clone(),
            service: service.clone(),
            duration: started.elapsed(),
            success: result.is_ok(),
        });
        result
    }

    async fn dispatch(
        &self,
        instance: &Arc<ModuleInstance>,
        binding: &ServiceBinding,
        args: ServiceArgs,
        caller: &ModuleId,
        service: &crate::domain::ServiceId,
    ) -> GovResult<serde_json::Value> {
        if !instance.try_enter() {
            return Err(GovError::ServiceUnavailable(format!(
                "instance {} of module '{}' is not accepting work",
                instance.version(),
                self.module
            )));
        }
        let enter = EnterGuard(Arc::clone(instance));

        if self.verifier.is_transactional(binding.method()) {
            // Transaction semantics bind to the calling task; no permit, no
            // timeout, no hop.
            let _enter = enter;
            return binding.invoke(args).await.map_err(GovError::Invocation);
        }

        let snapshot = ContextSnapshot::capture(caller.clone(), &self.propagators);

        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(GovError::Interrupted),
            Err(_elapsed) => {
                self.publish(&RuntimeEvent::InvocationRejected {
                    module: self.module.clone(),
                    service: service.clone(),
                    reason: "bulkhead full".to_owned(),
                });
                return Err(GovError::Rejected("bulkhead full".to_owned()));
            }
        };

        let handler = binding.handler();
        let propagators = Arc::clone(&self.propagators);
        let scope = CallScope {
            trace_id: snapshot.trace_id,
            caller: snapshot.caller.clone(),
        };
        let mut worker = tokio::spawn(with_call_scope(scope, async move {
            let _enter = enter;
            let _replayed = ReplayGuard::apply(&propagators, &snapshot);
            handler(args).await
        }));

        let outcome = tokio::time::timeout(self.exec_timeout, &mut worker).await;
        // The permit is released when this frame returns, on every path below.
        drop(permit);

        match outcome {
            Err(_elapsed) => {
                // Best-effort cancel; the underlying call may still complete
                // and its result is discarded.
                worker.abort();
                tracing::warn!(
                    module = %self.module,
                    service = %service,
                    timeout_ms = self.exec_timeout.as_millis() as u64,
                    "invocation timed out; worker cancelled"
                );
                Err(GovError::Timeout(self.exec_timeout))
            }
            Ok(Err(join_error)) => {
                if join_error.is_cancelled() {
                    Err(GovError::Interrupted)
                } else {
                    Err(GovError::Invocation(anyhow::anyhow!(
                        "service handler panicked: {join_error}"
                    )))
                }
            }
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(cause))) => Err(GovError::Invocation(cause)),
        }
    }

    /// Runs the binding on the caller's task: the explicit transactional
    /// shortcut, also used by the manager for host-initiated calls.
    ///
    /// # Errors
    /// `SERVICE_UNAVAILABLE` when the instance refuses admission,
    /// `INVOCATION_ERROR` when the binding raises.
    pub async fn execute_sync(
        &self,
        instance: &Arc<ModuleInstance>,
        binding: &ServiceBinding,
        args: ServiceArgs,
    ) -> GovResult<serde_json::Value> {
        if !instance.try_enter() {
            return Err(GovError::ServiceUnavailable(format!(
                "instance {} of module '{}' is not accepting work",
                instance.version(),
                self.module
            )));
        }
        let _enter = EnterGuard(Arc::clone(instance));
        binding.invoke(args).await.map_err(GovError::Invocation)
    }
}

impl std::fmt::Debug for InvocationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationExecutor")
            .field("module", &self.module)
            .field("available_permits", &self.available_permits())
            .field("exec_timeout", &self.exec_timeout)
            .finish()
    }
}
