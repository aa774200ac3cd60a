//! Unified governed entry point: permission check, scoped call context,
//! asynchronous audit.

use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use uuid::Uuid;

use crate::audit::{AuditManager, AuditRecord};
use crate::context::{CallScope, InvocationContext, with_call_scope};
use crate::contracts::PermissionService;
use crate::errors::{GovError, GovResult};

pub struct GovernanceKernel {
    permissions: Arc<dyn PermissionService>,
    audit: Arc<AuditManager>,
}

impl GovernanceKernel {
    #[must_use]
    pub fn new(permissions: Arc<dyn PermissionService>, audit: Arc<AuditManager>) -> Self {
        Self { permissions, audit }
    }

    /// Runs `task` under governance: the caller's permission is checked
    /// first, the task executes inside a call scope carrying the (generated
    /// or propagated) trace id, and an audit entry is recorded asynchronously
    /// when the context asks for one.
    ///
    /// # Errors
    /// `PERMISSION_DENIED` on policy refusal; otherwise the task's error.
    pub async fn invoke<F>(
        &self,
        ctx: &InvocationContext,
        args_digest: String,
        task: F,
    ) -> GovResult<serde_json::Value>
    where
        F: Future<Output = GovResult<serde_json::Value>>,
    {
        let trace_id = ctx.trace_id.unwrap_or_else(Uuid::now_v7);

        if let Some(required) = &ctx.required_permission {
            if !self
                .permissions
                .is_allowed(&ctx.caller, required, ctx.access)
            {
                tracing::warn!(
                    caller = %ctx.caller,
                    permission = %required,
                    "permission denied"
                );
                if ctx.should_audit {
                    self.audit
                        .record(self.record_for(ctx, &args_digest, trace_id, false, false, 0));
                }
                return Err(GovError::PermissionDenied {
                    caller: ctx.caller.clone(),
                    permission: required.clone(),
                });
            }
        }

        let started = Instant::now();
        let scope = CallScope {
            trace_id,
            caller: ctx.caller.clone(),
        };
        let result = with_call_scope(scope, task).await;

        if ctx.should_audit {
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.audit.record(self.record_for(
                ctx,
                &args_digest,
                trace_id,
                true,
                result.is_ok(),
                duration_ms,
            ));
        }
        result
    }

    fn record_for(
        &self,
        ctx: &InvocationContext,
        args_digest: &str,
        trace_id: Uuid,
        allowed: bool,
        success: bool,
        duration_ms: u64,
    ) -> AuditRecord {
        AuditRecord {
            caller: ctx.caller.clone(),
            target: ctx.target.clone(),
            action: ctx
                .audit_action
                .clone()
                .unwrap_or_else(|| ctx.operation.clone()),
            args_digest: args_digest.to_owned(),
            allowed,
            success,
            duration_ms,
            trace_id,
            recorded_at: SystemTime::now(),
        }
    }
}

impl std::fmt::Debug for GovernanceKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceKernel").finish_non_exhaustive()
    }
}
