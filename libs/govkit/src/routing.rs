//! Instance selection.

use std::sync::Arc;

use crate::context::InvocationContext;
use crate::instance::ModuleInstance;

/// Picks an instance for a call, or declines and lets the runtime fall back
/// to the default instance.
pub trait TrafficRouter: Send + Sync {
    fn route(
        &self,
        instances: &[Arc<ModuleInstance>],
        ctx: &InvocationContext,
    ) -> Option<Arc<ModuleInstance>>;
}

/// Label-overlap scoring router.
///
/// Each request label that matches an instance label scores +10; a request
/// label the instance lacks or contradicts filters the instance out entirely.
/// With no request labels the router declines, deferring to the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelScoreRouter;

impl LabelScoreRouter {
    const MATCH_WEIGHT: i64 = 10;

    fn score(instance: &ModuleInstance, ctx: &InvocationContext) -> Option<i64> {
        let mut score = 0;
        for (key, expected) in &ctx.labels {
            match instance.labels().get(key) {
                Some(actual) if actual == expected => score += Self::MATCH_WEIGHT,
                _ => return None,
            }
        }
        Some(score)
    }
}

impl TrafficRouter for LabelScoreRouter {
    fn route(
        &self,
        instances: &[Arc<ModuleInstance>],
        ctx: &InvocationContext,
    ) -> Option<Arc<ModuleInstance>> {
        if ctx.labels.is_empty() {
            return None;
        }
        let best = instances
            .iter()
            .filter(|i| i.is_ready() && !i.is_dying())
            .filter_map(|i| Self::score(i, ctx).map(|s| (s, i)))
            .max_by_key(|(s, _)| *s)
            .map(|(_, i)| Arc::clone(i));
        if best.is_none() {
            tracing::debug!(
                resource = %ctx.resource_id,
                labels = ?ctx.labels,
                "no instance matched request labels; deferring to default"
            );
        }
        best
    }
}
