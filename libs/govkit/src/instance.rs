//! One running version of a module.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::contracts::ModuleContainer;
use crate::domain::{Labels, ModuleDefinition, Version};

/// A concrete loaded version: container handle, readiness, draining state and
/// the in-flight request counter.
///
/// The `ready`, `dying` and `destroyed` flags are monotonic; they are set once
/// and never unset. An instance is *idle* iff its active-request counter is 0.
pub struct ModuleInstance {
    version: Version,
    labels: Labels,
    definition: Arc<ModuleDefinition>,
    container: Arc<dyn ModuleContainer>,
    ready: AtomicBool,
    dying: AtomicBool,
    destroyed: AtomicBool,
    destroy_started: AtomicBool,
    active_requests: AtomicU64,
}

impl ModuleInstance {
    #[must_use]
    pub fn new(
        version: Version,
        labels: Labels,
        container: Arc<dyn ModuleContainer>,
        definition: Arc<ModuleDefinition>,
    ) -> Arc<Self> {
        Arc::new(Self {
            version,
            labels,
            definition,
            container,
            ready: AtomicBool::new(false),
            dying: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            destroy_started: AtomicBool::new(false),
            active_requests: AtomicU64::new(0),
        })
    }

    /// Marks the instance ready to accept work. Must happen after the
    /// container became active and before any successful [`Self::try_enter`].
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Marks the instance as superseded; it refuses new work but keeps
    /// draining in-flight calls. Idempotent.
    pub fn mark_dying(&self) {
        self.dying.store(true, Ordering::Release);
    }

    /// Admits one request iff the instance is ready, not dying, not destroyed
    /// and its container is active. On success the active counter is
    /// incremented and the caller owes a matching [`Self::exit`].
    pub fn try_enter(&self) -> bool {
        // Optimistically count, then re-check: a flag set concurrently is
        // observed here, so a dying instance never admits.
        self.active_requests.fetch_add(1, Ordering::AcqRel);
        let admitted = self.ready.load(Ordering::Acquire)
            && !self.dying.load(Ordering::Acquire)
            && !self.destroyed.load(Ordering::Acquire)
            && self.container.is_active();
        if !admitted {
            self.active_requests.fetch_sub(1, Ordering::AcqRel);
        }
        admitted
    }

    /// Releases one admission. Clamped at zero: an unpaired exit is logged
    /// and never produces a negative count.
    pub fn exit(&self) {
        let clamped = self
            .active_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err();
        if clamped {
            tracing::warn!(version = %self.version, "unpaired instance exit ignored");
        }
    }

    /// Physically tears the instance down. Idempotent; `container.stop()`
    /// runs at most once. Never blocks on in-flight calls: the caller is
    /// responsible for idleness.
    pub async fn destroy(&self) {
        if self.destroy_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.dying.store(true, Ordering::Release);
        // Run the stop on its own task so a panicking container cannot
        // unwind through the cleanup loop.
        let container = Arc::clone(&self.container);
        if let Err(err) = tokio::spawn(async move { container.stop().await }).await {
            tracing::warn!(version = %self.version, error = %err, "container stop failed");
        }
        self.destroyed.store(true, Ordering::Release);
        tracing::debug!(version = %self.version, "instance destroyed");
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active_request_count() == 0
    }

    #[must_use]
    pub fn active_request_count(&self) -> u64 {
        self.active_requests.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn version(&self) -> &Version {
        &self.version
    }

    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    #[must_use]
    pub fn definition(&self) -> &Arc<ModuleDefinition> {
        &self.definition
    }

    #[must_use]
    pub fn container(&self) -> &Arc<dyn ModuleContainer> {
        &self.container
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("version", &self.version)
            .field("ready", &self.is_ready())
            .field("dying", &self.is_dying())
            .field("destroyed", &self.is_destroyed())
            .field("active_requests", &self.active_request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use crate::registry::TypeKey;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    struct TestContainer {
        active: AtomicBool,
        stops: AtomicUsize,
    }

    impl TestContainer {
        fn new(active: bool) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(active),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ModuleContainer for TestContainer {
        async fn start(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.active.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
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

        fn resolution_handle(&self) -> Option<Arc<dyn crate::contracts::ResolutionHandle>> {
            None
        }
    }

    fn instance(container: Arc<TestContainer>) -> Arc<ModuleInstance> {
        let definition = Arc::new(ModuleDefinition::new(
            crate::domain::ModuleId::new("m").unwrap(),
            Version::new("1.0.0").unwrap(),
        ));
        ModuleInstance::new(
            Version::new("1.0.0").unwrap(),
            Labels::new(),
            container,
            definition,
        )
    }

    #[test]
    fn enter_requires_readiness() {
        let inst = instance(TestContainer::new(true));
        assert!(!inst.try_enter());
        inst.mark_ready();
        assert!(inst.try_enter());
        assert_eq!(inst.active_request_count(), 1);
        inst.exit();
        assert!(inst.is_idle());
    }

    #[test]
    fn dying_refuses_new_work_but_drains() {
        let inst = instance(TestContainer::new(true));
        inst.mark_ready();
        assert!(inst.try_enter());

        inst.mark_dying();
        assert!(!inst.try_enter());
        assert_eq!(inst.active_request_count(), 1);

        inst.exit();
        assert!(inst.is_idle());
    }

    #[test]
    fn inactive_container_refuses() {
        let inst = instance(TestContainer::new(false));
        inst.mark_ready();
        assert!(!inst.try_enter());
    }

    #[test]
    fn exit_is_clamped_at_zero() {
        let inst = instance(TestContainer::new(true));
        inst.mark_ready();
        inst.exit();
        inst.exit();
        assert_eq!(inst.active_request_count(), 0);
        assert!(inst.try_enter());
        assert_eq!(inst.active_request_count(), 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_stops_once() {
        let container = TestContainer::new(true);
        let inst = instance(container.clone());
        inst.mark_ready();

        inst.destroy().await;
        inst.destroy().await;

        assert!(inst.is_destroyed());
        assert!(inst.is_dying(), "destroyed implies dying");
        assert_eq!(container.stops.load(Ordering::SeqCst), 1);
        assert!(!inst.try_enter());
    }

    #[tokio::test]
    async fn concurrent_enters_count_correctly() {
        let inst = instance(TestContainer::new(true));
        inst.mark_ready();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let inst = inst.clone();
            handles.push(tokio::spawn(async move {
                assert!(inst.try_enter());
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(inst.active_request_count(), 32);
        for _ in 0..32 {
            inst.exit();
        }
        assert!(inst.is_idle());
    }
}
