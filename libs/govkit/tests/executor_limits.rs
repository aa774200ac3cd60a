//! Bulkhead, timeout and context-propagation behavior of the invocation
//! pipeline.

mod common;

use std::any::Any;
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use common::{ContainerPlan, TestHost, definition, module_id, wait_handler};
use govkit::config::GovConfig;
use govkit::contracts::ContextPropagator;
use govkit::domain::{ModuleSource, ServiceId};
use govkit::manager::ModuleManager;
use govkit::registry::ServiceHandler;

fn config(json: serde_json::Value) -> GovConfig {
    serde_json::from_value(json).unwrap()
}

async fn install_slow(host: &TestHost) -> ServiceId {
    host.factory.plan(
        "slow",
        ContainerPlan::new().with_service("wait", wait_handler()),
    );
    host.manager
        .install(definition("slow", "1.0.0"), ModuleSource::in_memory("slow"))
        .await
        .unwrap();
    ServiceId::parse("slow:wait").unwrap()
}

#[tokio::test]
async fn execution_timeout_fires_and_discards_the_result() {
    let host = TestHost::with_config(config(serde_json::json!({
        "exec_timeout_ms": 200,
    })));
    let sid = install_slow(&host).await;

    let started = Instant::now();
    let err = host
        .manager
        .invoke_service(&module_id("host"), &sid, vec![serde_json::json!(500)])
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), "TIMEOUT");
    assert!(
        elapsed < Duration::from_millis(450),
        "timeout must preempt the 500ms sleep, took {elapsed:?}"
    );

    // Permit balance restored.
    let executor = host.manager.runtime(&module_id("slow")).unwrap().executor().clone();
    assert_eq!(executor.available_permits(), GovConfig::default().permits);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bulkhead_rejects_the_third_concurrent_call() {
    let host = TestHost::with_config(config(serde_json::json!({
        "permits": 2,
        "acquire_timeout_ms": 50,
        "exec_timeout_ms": 10_000,
    })));
    let sid = install_slow(&host).await;

    let mut in_flight = Vec::new();
    for _ in 0..2 {
        let manager = host.manager.clone();
        let sid = sid.clone();
        in_flight.push(tokio::spawn(async move {
            manager
                .invoke_service(&module_id("host"), &sid, vec![serde_json::json!(800)])
                .await
        }));
    }
    // Wait until both calls hold their permits.
    let executor = host.manager.runtime(&module_id("slow")).unwrap().executor().clone();
    let deadline = Instant::now() + Duration::from_secs(2);
    while executor.available_permits() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(executor.available_permits(), 0);

    let started = Instant::now();
    let err = host
        .manager
        .invoke_service(&module_id("host"), &sid, vec![serde_json::json!(10)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "REJECTED");
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "rejection must be prompt"
    );

    for handle in in_flight {
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply, Some(serde_json::json!("done")));
    }

    // Permits free again; the next call goes through.
    let reply = host
        .manager
        .invoke_service(&module_id("host"), &sid, vec![serde_json::json!(1)])
        .await
        .unwrap();
    assert_eq!(reply, Some(serde_json::json!("done")));
}

#[tokio::test]
async fn zero_permits_reject_after_the_acquire_window() {
    let host = TestHost::with_config(config(serde_json::json!({
        "permits": 0,
        "acquire_timeout_ms": 30,
    })));
    let sid = install_slow(&host).await;

    for _ in 0..2 {
        let err = host
            .manager
            .invoke_service(&module_id("host"), &sid, vec![serde_json::json!(1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "REJECTED");
    }
}

#[tokio::test]
async fn permit_balance_holds_on_every_exit_path() {
    let host = TestHost::with_config(config(serde_json::json!({
        "permits": 3,
        "acquire_timeout_ms": 40,
        "exec_timeout_ms": 150,
    })));
    host.factory.plan(
        "mix",
        ContainerPlan::new()
            .with_service("wait", wait_handler())
            .with_service(
                "fail",
                Arc::new(|_args| Box::pin(async { Err(anyhow::anyhow!("scripted failure")) })),
            )
            .with_service(
                "boom",
                Arc::new(|_args| Box::pin(async { panic!("scripted panic") })),
            ),
    );
    host.manager
        .install(definition("mix", "1.0.0"), ModuleSource::in_memory("mix"))
        .await
        .unwrap();
    let executor = host.manager.runtime(&module_id("mix")).unwrap().executor().clone();
    let baseline = executor.available_permits();

    let cases: Vec<(ServiceId, serde_json::Value, &str)> = vec![
        (ServiceId::parse("mix:wait").unwrap(), serde_json::json!(1), "ok"),
        (ServiceId::parse("mix:wait").unwrap(), serde_json::json!(500), "TIMEOUT"),
        (ServiceId::parse("mix:fail").unwrap(), serde_json::json!(null), "INVOCATION_ERROR"),
        (ServiceId::parse("mix:boom").unwrap(), serde_json::json!(null), "INVOCATION_ERROR"),
    ];
    for (sid, arg, expected) in cases {
        let result = host
            .manager
            .invoke_service(&module_id("host"), &sid, vec![arg])
            .await;
        match (result, expected) {
            (Ok(_), "ok") => {}
            (Err(err), kind) => assert_eq!(err.kind(), kind),
            (Ok(v), kind) => panic!("expected {kind}, got {v:?}"),
        }
        assert_eq!(
            executor.available_permits(),
            baseline,
            "permits must balance after every outcome"
        );
    }
}

thread_local! {
    static AMBIENT: Cell<i64> = const { Cell::new(0) };
}

/// Propagator over a genuine thread-local, recording its call sequence.
struct AmbientPropagator {
    calls: Arc<Mutex<Vec<String>>>,
}

impl ContextPropagator for AmbientPropagator {
    fn capture(&self) -> Box<dyn Any + Send> {
        self.calls.lock().push("capture".to_owned());
        Box::new(AMBIENT.get())
    }

    fn replay(&self, snapshot: &(dyn Any + Send)) -> Box<dyn Any + Send> {
        let backup = AMBIENT.get();
        AMBIENT.set(*snapshot.downcast_ref::<i64>().unwrap());
        self.calls.lock().push("replay".to_owned());
        Box::new(backup)
    }

    fn restore(&self, backup: Box<dyn Any + Send>) {
        AMBIENT.set(*backup.downcast_ref::<i64>().unwrap());
        self.calls.lock().push("restore".to_owned());
    }
}

/// Reads the worker-side thread-local without crossing an await point.
fn ambient_probe_handler() -> ServiceHandler {
    Arc::new(|_args| Box::pin(async { Ok(serde_json::json!(AMBIENT.get())) }))
}

fn propagating_host(calls: Arc<Mutex<Vec<String>>>) -> TestHost {
    let factory = common::TestContainerFactory::new();
    let loader = common::StaticLoader::new();
    let permissions = common::TestPermissions::new();
    let sink = Arc::new(govkit::audit::MemoryAuditSink::new());
    let manager = ModuleManager::builder()
        .with_loader(loader.clone())
        .with_container_factory(factory.clone())
        .with_permissions(permissions.clone())
        .with_audit_sink(sink.clone())
        .add_propagator(Arc::new(AmbientPropagator { calls }))
        .build()
        .unwrap();
    TestHost {
        manager,
        factory,
        loader,
        permissions,
        sink,
    }
}

#[tokio::test]
async fn context_snapshot_is_replayed_on_the_worker_and_restored() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let host = propagating_host(calls.clone());
    host.factory.plan(
        "ctx",
        ContainerPlan::new().with_service("probe", ambient_probe_handler()),
    );
    host.manager
        .install(definition("ctx", "1.0.0"), ModuleSource::in_memory("ctx"))
        .await
        .unwrap();

    AMBIENT.set(42);
    let sid = ServiceId::parse("ctx:probe").unwrap();
    let reply = host
        .manager
        .invoke_service(&module_id("host"), &sid, vec![])
        .await
        .unwrap();

    assert_eq!(
        reply,
        Some(serde_json::json!(42)),
        "worker must observe the caller's ambient state"
    );
    assert_eq!(AMBIENT.get(), 42, "caller state untouched");
    assert_eq!(
        calls.lock().clone(),
        vec!["capture", "replay", "restore"],
        "restore must run on the success path"
    );
}

#[tokio::test]
async fn context_is_restored_when_the_handler_panics() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let host = propagating_host(calls.clone());
    host.factory.plan(
        "ctx",
        ContainerPlan::new().with_service(
            "boom",
            Arc::new(|_args| Box::pin(async { panic!("scripted panic") })),
        ),
    );
    host.manager
        .install(definition("ctx", "1.0.0"), ModuleSource::in_memory("ctx"))
        .await
        .unwrap();

    let sid = ServiceId::parse("ctx:boom").unwrap();
    let err = host
        .manager
        .invoke_service(&module_id("host"), &sid, vec![])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "INVOCATION_ERROR");
    assert_eq!(
        calls.lock().clone(),
        vec!["capture", "replay", "restore"],
        "restore must run on the crash path too"
    );
}
