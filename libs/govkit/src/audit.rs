//! Asynchronous audit recording.
//!
//! Governed calls hand records to the [`AuditManager`], which forwards them to
//! the configured sink on a background task. Recording never blocks or fails
//! the call being audited.

use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::ModuleId;

/// One audit entry for a governed call.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub caller: ModuleId,
    pub target: ModuleId,
    pub action: String,
    pub args_digest: String,
    pub allowed: bool,
    pub success: bool,
    pub duration_ms: u64,
    pub trace_id: Uuid,
    pub recorded_at: SystemTime,
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// In-memory sink for tests and embedded hosts.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: parking_lot::Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/// Sink that emits records as structured log events. The builder default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            caller = %record.caller,
            target = %record.target,
            action = %record.action,
            allowed = record.allowed,
            success = record.success,
            duration_ms = record.duration_ms,
            trace_id = %record.trace_id,
            "audit"
        );
    }
}

/// Hands records to the sink off the caller's path.
pub struct AuditManager {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditManager {
    /// Spawns the background recorder. Must be called on a tokio runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.record(record);
            }
            tracing::debug!("audit recorder drained and stopped");
        });
        Self { tx }
    }

    /// Enqueues a record. Silently drops it when the recorder is gone
    /// (manager shutdown races are not worth failing a call over).
    pub fn record(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            tracing::warn!("audit recorder is gone; dropping record");
        }
    }

    /// Stable digest of call arguments; raw arguments never reach the sink.
    #[must_use]
    pub fn digest_args(args: &[serde_json::Value]) -> String {
        let mut hasher = Sha256::new();
        for arg in args {
            hasher.update(arg.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

impl std::fmt::Debug for AuditManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditManager")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(caller: &str) -> AuditRecord {
        AuditRecord {
            caller: ModuleId::new(caller).unwrap(),
            target: ModuleId::new("svc").unwrap(),
            action: "hello".to_owned(),
            args_digest: AuditManager::digest_args(&[serde_json::json!("World")]),
            allowed: true,
            success: true,
            duration_ms: 3,
            trace_id: Uuid::now_v7(),
            recorded_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn records_reach_the_sink() {
        let sink = Arc::new(MemoryAuditSink::new());
        let manager = AuditManager::new(sink.clone());

        manager.record(record("host"));
        manager.record(record("host"));

        // The recorder runs on a background task; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sink.len(), 2);
        assert!(sink.snapshot().iter().all(|r| r.allowed && r.success));
    }

    #[test]
    fn digest_is_stable_and_order_sensitive() {
        let a = [serde_json::json!("x"), serde_json::json!(1)];
        let b = [serde_json::json!(1), serde_json::json!("x")];
        assert_eq!(AuditManager::digest_args(&a), AuditManager::digest_args(&a));
        assert_ne!(AuditManager::digest_args(&a), AuditManager::digest_args(&b));
        assert_eq!(AuditManager::digest_args(&a).len(), 32);
    }
}
