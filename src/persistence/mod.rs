//! Persistence pipeline (§4.5): a bounded queue plus a background task that
//! bulk-flushes write records to the per-tenant store.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, warn};
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::PERSISTENCE_POLL_INTERVAL_MS;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::ErrorCapture;
use store::TenantStore;

/// A request/response pair (or request/error pair) awaiting a write.
/// Exactly one of `response` and `error` is set.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub tenant_id: Uuid,
    pub request: RequestEnvelope,
    pub response: Option<ResponseEnvelope>,
    pub error: Option<ErrorCapture>,
}

impl WriteRecord {
    pub fn success(tenant_id: Uuid, request: RequestEnvelope, response: ResponseEnvelope) -> Self {
        Self {
            tenant_id,
            request,
            response: Some(response),
            error: None,
        }
    }

    pub fn failure(tenant_id: Uuid, request: RequestEnvelope, error: ErrorCapture) -> Self {
        Self {
            tenant_id,
            request,
            response: None,
            error: Some(error),
        }
    }
}

/// The dispatcher-facing front for the queue. Cloning shares the same
/// bounded channel and drop counter.
#[derive(Clone)]
pub struct PersistenceQueue {
    tx: mpsc::Sender<WriteRecord>,
    dropped_writes: Arc<AtomicU64>,
}

impl PersistenceQueue {
    /// Never blocks. If the queue is at capacity the record is dropped and
    /// counted rather than stalling the request path (§4.5 invariant).
    pub fn enqueue(&self, record: WriteRecord) {
        if self.tx.try_send(record).is_err() {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            warn!("persistence queue full, dropping write record");
        }
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }
}

pub struct PersistencePipeline {
    rx: mpsc::Receiver<WriteRecord>,
    store: Arc<TenantStore>,
    max_bulk_write: usize,
    fuzzer_mode: bool,
}

impl PersistencePipeline {
    pub fn new(
        capacity: usize,
        max_bulk_write: usize,
        fuzzer_mode: bool,
        store: Arc<TenantStore>,
    ) -> (Self, PersistenceQueue) {
        let (tx, rx) = mpsc::channel(capacity);
        let dropped_writes = Arc::new(AtomicU64::new(0));
        let pipeline = Self {
            rx,
            store,
            max_bulk_write,
            fuzzer_mode,
        };
        let queue = PersistenceQueue { tx, dropped_writes };
        (pipeline, queue)
    }

    /// Runs the drain-and-flush loop until `shutdown` is cancelled. Storage
    /// failures are logged and isolated to the offending tenant's batch;
    /// the loop itself never exits except on shutdown (§4.5).
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(PERSISTENCE_POLL_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain_and_flush().await;
                    return;
                }
                _ = ticker.tick() => {
                    self.drain_and_flush().await;
                }
            }
        }
    }

    async fn drain_and_flush(&mut self) {
        let mut batch = Vec::with_capacity(self.max_bulk_write);
        while batch.len() < self.max_bulk_write {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            return;
        }

        let mut by_tenant: HashMap<Uuid, Vec<WriteRecord>> = HashMap::new();
        for record in batch {
            by_tenant.entry(record.tenant_id).or_default().push(record);
        }

        for (tenant_id, records) in by_tenant {
            if let Err(err) = self
                .store
                .flush_batch(tenant_id, records, self.fuzzer_mode)
                .await
            {
                error!("persistence flush failed for tenant {tenant_id}: {err:#}");
            }
        }
    }
}
