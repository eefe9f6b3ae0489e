//! Fan-out of fetched batches to table workers.
//!
//! Every worker has its own queue.  Sending never waits: a worker that falls
//! behind keeps accumulating batches, and the dispatcher warns once its
//! backlog goes above the configured depth.  No successful batch is ever
//! skipped for any worker.

use crate::source::{Batch, SourceAdapter, SourceError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, warn};

/// Sending half of a worker queue.
pub struct BatchSender {
    tx: mpsc::UnboundedSender<Batch>,
    pending: Arc<AtomicUsize>,
}

/// Receiving half of a worker queue.
pub struct BatchReceiver {
    rx: mpsc::UnboundedReceiver<Batch>,
    pending: Arc<AtomicUsize>,
}

/// Creates a worker queue.
pub fn batch_channel() -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        BatchSender {
            tx,
            pending: pending.clone(),
        },
        BatchReceiver { rx, pending },
    )
}

impl BatchSender {
    /// Queues `batch` and returns the number of batches now waiting, or the
    /// batch back if the receiver is gone.
    pub fn send(&self, batch: Batch) -> Result<usize, SendError<Batch>> {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(e) = self.tx.send(batch) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(pending)
    }
}

impl BatchReceiver {
    /// Next batch, or `None` once every sender is dropped and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Batch> {
        let batch = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(batch)
    }

    /// Batches queued but not yet received.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

struct Route {
    shard: String,
    table: String,
    warn_depth: usize,
    tx: BatchSender,
}

/// Outcome of one [`Dispatcher::fetch_and_distribute`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Distribution {
    /// Records in the fetched batch.
    pub records: usize,
    /// Queues the batch was added to.
    pub delivered: usize,
    /// Queues whose worker has exited.
    pub closed: usize,
    /// Queues holding more batches than their warning depth.
    pub lagging: usize,
}

/// Owns the sending half of every worker queue.
///
/// Dropping the dispatcher closes all queues, which is the workers' signal
/// to finish once they have drained what is left.
pub struct Dispatcher {
    source: Arc<dyn SourceAdapter>,
    routes: Vec<Route>,
}

impl Dispatcher {
    pub fn new(source: Arc<dyn SourceAdapter>) -> Self {
        Self {
            source,
            routes: Vec::new(),
        }
    }

    /// Opens a queue for one (shard, table) pair and returns its receiving
    /// end.  A backlog above `warn_depth` batches is logged on every
    /// delivery.
    pub fn register(&mut self, shard: &str, table: &str, warn_depth: usize) -> BatchReceiver {
        let (tx, rx) = batch_channel();
        self.routes.push(Route {
            shard: shard.to_string(),
            table: table.to_string(),
            warn_depth: warn_depth.max(1),
            tx,
        });
        rx
    }

    pub fn channels(&self) -> usize {
        self.routes.len()
    }

    pub fn source(&self) -> &Arc<dyn SourceAdapter> {
        &self.source
    }

    /// Fetches one batch and queues it for every worker.
    ///
    /// A fetch error is returned without delivering anything.
    pub async fn fetch_and_distribute(&self) -> Result<Distribution, SourceError> {
        let records = self.source.fetch_batch().await?;
        let batch: Batch = records.into();
        let mut distribution = Distribution {
            records: batch.len(),
            ..Distribution::default()
        };

        for route in &self.routes {
            match route.tx.send(batch.clone()) {
                Ok(pending) => {
                    distribution.delivered += 1;
                    if pending > route.warn_depth {
                        warn!(
                            "worker for {}.{} is falling behind: {pending} batches queued",
                            route.shard, route.table
                        );
                        distribution.lagging += 1;
                    }
                }
                Err(_) => {
                    warn!(
                        "worker for {}.{} has exited, batch not delivered",
                        route.shard, route.table
                    );
                    distribution.closed += 1;
                }
            }
        }

        debug!(
            "distributed {} records to {}/{} workers",
            distribution.records,
            distribution.delivered,
            self.routes.len()
        );
        Ok(distribution)
    }
}
