//! Table workers.
//!
//! Each worker drains the channel of one (shard, table) pair and writes every
//! record of every batch in its own transaction.  A record that cannot be
//! written is rolled back and skipped; the rest of the batch still goes in.

use crate::dispatch::BatchReceiver;
use crate::source::{Batch, SourceAdapter, Value};
use crate::store::{InsertStatement, ShardStore, StoreConnection, StoreError};
use shardfeed_types::PipelineSettings;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How often, and how patiently, a worker retries connectivity failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            retries: settings.acquire_retries,
            backoff: settings.retry_backoff(),
        }
    }
}

/// Counters returned by a worker when its channel closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub shard: String,
    pub table: String,
    pub batches: usize,
    pub inserted: usize,
    pub failed: usize,
    /// Batches abandoned because no connection could be acquired.
    pub dropped_batches: usize,
}

enum RecordError {
    Write(StoreError),
    Commit(StoreError),
}

impl RecordError {
    fn is_temporary(&self) -> bool {
        matches!(self, RecordError::Write(e) if e.is_temporary())
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Write(e) => write!(f, "{e}"),
            RecordError::Commit(e) => write!(f, "commit failed: {e}"),
        }
    }
}

pub struct TableWorker {
    shard: String,
    table: String,
    statement: InsertStatement,
    source: Arc<dyn SourceAdapter>,
    store: Arc<dyn ShardStore>,
    retry: RetryPolicy,
}

impl TableWorker {
    pub fn new(
        shard: &str,
        table: &str,
        source: Arc<dyn SourceAdapter>,
        store: Arc<dyn ShardStore>,
        retry: RetryPolicy,
    ) -> Self {
        let statement = InsertStatement::new(shard, table, &source.field_names());
        Self {
            shard: shard.to_string(),
            table: table.to_string(),
            statement,
            source,
            store,
            retry,
        }
    }

    /// Processes batches until the channel is closed and drained.
    pub async fn run(self, rx: BatchReceiver) -> WorkerReport {
        let span = info_span!("table_worker", shard = %self.shard, table = %self.table);
        self.run_inner(rx).instrument(span).await
    }

    async fn run_inner(self, mut rx: BatchReceiver) -> WorkerReport {
        let mut report = WorkerReport {
            shard: self.shard.clone(),
            table: self.table.clone(),
            ..WorkerReport::default()
        };
        debug!("worker started");

        while let Some(batch) = rx.recv().await {
            report.batches += 1;
            self.write_batch(&batch, &mut report).await;
        }

        info!(
            "worker finished: {} batches, {} records inserted, {} failed",
            report.batches, report.inserted, report.failed
        );
        report
    }

    async fn write_batch(&self, batch: &Batch, report: &mut WorkerReport) {
        let Some(mut conn) = self.acquire().await else {
            error!("dropping batch of {} records: no connection available", batch.len());
            report.failed += batch.len();
            report.dropped_batches += 1;
            return;
        };

        for (index, record) in batch.iter().enumerate() {
            let values = match self.source.extract_values(record) {
                Ok(values) if values.len() == self.statement.arity() => values,
                Ok(values) => {
                    warn!(
                        "skipping record {index}: {} values for {} columns",
                        values.len(),
                        self.statement.arity()
                    );
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("skipping record {index}: {e}");
                    report.failed += 1;
                    continue;
                }
            };

            let mut retries = 0;
            loop {
                match self.write_record(conn.as_mut(), &values).await {
                    Ok(()) => {
                        report.inserted += 1;
                        break;
                    }
                    Err(e) if e.is_temporary() && retries < self.retry.retries => {
                        retries += 1;
                        warn!(
                            "connection lost while writing record {index}, retrying on a new connection ({retries}/{}): {e}",
                            self.retry.retries
                        );
                        drop(conn);
                        match self.acquire().await {
                            Some(fresh) => conn = fresh,
                            None => {
                                let remaining = batch.len() - index;
                                error!("abandoning the remaining {remaining} records of the batch: no connection available");
                                report.failed += remaining;
                                report.dropped_batches += 1;
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "failed to write record {index} into {}.{}: {e}",
                            self.shard, self.table
                        );
                        report.failed += 1;
                        break;
                    }
                }
            }
        }
    }

    /// Writes one record in its own transaction, rolling back on failure.
    async fn write_record(
        &self,
        conn: &mut dyn StoreConnection,
        values: &[Value],
    ) -> Result<(), RecordError> {
        conn.begin().await.map_err(RecordError::Write)?;

        if let Err(e) = conn.insert(&self.statement, values).await {
            if let Err(rollback_error) = conn.rollback().await {
                warn!("failed to roll back transaction: {rollback_error}");
            }
            return Err(RecordError::Write(e));
        }

        conn.commit().await.map_err(RecordError::Commit)
    }

    /// Takes a connection from the pool, retrying temporary failures.
    async fn acquire(&self) -> Option<Box<dyn StoreConnection>> {
        let mut retries = 0;
        loop {
            match self.store.acquire().await {
                Ok(conn) => return Some(conn),
                Err(e) if e.is_temporary() && retries < self.retry.retries => {
                    retries += 1;
                    warn!(
                        "failed to acquire a connection, retrying in {:?} ({retries}/{}): {e}",
                        self.retry.backoff, self.retry.retries
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(e) => {
                    error!("failed to acquire a connection: {e}");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{RetryPolicy, TableWorker, WorkerReport};
    use crate::dispatch::batch_channel;
    use crate::source::{MockSourceAdapter, Record, SourceAdapter, Value};
    use crate::test::{init_test_logger, FakeSource, MockStore};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const RETRY: RetryPolicy = RetryPolicy {
        retries: 3,
        backoff: Duration::from_secs(1),
    };

    async fn run_worker(
        store: &MockStore,
        source: Arc<dyn SourceAdapter>,
        batches: Vec<Vec<Record>>,
    ) -> WorkerReport {
        init_test_logger();
        let (tx, rx) = batch_channel();
        for batch in batches {
            tx.send(batch.into()).unwrap();
        }
        drop(tx);

        TableWorker::new("prefix1", "events", source, Arc::new(store.clone()), RETRY)
            .run(rx)
            .await
    }

    fn row(id: i64, name: &str) -> Vec<Value> {
        vec![Value::Int(id), Value::Text(name.to_string())]
    }

    #[tokio::test]
    async fn writes_every_record_in_order() {
        let store = MockStore::new();
        let report = run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![
                vec![FakeSource::record(1, "a"), FakeSource::record(2, "b")],
                vec![FakeSource::record(3, "c")],
            ],
        )
        .await;

        assert_eq!(
            report,
            WorkerReport {
                shard: "prefix1".to_string(),
                table: "events".to_string(),
                batches: 2,
                inserted: 3,
                failed: 0,
                dropped_batches: 0,
            }
        );
        assert_eq!(
            store.committed("prefix1", "events"),
            vec![row(1, "a"), row(2, "b"), row(3, "c")]
        );
    }

    #[tokio::test]
    async fn failed_insert_is_isolated() {
        let store = MockStore::new();
        store.reject_values_where(|values| values[0] == Value::Int(2));

        let report = run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![vec![
                FakeSource::record(1, "a"),
                FakeSource::record(2, "b"),
                FakeSource::record(3, "c"),
            ]],
        )
        .await;

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.attempts().len(), 3);
        assert_eq!(store.rollbacks(), 1);
        assert_eq!(
            store.committed("prefix1", "events"),
            vec![row(1, "a"), row(3, "c")]
        );
    }

    #[tokio::test]
    async fn failed_rollback_still_skips_only_that_record() {
        let store = MockStore::new();
        store.reject_values_where(|values| values[0] == Value::Int(1));
        store.failing_rollbacks(1);

        let report = run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![vec![FakeSource::record(1, "a"), FakeSource::record(2, "b")]],
        )
        .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.rollbacks(), 1);
        // The original insert error decides the outcome, so no retry.
        assert_eq!(store.attempts().len(), 2);
        assert_eq!(store.committed("prefix1", "events"), vec![row(2, "b")]);
    }

    #[tokio::test]
    async fn malformed_record_is_skipped() {
        let store = MockStore::new();
        let report = run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![vec![
                FakeSource::record(1, "a"),
                serde_json::json!({ "id": "two" }),
                FakeSource::record(3, "c"),
            ]],
        )
        .await;

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 1);
        // Never reached the store.
        assert_eq!(store.attempts().len(), 2);
    }

    #[tokio::test]
    async fn value_count_must_match_columns() {
        let mut source = MockSourceAdapter::new();
        source
            .expect_field_names()
            .returning(|| vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        source
            .expect_extract_values()
            .returning(|_| Ok(vec![Value::Int(1), Value::Int(2)]));

        let store = MockStore::new();
        let report = run_worker(
            &store,
            Arc::new(source),
            vec![vec![serde_json::json!({})]],
        )
        .await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.inserted, 0);
        assert!(store.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_connection_retries_the_same_record() {
        let store = MockStore::new();
        store.unavailable_inserts(1);

        let report = run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![vec![FakeSource::record(1, "a"), FakeSource::record(2, "b")]],
        )
        .await;

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(store.attempts().len(), 3);
        assert_eq!(store.attempts()[0], store.attempts()[1]);
        assert_eq!(store.acquired(), 2);
        assert_eq!(
            store.committed("prefix1", "events"),
            vec![row(1, "a"), row(2, "b")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_store_drops_the_batch() {
        let store = MockStore::new();
        // One attempt plus three retries.
        store.unavailable_acquires(4);

        let started = tokio::time::Instant::now();
        let report = run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![
                vec![FakeSource::record(1, "a"), FakeSource::record(2, "b")],
                vec![FakeSource::record(3, "c")],
            ],
        )
        .await;

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(report.dropped_batches, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(store.committed("prefix1", "events"), vec![row(3, "c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn connections_are_always_released() {
        let store = MockStore::new();
        store.unavailable_inserts(2);
        store.reject_values_where(|values| values[0] == Value::Int(1));

        run_worker(
            &store,
            Arc::new(FakeSource::new(1)),
            vec![
                vec![FakeSource::record(1, "a"), FakeSource::record(2, "b")],
                vec![FakeSource::record(3, "c")],
                vec![],
            ],
        )
        .await;

        assert!(store.acquired() > 0);
        assert_eq!(store.acquired(), store.released());
    }
}
