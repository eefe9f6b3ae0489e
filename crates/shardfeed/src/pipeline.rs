//! Pipeline lifecycle: startup, steady state, and orderly shutdown.

use crate::dispatch::Dispatcher;
use crate::health::{run_health_checks, HealthReport};
use crate::poller::{Poller, PollerReport};
use crate::source::SourceAdapter;
use crate::store::ShardStore;
use crate::topology::{ShardTopology, TopologyBuilder};
use crate::worker::{RetryPolicy, TableWorker, WorkerReport};
use shardfeed_types::{PipelineSettings, ShardsConfig};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{task} task failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: JoinError,
    },
}

impl PipelineError {
    fn task_failed(task: impl Into<String>, source: JoinError) -> Self {
        Self::TaskFailed {
            task: task.into(),
            source,
        }
    }
}

/// Everything the pipeline did between start and stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub poller: PollerReport,
    pub workers: Vec<WorkerReport>,
    pub health: HealthReport,
}

impl PipelineReport {
    pub fn inserted(&self) -> usize {
        self.workers.iter().map(|w| w.inserted).sum()
    }

    pub fn failed(&self) -> usize {
        self.workers.iter().map(|w| w.failed).sum()
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Materializes the topology, then starts one worker per table, the
    /// polling loop, and the connection health checks.
    pub async fn start(
        shards: &ShardsConfig,
        settings: &PipelineSettings,
        source: Arc<dyn SourceAdapter>,
        store: Arc<dyn ShardStore>,
    ) -> PipelineHandle {
        let topology = TopologyBuilder::new(store.as_ref())
            .build(shards, &source.table_prefix(), &source.schema())
            .await;

        let retry = RetryPolicy::from_settings(settings);
        let mut dispatcher = Dispatcher::new(source.clone());
        let workers = topology
            .pairs()
            .map(|(shard, table)| {
                let rx = dispatcher.register(shard, table, settings.queue_depth);
                let worker = TableWorker::new(shard, table, source.clone(), store.clone(), retry);
                tokio::spawn(worker.run(rx))
            })
            .collect::<Vec<_>>();

        let stop = CancellationToken::new();
        let poller = tokio::spawn(
            Poller::new(dispatcher, settings.fetch_backoff()).run(stop.clone()),
        );
        let health = tokio::spawn(run_health_checks(
            store,
            settings.health_check_interval(),
            stop.clone(),
        ));

        info!(
            "pipeline started: {} workers across {} shards",
            workers.len(),
            topology.shards().len()
        );

        PipelineHandle {
            topology,
            stop,
            poller,
            workers,
            health,
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    topology: ShardTopology,
    stop: CancellationToken,
    poller: JoinHandle<PollerReport>,
    workers: Vec<JoinHandle<WorkerReport>>,
    health: JoinHandle<HealthReport>,
}

impl PipelineHandle {
    pub fn topology(&self) -> &ShardTopology {
        &self.topology
    }

    /// Stops polling, waits for every worker to drain its channel, and
    /// collects the reports.
    pub async fn stop(self) -> Result<PipelineReport, PipelineError> {
        info!("stopping pipeline");
        self.stop.cancel();

        // The poller owns the senders; once it returns every channel is
        // closed and the workers finish after draining what is queued.
        let poller = self
            .poller
            .await
            .map_err(|e| PipelineError::task_failed("polling", e))?;

        let mut workers = Vec::with_capacity(self.workers.len());
        let mut first_error = None;
        for handle in self.workers {
            match handle.await {
                Ok(report) => workers.push(report),
                Err(e) => {
                    error!("table worker task failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(PipelineError::task_failed("table worker", e));
                    }
                }
            }
        }

        let health = self
            .health
            .await
            .map_err(|e| PipelineError::task_failed("health check", e))?;

        if let Some(e) = first_error {
            return Err(e);
        }

        let report = PipelineReport {
            poller,
            workers,
            health,
        };
        info!(
            "pipeline stopped: {} workers done, {} records inserted, {} failed",
            report.workers.len(),
            report.inserted(),
            report.failed()
        );
        Ok(report)
    }
}
