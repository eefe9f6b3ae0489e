//! The polling loop.
//!
//! Repeatedly fetches and fans out a batch, then sleeps for the source's poll
//! interval.  Failed fetches, and intervals that cannot be used, are followed
//! by a fixed backoff instead.  The loop ends when the stop token is
//! cancelled, and dropping its dispatcher closes every worker channel.

use crate::dispatch::Dispatcher;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerReport {
    /// Completed fetch attempts.
    pub ticks: usize,
    /// Cycles that ended in a backoff.
    pub failures: usize,
}

pub struct Poller {
    dispatcher: Dispatcher,
    fetch_backoff: Duration,
}

impl Poller {
    pub fn new(dispatcher: Dispatcher, fetch_backoff: Duration) -> Self {
        Self {
            dispatcher,
            fetch_backoff,
        }
    }

    pub async fn run(self, stop: CancellationToken) -> PollerReport {
        self.run_inner(stop).instrument(info_span!("poller")).await
    }

    async fn run_inner(self, stop: CancellationToken) -> PollerReport {
        let mut report = PollerReport::default();
        info!(
            "polling started, fanning out to {} tables",
            self.dispatcher.channels()
        );

        loop {
            let delay = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                result = self.dispatcher.fetch_and_distribute() => {
                    report.ticks += 1;
                    match result {
                        Ok(distribution) => {
                            debug!("fetched {} records", distribution.records);
                            self.next_delay(&mut report)
                        }
                        Err(e) => {
                            warn!("fetch failed, retrying in {:?}: {e}", self.fetch_backoff);
                            report.failures += 1;
                            self.fetch_backoff
                        }
                    }
                }
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(
            "polling stopped after {} fetches, closing worker channels",
            report.ticks
        );
        drop(self);
        report
    }

    /// Delay before the next fetch after a successful one.
    fn next_delay(&self, report: &mut PollerReport) -> Duration {
        match self.dispatcher.source().poll_interval_secs() {
            Ok(0) => {
                warn!(
                    "source reported a poll interval of 0 seconds, retrying in {:?}",
                    self.fetch_backoff
                );
                report.failures += 1;
                self.fetch_backoff
            }
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                warn!(
                    "failed to read the poll interval, retrying in {:?}: {e}",
                    self.fetch_backoff
                );
                report.failures += 1;
                self.fetch_backoff
            }
        }
    }
}
