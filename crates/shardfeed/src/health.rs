//! Periodic liveness probing of idle pool connections.

use crate::store::ShardStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one probing round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRound {
    pub checked_at: DateTime<Utc>,
    pub probed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub rounds: usize,
    pub failed_pings: usize,
}

/// Evicts expired connections, then pings as many connections as are idle.
///
/// Connections are taken one at a time and returned right after the ping.
/// A connection that fails its ping is left for the pool to discard.
pub async fn probe_idle_connections(store: &dyn ShardStore) -> ProbeRound {
    store.evict_expired();

    let idle = store.idle_connections();
    let mut round = ProbeRound {
        checked_at: Utc::now(),
        probed: 0,
        failed: 0,
    };

    for _ in 0..idle {
        let mut conn = match store.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("health check could not acquire a connection: {e}");
                round.failed += 1;
                continue;
            }
        };
        round.probed += 1;
        if let Err(e) = conn.ping().await {
            warn!("health check ping failed: {e}");
            round.failed += 1;
        }
    }

    debug!(
        "health check at {}: {} connections probed, {} failed",
        round.checked_at, round.probed, round.failed
    );
    round
}

/// Probes the pool every `interval` until `stop` is cancelled.
pub async fn run_health_checks(
    store: Arc<dyn ShardStore>,
    interval: Duration,
    stop: CancellationToken,
) -> HealthReport {
    let mut report = HealthReport::default();
    info!("connection health checks every {interval:?}");

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let round = probe_idle_connections(store.as_ref()).await;
        report.rounds += 1;
        report.failed_pings += round.failed;
    }

    debug!("health checks stopped after {} rounds", report.rounds);
    report
}

#[cfg(test)]
mod test {
    use super::{probe_idle_connections, run_health_checks};
    use crate::test::MockStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn pings_every_idle_connection() {
        let store = MockStore::new();
        store.set_idle_connections(3);
        store.failing_pings(1);

        let round = probe_idle_connections(&store).await;
        assert_eq!(round.probed, 3);
        assert_eq!(round.failed, 1);
        assert_eq!(store.pings(), 3);
        assert_eq!(store.evictions(), 1);
        assert_eq!(store.acquired(), store.released());
    }

    #[tokio::test]
    async fn acquire_failure_is_not_fatal() {
        let store = MockStore::new();
        store.set_idle_connections(2);
        store.unavailable_acquires(1);

        let round = probe_idle_connections(&store).await;
        assert_eq!(round.probed, 1);
        assert_eq!(round.failed, 1);
        assert_eq!(store.pings(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_until_stopped() {
        let store = MockStore::new();
        store.set_idle_connections(1);
        let stop = CancellationToken::new();
        let health = tokio::spawn(run_health_checks(
            Arc::new(store.clone()),
            Duration::from_secs(60),
            stop.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        stop.cancel();
        let report = health.await.unwrap();

        assert_eq!(report.rounds, 2);
        assert_eq!(store.pings(), 2);
    }
}
