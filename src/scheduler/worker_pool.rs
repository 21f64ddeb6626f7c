//! Fixed-size worker pool: per-endpoint in-flight dedup, jitter, bounded
//! concurrency via `Semaphore`, and a bounded grace period on the storage
//! handoff. Grounded on `fusillade`'s `Daemon` (`JoinSet` +
//! `try_acquire_owned` + `scopeguard::guard` in-flight counter decrement).

use crate::logging::LogSink;
use crate::model::Endpoint;
use crate::probe::{error_result, Prober};
use crate::storage::Storage;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Jitter is capped at 10% of the tick interval, and never more than this.
const MAX_JITTER: Duration = Duration::from_secs(5);

/// How long a probe's completed Result waits for `Storage::append` before it
/// is dropped (§4.2: "a bounded grace period").
const STORAGE_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    completed_count: Arc<AtomicU64>,
    skipped_count: Arc<AtomicU64>,
    dropped_count: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            completed_count: Arc::new(AtomicU64::new(0)),
            skipped_count: Arc::new(AtomicU64::new(0)),
            dropped_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn active_count(&self) -> usize {
        self.size.saturating_sub(self.semaphore.available_permits())
    }

    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped_count.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    /// Dispatches one tick's worth of jobs, skipping any endpoint already
    /// in flight (P6: at most one probe per endpoint at any instant).
    pub async fn dispatch_tick(
        self: &Arc<Self>,
        endpoints: Vec<Endpoint>,
        prober: Arc<dyn Prober>,
        storage: Storage,
        logger: Arc<dyn LogSink>,
        cancel: CancellationToken,
        interval: Duration,
        join_set: &mut JoinSet<()>,
    ) {
        for endpoint in endpoints {
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                if in_flight.contains(&endpoint.id) {
                    self.skipped_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                in_flight.insert(endpoint.id.clone());
            }

            let pool = self.clone();
            let prober = prober.clone();
            let storage = storage.clone();
            let logger = logger.clone();
            let cancel = cancel.clone();
            let jitter = jitter_for(interval);

            join_set.spawn(async move {
                let endpoint_id = endpoint.id.clone();
                let _guard = scopeguard::guard(endpoint_id.clone(), {
                    let in_flight = pool.in_flight.clone();
                    move |id| {
                        in_flight.lock().unwrap().remove(&id);
                    }
                });

                tokio::select! {
                    _ = tokio::time::sleep(jitter) => {}
                    _ = cancel.cancelled() => return,
                }

                let permit = tokio::select! {
                    permit = pool.semaphore.clone().acquire_owned() => permit,
                    _ = cancel.cancelled() => return,
                };
                let Ok(_permit) = permit else { return };

                // A probe already underway is raced against shutdown cancellation
                // rather than left to run to its own deadline: higher-up
                // cancellation must surface as an `error` Result with a
                // "cancelled" message (distinct from a deadline-triggered
                // `timeout`), per the probe cancellation contract.
                let record = tokio::select! {
                    record = prober.probe(&endpoint, endpoint.timeout) => record,
                    _ = cancel.cancelled() => {
                        error_result(&endpoint, "cancelled: scheduler shutdown")
                    }
                };
                pool.completed_count.fetch_add(1, Ordering::Relaxed);

                match tokio::time::timeout(STORAGE_GRACE_PERIOD, storage.append(record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        pool.dropped_count.fetch_add(1, Ordering::Relaxed);
                        logger.warn(
                            "scheduler",
                            &format!("dropped result for {endpoint_id}: storage append failed: {e}"),
                        );
                    }
                    Err(_) => {
                        pool.dropped_count.fetch_add(1, Ordering::Relaxed);
                        logger.warn(
                            "scheduler",
                            &format!("dropped result for {endpoint_id}: storage append exceeded grace period"),
                        );
                    }
                }
            });
        }
    }
}

fn jitter_for(interval: Duration) -> Duration {
    let cap = (interval.mul_f64(0.10)).min(MAX_JITTER);
    if cap.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=cap.as_millis().max(1) as u64);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_never_exceeds_ten_percent_or_five_seconds() {
        for _ in 0..100 {
            let j = jitter_for(Duration::from_secs(120));
            assert!(j <= Duration::from_secs(12));
        }
        for _ in 0..100 {
            let j = jitter_for(Duration::from_secs(3600));
            assert!(j <= MAX_JITTER);
        }
    }

    #[test]
    fn new_pool_has_full_capacity_and_zero_counters() {
        let pool = WorkerPool::new(4);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.completed_count(), 0);
        assert_eq!(pool.skipped_count(), 0);
        assert_eq!(pool.dropped_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_probe_records_a_cancelled_error_result() {
        use crate::logging::NullSink;
        use crate::model::{Detail, Protocol, ResultRecord, Status};
        use async_trait::async_trait;

        struct SlowProber;

        #[async_trait]
        impl Prober for SlowProber {
            async fn probe(&self, endpoint: &Endpoint, _deadline: Duration) -> ResultRecord {
                tokio::time::sleep(Duration::from_secs(5)).await;
                ResultRecord {
                    timestamp: chrono::Utc::now(),
                    endpoint_id: endpoint.id.clone(),
                    protocol: endpoint.protocol,
                    status: Status::Success,
                    latency_ms: Some(1.0),
                    error: None,
                    detail: None::<Detail>,
                }
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let pool = Arc::new(WorkerPool::new(4));
        let prober: Arc<dyn Prober> = Arc::new(SlowProber);
        let logger: Arc<dyn LogSink> = Arc::new(NullSink);
        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();

        let endpoint = Endpoint {
            id: "slow".into(),
            region: "r1".into(),
            name: "slow".into(),
            protocol: Protocol::Tcp,
            address: "127.0.0.1:1".into(),
            timeout: Duration::from_secs(30),
            enabled: true,
            follow_redirects: false,
            user_agent: None,
            verify_tls: true,
        };

        // A short interval keeps the pre-probe jitter window (capped at 10%
        // of it) well under the grace period below, so the later cancel is
        // guaranteed to land while the slow probe is in flight rather than
        // during jitter/permit-acquire.
        pool.dispatch_tick(
            vec![endpoint],
            prober,
            storage.clone(),
            logger,
            cancel.clone(),
            Duration::from_millis(50),
            &mut join_set,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        join_set.join_next().await.unwrap().unwrap();

        let now = chrono::Utc::now();
        let results = storage
            .read_range(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::Error);
        assert!(results[0].error.as_ref().unwrap().contains("cancelled"));
    }
}
