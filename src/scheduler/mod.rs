//! Scheduler: a command-channel actor owning tick cadence, endpoint
//! snapshot distribution, and the worker pool. Expressed as an actor/task
//! taking commands on a channel plus a tick source, per the teacher-absent
//! pattern enriched from `fusillade`'s `Daemon` and `dwctl`'s
//! `OnwardsConfigSync` (config distributed via `tokio::sync::watch`).

pub mod worker_pool;

use crate::error::{EngineError, EngineResult};
use crate::logging::{default_sink, LogSink};
use crate::model::config::ConfigSnapshot;
use crate::model::ResultRecord;
use crate::probe::Prober;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use worker_pool::WorkerPool;

/// Hard maximum drain time on `Stop()`; any worker still running past this
/// is abandoned and its Result discarded (§5).
const HARD_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval: Duration,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub active_count: usize,
    pub completed_count: u64,
    pub skipped_count: u64,
    pub dropped_count: u64,
}

enum Command {
    Start(oneshot::Sender<EngineResult<()>>),
    Stop(oneshot::Sender<EngineResult<()>>),
    UpdateInterval(Duration, oneshot::Sender<EngineResult<()>>),
    Status(oneshot::Sender<SchedulerStatus>),
    RunManualTest(String, oneshot::Sender<EngineResult<ResultRecord>>),
}

/// Handle to the scheduler actor. Cloning shares the same underlying task.
#[derive(Clone)]
pub struct Scheduler {
    cmd_tx: mpsc::Sender<Command>,
    config_tx: watch::Sender<Arc<ConfigSnapshot>>,
}

impl Scheduler {
    pub fn new(
        initial_config: Arc<ConfigSnapshot>,
        storage: Storage,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self::with_logger(initial_config, storage, prober, default_sink())
    }

    pub fn with_logger(
        initial_config: Arc<ConfigSnapshot>,
        storage: Storage,
        prober: Arc<dyn Prober>,
        logger: Arc<dyn LogSink>,
    ) -> Self {
        let pool_size = initial_config.worker_pool_size.max(1);
        let initial_interval = initial_config.scheduler_interval;
        let (config_tx, config_rx) = watch::channel(initial_config);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        tokio::spawn(run_actor(
            cmd_rx,
            config_rx,
            storage,
            prober,
            logger,
            pool_size,
            initial_interval,
        ));

        Self { cmd_tx, config_tx }
    }

    pub async fn start(&self) -> EngineResult<()> {
        self.send(Command::Start).await
    }

    pub async fn stop(&self) -> EngineResult<()> {
        self.send(Command::Stop).await
    }

    pub async fn update_interval(&self, interval: Duration) -> EngineResult<()> {
        if interval < Duration::from_secs(60) || interval > Duration::from_secs(24 * 3600) {
            return Err(EngineError::validation(
                "scheduler interval must be between 1 minute and 24 hours",
            ));
        }
        self.send(|reply| Command::UpdateInterval(interval, reply)).await
    }

    /// Atomically replaces the endpoint/region snapshot subsequent ticks
    /// use; in-flight probes keep running against the snapshot they started
    /// with (they already hold a cloned `Endpoint`, not a reference).
    pub fn reload_config(&self, snapshot: Arc<ConfigSnapshot>) {
        let _ = self.config_tx.send(snapshot);
    }

    pub async fn status(&self) -> EngineResult<SchedulerStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Status(reply_tx))
            .await
            .map_err(|_| EngineError::fatal("scheduler actor has stopped"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::fatal("scheduler actor dropped the reply channel"))
    }

    /// Synchronous single probe bypassing the scheduler queue entirely, but
    /// still recorded via Storage.
    pub async fn run_manual_test(&self, endpoint_id: impl Into<String>) -> EngineResult<ResultRecord> {
        self.send(|reply| Command::RunManualTest(endpoint_id.into(), reply)).await
    }

    async fn send<T>(&self, make: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> Command) -> EngineResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::fatal("scheduler actor has stopped"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::fatal("scheduler actor dropped the reply channel"))?
    }
}

async fn run_actor(
    mut cmd_rx: mpsc::Receiver<Command>,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    storage: Storage,
    prober: Arc<dyn Prober>,
    logger: Arc<dyn LogSink>,
    pool_size: usize,
    mut interval: Duration,
) {
    let mut state = SchedulerState::Stopped;
    let mut pool: Option<Arc<WorkerPool>> = None;
    let mut cancel: Option<CancellationToken> = None;
    let mut ticker: Option<tokio::time::Interval> = None;
    let mut join_set: JoinSet<()> = JoinSet::new();
    let mut last_run: Option<DateTime<Utc>> = None;
    let mut next_run: Option<DateTime<Utc>> = None;

    loop {
        tokio::select! {
            biased;

            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    Command::Start(reply) => {
                        if state == SchedulerState::Running {
                            let _ = reply.send(Ok(()));
                            continue;
                        }
                        state = SchedulerState::Starting;
                        pool = Some(Arc::new(WorkerPool::new(pool_size)));
                        cancel = Some(CancellationToken::new());
                        let mut new_ticker = tokio::time::interval(interval);
                        new_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        new_ticker.tick().await; // consume the immediate first tick
                        next_run = Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_default());
                        ticker = Some(new_ticker);
                        state = SchedulerState::Running;
                        logger.info("scheduler", "started");
                        let _ = reply.send(Ok(()));
                    }
                    Command::Stop(reply) => {
                        if state != SchedulerState::Running {
                            state = SchedulerState::Stopped;
                            let _ = reply.send(Ok(()));
                            continue;
                        }
                        state = SchedulerState::Stopping;
                        if let Some(c) = cancel.take() {
                            c.cancel();
                        }
                        ticker = None;
                        let drained = tokio::time::timeout(HARD_DRAIN_TIMEOUT, async {
                            while join_set.join_next().await.is_some() {}
                        })
                        .await;
                        if drained.is_err() {
                            logger.warn("scheduler", "hard drain timeout exceeded; abandoning remaining workers");
                            join_set.abort_all();
                        }
                        pool = None;
                        state = SchedulerState::Stopped;
                        last_run = None;
                        next_run = None;
                        logger.info("scheduler", "stopped");
                        let _ = reply.send(Ok(()));
                    }
                    Command::UpdateInterval(new_interval, reply) => {
                        interval = new_interval;
                        if state == SchedulerState::Running {
                            let mut new_ticker = tokio::time::interval(interval);
                            new_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            new_ticker.tick().await;
                            ticker = Some(new_ticker);
                            next_run = Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_default());
                        }
                        let _ = reply.send(Ok(()));
                    }
                    Command::Status(reply) => {
                        let status = SchedulerStatus {
                            running: state == SchedulerState::Running,
                            interval,
                            last_run,
                            next_run,
                            active_count: pool.as_ref().map_or(0, |p| p.active_count()),
                            completed_count: pool.as_ref().map_or(0, |p| p.completed_count()),
                            skipped_count: pool.as_ref().map_or(0, |p| p.skipped_count()),
                            dropped_count: pool.as_ref().map_or(0, |p| p.dropped_count()),
                        };
                        let _ = reply.send(status);
                    }
                    Command::RunManualTest(endpoint_id, reply) => {
                        let endpoint = config_rx
                            .borrow()
                            .endpoints
                            .iter()
                            .find(|e| e.id == endpoint_id)
                            .cloned();
                        let Some(endpoint) = endpoint else {
                            let _ = reply.send(Err(EngineError::validation(format!(
                                "unknown endpoint id: {endpoint_id}"
                            ))));
                            continue;
                        };
                        let prober = prober.clone();
                        let storage = storage.clone();
                        tokio::spawn(async move {
                            let record = prober.probe(&endpoint, endpoint.timeout).await;
                            let outcome = storage.append(record.clone()).await.map(|_| record);
                            let _ = reply.send(outcome);
                        });
                    }
                }
            }

            _ = async { ticker.as_mut().unwrap().tick().await }, if state == SchedulerState::Running && ticker.is_some() => {
                last_run = Some(Utc::now());
                next_run = Some(Utc::now() + chrono::Duration::from_std(interval).unwrap_or_default());
                let endpoints: Vec<_> = config_rx.borrow().enabled_endpoints().cloned().collect();
                if let (Some(pool), Some(cancel)) = (&pool, &cancel) {
                    pool.dispatch_tick(
                        endpoints,
                        prober.clone(),
                        storage.clone(),
                        logger.clone(),
                        cancel.clone(),
                        interval,
                        &mut join_set,
                    )
                    .await;
                }
            }

            Some(_) = join_set.join_next(), if !join_set.is_empty() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Detail, Endpoint, Protocol, Status};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProber {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Prober for CountingProber {
        async fn probe(&self, endpoint: &Endpoint, _deadline: Duration) -> ResultRecord {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResultRecord {
                timestamp: Utc::now(),
                endpoint_id: endpoint.id.clone(),
                protocol: endpoint.protocol,
                status: Status::Success,
                latency_ms: Some(1.0),
                error: None,
                detail: None::<Detail>,
            }
        }
    }

    fn endpoint(id: &str) -> Endpoint {
        Endpoint {
            id: id.into(),
            region: "r1".into(),
            name: id.into(),
            protocol: Protocol::Tcp,
            address: "127.0.0.1:1".into(),
            timeout: Duration::from_millis(100),
            enabled: true,
            follow_redirects: false,
            user_agent: None,
            verify_tls: true,
        }
    }

    #[tokio::test]
    async fn start_then_stop_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let mut config = ConfigSnapshot::default();
        config.scheduler_interval = Duration::from_secs(60);
        config.endpoints.push(endpoint("e1"));

        let calls = Arc::new(AtomicUsize::new(0));
        let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls });
        let scheduler = Scheduler::new(Arc::new(config), storage, prober);

        scheduler.start().await.unwrap();
        let status = scheduler.status().await.unwrap();
        assert!(status.running);

        scheduler.stop().await.unwrap();
        let status = scheduler.status().await.unwrap();
        assert!(!status.running);
    }

    #[tokio::test]
    async fn run_manual_test_bypasses_the_queue_and_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let mut config = ConfigSnapshot::default();
        config.endpoints.push(endpoint("e1"));

        let calls = Arc::new(AtomicUsize::new(0));
        let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls: calls.clone() });
        let scheduler = Scheduler::new(Arc::new(config), storage.clone(), prober);

        let record = scheduler.run_manual_test("e1").await.unwrap();
        assert_eq!(record.endpoint_id, "e1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let now = Utc::now();
        let results = storage
            .read_range(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn unknown_endpoint_manual_test_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let config = ConfigSnapshot::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls });
        let scheduler = Scheduler::new(Arc::new(config), storage, prober);

        let err = scheduler.run_manual_test("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn update_interval_rejects_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let config = ConfigSnapshot::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let prober: Arc<dyn Prober> = Arc::new(CountingProber { calls });
        let scheduler = Scheduler::new(Arc::new(config), storage, prober);

        assert!(scheduler.update_interval(Duration::from_secs(1)).await.is_err());
        assert!(scheduler.update_interval(Duration::from_secs(3600)).await.is_ok());
    }
}
