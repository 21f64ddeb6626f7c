//! Top-level facade wiring Storage -> Probe -> Scheduler -> Aggregation ->
//! Query -> Export and exposing exactly the operation names the UI layer
//! consumes. Built the way the teacher's `src/main.rs` constructs and wires
//! its segments -- builder-style construction, then call-through -- adapted
//! from single-shot orchestration to long-lived daemon wiring.

use crate::aggregation::Aggregator;
use crate::error::EngineResult;
use crate::export::ExportEngine;
use crate::logging::{default_sink, LogSink};
use crate::model::config::ConfigSnapshot;
use crate::model::{ExportJob, ExportRequest, ResultRecord};
use crate::probe::{ProbeDispatcher, Prober};
use crate::query::{QueryEngine, QueryRequest, Statistics, TimeSeries};
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::storage::{Storage, StorageStats};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Background aggregator poll cadence. Coarse by design (§9: "avoid eager
/// recomputation per Result").
const AGGREGATION_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct Engine {
    storage: Storage,
    scheduler: Scheduler,
    query: QueryEngine,
    export: ExportEngine,
    config_tx: watch::Sender<Arc<ConfigSnapshot>>,
    aggregator_handle: JoinHandle<()>,
}

impl Engine {
    /// Validates `config`, opens Storage, and wires every component. Returns
    /// a `FatalError` (the only variant this function may surface) if the
    /// data directory cannot be created or the configuration is invalid.
    pub async fn new(config: ConfigSnapshot) -> EngineResult<Self> {
        Self::with_logger(config, default_sink()).await
    }

    pub async fn with_logger(config: ConfigSnapshot, logger: Arc<dyn LogSink>) -> EngineResult<Self> {
        config.validate()?;
        let data_dir = config.data_dir.clone();
        let export_dir = config.export_dir.clone();

        let storage = Storage::open_with_logger(&data_dir, logger.clone()).await?;
        let prober: Arc<dyn Prober> = Arc::new(ProbeDispatcher::default());

        let config = Arc::new(config);
        let (config_tx, config_rx) = watch::channel(config.clone());

        let scheduler = Scheduler::with_logger(config.clone(), storage.clone(), prober, logger.clone());
        let query = QueryEngine::new(storage.clone(), config_rx.clone());
        let export = ExportEngine::with_logger(storage.clone(), export_dir, config_rx.clone(), logger.clone());

        let aggregator = Arc::new(Aggregator::with_logger(data_dir, logger));
        let aggregator_handle = aggregator.spawn(AGGREGATION_POLL_INTERVAL);

        Ok(Self {
            storage,
            scheduler,
            query,
            export,
            config_tx,
            aggregator_handle,
        })
    }

    // -- Scheduler --

    pub async fn start(&self) -> EngineResult<()> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) -> EngineResult<()> {
        self.scheduler.stop().await
    }

    pub async fn scheduler_status(&self) -> EngineResult<SchedulerStatus> {
        self.scheduler.status().await
    }

    pub async fn update_interval(&self, interval: Duration) -> EngineResult<()> {
        self.scheduler.update_interval(interval).await
    }

    /// Atomically replaces the configuration snapshot used by the
    /// scheduler, query cache resolution, and export region lookups.
    pub fn reload_config(&self, snapshot: ConfigSnapshot) -> EngineResult<()> {
        snapshot.validate()?;
        let snapshot = Arc::new(snapshot);
        self.scheduler.reload_config(snapshot.clone());
        let _ = self.config_tx.send(snapshot);
        Ok(())
    }

    pub async fn run_manual_test(&self, endpoint_id: impl Into<String>) -> EngineResult<ResultRecord> {
        self.scheduler.run_manual_test(endpoint_id).await
    }

    // -- Storage --

    pub async fn append(&self, record: ResultRecord) -> EngineResult<()> {
        self.storage.append(record).await
    }

    pub async fn read_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> EngineResult<Vec<ResultRecord>> {
        self.storage.read_range(start, end).await
    }

    pub async fn validate_daily_file(&self, date: NaiveDate) -> EngineResult<crate::storage::daily_file::ValidationReport> {
        self.storage.validate(date).await
    }

    pub async fn recover_daily_file(&self, date: NaiveDate) -> EngineResult<crate::model::DailyFile> {
        self.storage.recover(date).await
    }

    pub async fn storage_stats(&self) -> EngineResult<StorageStats> {
        self.storage.stats().await
    }

    pub async fn cleanup(&self, retention_days: u32) -> EngineResult<Vec<PathBuf>> {
        self.storage.cleanup(retention_days).await
    }

    // -- Query --

    pub async fn time_series(&self, request: QueryRequest) -> EngineResult<Vec<TimeSeries>> {
        self.query.time_series(request).await
    }

    pub async fn statistics(&self, request: QueryRequest) -> EngineResult<Vec<Statistics>> {
        self.query.statistics(request).await
    }

    // -- Export --

    pub async fn create_export(&self, request: ExportRequest) -> EngineResult<ExportJob> {
        self.export.create(request).await
    }

    pub async fn export_status(&self, job_id: &str) -> EngineResult<ExportJob> {
        self.export.status(job_id).await
    }

    pub async fn cancel_export(&self, job_id: &str) -> EngineResult<()> {
        self.export.cancel(job_id).await
    }

    pub async fn export_history(&self) -> Vec<ExportJob> {
        self.export.history().await
    }

    pub async fn cleanup_old_exports(&self, days_old: u32) -> EngineResult<Vec<PathBuf>> {
        self.export.cleanup_older(days_old).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.aggregator_handle.abort();
    }
}
