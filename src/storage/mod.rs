//! Append-mostly storage engine: per-day result files with atomic writes,
//! concurrent access via a reader-writer lock per file, retention and
//! validation/recovery.

pub mod daily_file;

use crate::error::{EngineError, EngineResult};
use crate::logging::{default_sink, LogSink};
use crate::model::{DailyFile, ResultRecord};
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

const INGEST_CHANNEL_CAPACITY: usize = 256;

/// Delay before the single retry of a failed atomic write (§7:
/// "Writes retry once after a short delay; persistent failure increments
/// `droppedCount`").
const WRITE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

struct IngestMessage {
    record: ResultRecord,
    reply: oneshot::Sender<EngineResult<()>>,
}

/// One lock per UTC day. Distinct days never serialize against one another;
/// many readers or one writer within a day.
type DayLocks = Arc<Mutex<HashMap<NaiveDate, Arc<RwLock<()>>>>>;

#[derive(Clone)]
pub struct Storage {
    data_dir: PathBuf,
    day_locks: DayLocks,
    ingest_tx: mpsc::Sender<IngestMessage>,
    logger: Arc<dyn LogSink>,
}

#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub oldest_date: Option<NaiveDate>,
    pub newest_date: Option<NaiveDate>,
}

impl Storage {
    /// Opens `data_dir`, sweeping leftover `.tmp` files from a prior crash and
    /// spawning the background ingest-channel consumer that serializes
    /// writes per day.
    pub async fn open(data_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        Self::open_with_logger(data_dir, default_sink()).await
    }

    pub async fn open_with_logger(
        data_dir: impl Into<PathBuf>,
        logger: Arc<dyn LogSink>,
    ) -> EngineResult<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| EngineError::fatal(format!("failed to create data dir: {e}")))?;

        sweep_tmp_files(&data_dir, &logger).await?;

        let day_locks: DayLocks = Arc::new(Mutex::new(HashMap::new()));
        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);

        spawn_ingest_consumer(data_dir.clone(), day_locks.clone(), ingest_rx, logger.clone());

        Ok(Self {
            data_dir,
            day_locks,
            ingest_tx,
            logger,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Hands `record` to the ingest consumer and waits for it to be durably
    /// appended. A full channel backpressures the caller (the caller, not
    /// Storage, decides whether/when to give up -- see the scheduler's
    /// bounded grace period).
    pub async fn append(&self, record: ResultRecord) -> EngineResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ingest_tx
            .send(IngestMessage {
                record,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::fatal("storage ingest consumer has stopped"))?;

        reply_rx
            .await
            .map_err(|_| EngineError::fatal("storage ingest consumer dropped the reply channel"))?
    }

    async fn day_lock(&self, date: NaiveDate) -> Arc<RwLock<()>> {
        let mut locks = self.day_locks.lock().await;
        locks
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Iterates daily files whose date intersects `[start, end]`, filtering
    /// by exact timestamp bounds (`start` inclusive, `end` exclusive).
    /// Missing files yield no Results, not an error.
    pub async fn read_range(
        &self,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> EngineResult<Vec<ResultRecord>> {
        if end < start {
            return Err(EngineError::validation("range end precedes start"));
        }

        let mut out = Vec::new();
        let mut date = start.date_naive();
        let last = end.date_naive();
        while date <= last {
            let lock = self.day_lock(date).await;
            let _guard = lock.read().await;
            let path = daily_file::daily_file_path(&self.data_dir, date);
            if let Some(file) = daily_file::read_daily_file(&path).await? {
                out.extend(
                    file.results
                        .into_iter()
                        .filter(|r| r.timestamp >= start && r.timestamp < end),
                );
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => break,
            };
        }
        Ok(out)
    }

    pub async fn validate(&self, date: NaiveDate) -> EngineResult<daily_file::ValidationReport> {
        let lock = self.day_lock(date).await;
        let _guard = lock.read().await;
        let path = daily_file::daily_file_path(&self.data_dir, date);
        daily_file::validate(&path).await
    }

    pub async fn recover(&self, date: NaiveDate) -> EngineResult<DailyFile> {
        let lock = self.day_lock(date).await;
        let _guard = lock.write().await;
        let path = daily_file::daily_file_path(&self.data_dir, date);
        self.logger.warn(
            "storage",
            &format!("recovering corrupt daily file {}", path.display()),
        );
        daily_file::recover(&path, date).await
    }

    /// Deletes daily files strictly older than `today - retention_days`.
    /// Today's file is never deleted; filenames that don't parse as dates are
    /// skipped, not errored.
    pub async fn cleanup(&self, retention_days: u32) -> EngineResult<Vec<PathBuf>> {
        let today = Utc::now().date_naive();
        let cutoff = today - chrono::Duration::days(retention_days as i64);

        let mut removed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| EngineError::storage(&self.data_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::storage(&self.data_dir, e))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(date) = daily_file::parse_daily_filename(name) else {
                continue;
            };
            if date >= today || date >= cutoff {
                continue;
            }

            let lock = self.day_lock(date).await;
            let _guard = lock.write().await;
            let path = entry.path();
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| EngineError::storage(&path, e))?;
            self.logger
                .info("storage", &format!("cleaned up {}", path.display()));
            removed.push(path);
        }
        Ok(removed)
    }

    /// O(files) directory scan: total file count, cumulative bytes, and the
    /// oldest/newest parseable daily-file date.
    pub async fn stats(&self) -> EngineResult<StorageStats> {
        let mut stats = StorageStats::default();
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| EngineError::storage(&self.data_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::storage(&self.data_dir, e))?
        {
            let Some(name) = entry.file_name().to_str().map(|s| s.to_string()) else {
                continue;
            };
            let Some(date) = daily_file::parse_daily_filename(&name) else {
                continue;
            };
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| EngineError::storage(entry.path(), e))?;

            stats.file_count += 1;
            stats.total_bytes += metadata.len();
            stats.oldest_date = Some(stats.oldest_date.map_or(date, |d| d.min(date)));
            stats.newest_date = Some(stats.newest_date.map_or(date, |d| d.max(date)));
        }
        Ok(stats)
    }
}

async fn sweep_tmp_files(data_dir: &Path, logger: &Arc<dyn LogSink>) -> EngineResult<()> {
    let mut entries = tokio::fs::read_dir(data_dir)
        .await
        .map_err(|e| EngineError::storage(data_dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| EngineError::storage(data_dir, e))?
    {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(daily_file::TMP_SUFFIX))
        {
            logger.info(
                "storage",
                &format!("sweeping leftover temp file {}", path.display()),
            );
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
    Ok(())
}

fn spawn_ingest_consumer(
    data_dir: PathBuf,
    day_locks: DayLocks,
    mut ingest_rx: mpsc::Receiver<IngestMessage>,
    logger: Arc<dyn LogSink>,
) {
    tokio::spawn(async move {
        while let Some(message) = ingest_rx.recv().await {
            let result = append_one(&data_dir, &day_locks, message.record, &logger).await;
            if let Err(e) = &result {
                logger.error("storage", &format!("append failed: {e}"));
            }
            let _ = message.reply.send(result);
        }
    });
}

async fn append_one(
    data_dir: &Path,
    day_locks: &DayLocks,
    record: ResultRecord,
    logger: &Arc<dyn LogSink>,
) -> EngineResult<()> {
    let date = record.date();
    let lock = {
        let mut locks = day_locks.lock().await;
        locks
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    };
    let _guard = lock.write().await;

    let path = daily_file::daily_file_path(data_dir, date);
    let now = Utc::now();
    let mut file = match daily_file::read_daily_file(&path).await {
        Ok(Some(f)) => f,
        Ok(None) => DailyFile::new(date, now),
        Err(_) => {
            // Corrupt file encountered mid-append: recover before continuing
            // so the append is never silently lost.
            daily_file::recover(&path, date).await?
        }
    };
    file.insert_ordered(record, now);

    match daily_file::write_daily_file_atomic(&path, &file).await {
        Ok(()) => Ok(()),
        Err(first_err) => {
            logger.warn(
                "storage",
                &format!("atomic write to {} failed, retrying once: {first_err}", path.display()),
            );
            tokio::time::sleep(WRITE_RETRY_DELAY).await;
            daily_file::write_daily_file_atomic(&path, &file).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, Status};

    fn record(id: &str, ts: chrono::DateTime<Utc>) -> ResultRecord {
        ResultRecord {
            timestamp: ts,
            endpoint_id: id.into(),
            protocol: Protocol::Tcp,
            status: Status::Success,
            latency_ms: Some(5.0),
            error: None,
            detail: None,
        }
    }

    #[tokio::test]
    async fn append_then_read_range_returns_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = Utc::now();
        storage.append(record("e1", now)).await.unwrap();

        let start = now - chrono::Duration::minutes(1);
        let end = now + chrono::Duration::minutes(1);
        let results = storage.read_range(start, end).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].endpoint_id, "e1");
    }

    #[tokio::test]
    async fn concurrent_appends_produce_the_union() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let base = Utc::now();

        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = storage.clone();
            let ts = base + chrono::Duration::milliseconds(i);
            handles.push(tokio::spawn(async move {
                storage.append(record(&format!("e{i}"), ts)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let results = storage
            .read_range(base - chrono::Duration::seconds(1), base + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 20);
        assert!(results.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn cleanup_preserves_today_and_recent_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let today = Utc::now().date_naive();
        let old = today - chrono::Duration::days(10);

        for date in [today, old] {
            let path = daily_file::daily_file_path(dir.path(), date);
            let file = DailyFile::new(date, Utc::now());
            daily_file::write_daily_file_atomic(&path, &file).await.unwrap();
        }

        let removed = storage.cleanup(5).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(daily_file::daily_file_path(dir.path(), today).exists());
        assert!(!daily_file::daily_file_path(dir.path(), old).exists());
    }

    #[tokio::test]
    async fn stats_counts_daily_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let today = Utc::now().date_naive();
        let path = daily_file::daily_file_path(dir.path(), today);
        let file = DailyFile::new(today, Utc::now());
        daily_file::write_daily_file_atomic(&path, &file).await.unwrap();
        tokio::fs::write(dir.path().join("config.json"), "{}").await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.oldest_date, Some(today));
    }
}
