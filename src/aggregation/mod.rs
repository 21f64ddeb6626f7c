//! Background aggregation: re-derives hourly and daily summaries from raw
//! daily files, triggered by observing each raw file's mtime in a coarse
//! poll loop (mtime-poll trigger grounded on `cloud-ping`'s
//! `recompute_long_windows` periodic-interval pattern) rather than eagerly
//! per-Result.

pub mod percentile;

use crate::error::{EngineError, EngineResult};
use crate::logging::{default_sink, LogSink};
use crate::model::{Aggregate, Granularity, ResultRecord, Status};
use crate::storage::daily_file;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Groups `results` by `(endpointId, bucketStart)` at the requested
/// granularity and reduces each group into an [`Aggregate`].
pub fn compute_aggregates(results: &[ResultRecord], granularity: Granularity) -> Vec<Aggregate> {
    let mut groups: HashMap<(String, DateTime<Utc>), Vec<&ResultRecord>> = HashMap::new();
    for r in results {
        let bucket = bucket_start(r.timestamp, granularity);
        groups
            .entry((r.endpoint_id.clone(), bucket))
            .or_default()
            .push(r);
    }

    let mut aggregates: Vec<Aggregate> = groups
        .into_iter()
        .map(|((endpoint_id, bucket_start), records)| reduce_bucket(endpoint_id, bucket_start, granularity, &records))
        .collect();
    aggregates.sort_by(|a, b| (a.endpoint_id.clone(), a.bucket_start).cmp(&(b.endpoint_id.clone(), b.bucket_start)));
    aggregates
}

fn bucket_start(ts: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Raw => ts,
        Granularity::Hourly => ts
            .date_naive()
            .and_hms_opt(ts.hour(), 0, 0)
            .unwrap()
            .and_utc(),
        Granularity::Daily => ts
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc(),
    }
}

fn reduce_bucket(
    endpoint_id: String,
    bucket_start: DateTime<Utc>,
    granularity: Granularity,
    records: &[&ResultRecord],
) -> Aggregate {
    let count = records.len() as u64;
    let success: Vec<f64> = records
        .iter()
        .filter(|r| r.status == Status::Success)
        .filter_map(|r| r.latency_ms)
        .collect();
    let success_count = success.len() as u64;

    let min = success.iter().cloned().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.min(v)))
    });
    let max = success.iter().cloned().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.max(v)))
    });
    let avg = if success.is_empty() {
        None
    } else {
        Some(success.iter().sum::<f64>() / success.len() as f64)
    };

    Aggregate {
        endpoint_id,
        bucket_start,
        granularity,
        count,
        success_count,
        min_latency_ms: min,
        avg_latency_ms: avg,
        max_latency_ms: max,
        p50_latency_ms: percentile::p50(&success),
        p95_latency_ms: percentile::p95(&success),
        p99_latency_ms: percentile::p99(&success),
        availability_pct: if count == 0 {
            0.0
        } else {
            (success_count as f64 / count as f64) * 100.0
        },
    }
}

pub fn aggregated_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("aggregated")
}

pub fn hourly_path(data_dir: &Path, date: NaiveDate) -> PathBuf {
    aggregated_dir(data_dir).join(format!("{}-hourly.json", date.format("%Y-%m-%d")))
}

pub fn daily_path(data_dir: &Path, date: NaiveDate) -> PathBuf {
    aggregated_dir(data_dir).join(format!("{}-daily.json", date.format("%Y-%m-%d")))
}

async fn write_aggregates_atomic(path: &Path, aggregates: &[Aggregate]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::storage(parent, e))?;
    }
    let tmp_path = daily_file::tmp_path_for(path);
    let content = serde_json::to_string_pretty(aggregates)?;
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|e| EngineError::storage(&tmp_path, e))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| EngineError::storage(path, e))?;
    Ok(())
}

pub async fn read_aggregates(path: &Path) -> EngineResult<Option<Vec<Aggregate>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::storage(path, e)),
    }
}

/// Regenerates hourly and daily aggregates for one raw day. Aggregates are
/// purely derived from raw data -- corruption in an aggregate file is
/// resolved by regeneration, never by repair.
pub async fn regenerate_day(data_dir: &Path, date: NaiveDate) -> EngineResult<()> {
    let raw_path = daily_file::daily_file_path(data_dir, date);
    let results = match daily_file::read_daily_file(&raw_path).await? {
        Some(file) => file.results,
        None => Vec::new(),
    };

    let hourly = compute_aggregates(&results, Granularity::Hourly);
    let daily = compute_aggregates(&results, Granularity::Daily);

    write_aggregates_atomic(&hourly_path(data_dir, date), &hourly).await?;
    write_aggregates_atomic(&daily_path(data_dir, date), &daily).await?;
    Ok(())
}

/// Background aggregator: on each tick, scans `<data-root>` for raw daily
/// files whose mtime has advanced since it last regenerated them.
pub struct Aggregator {
    data_dir: PathBuf,
    last_seen: Mutex<HashMap<NaiveDate, SystemTime>>,
    logger: Arc<dyn LogSink>,
}

impl Aggregator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_logger(data_dir, default_sink())
    }

    pub fn with_logger(data_dir: impl Into<PathBuf>, logger: Arc<dyn LogSink>) -> Self {
        Self {
            data_dir: data_dir.into(),
            last_seen: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// One scan-and-regenerate pass. Returns the dates it regenerated.
    pub async fn run_once(&self) -> EngineResult<Vec<NaiveDate>> {
        let mut regenerated = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(regenerated),
            Err(e) => return Err(EngineError::storage(&self.data_dir, e)),
        };

        let mut last_seen = self.last_seen.lock().await;
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
            let mtime = metadata.modified().unwrap_or(SystemTime::now());

            let needs_regeneration = last_seen.get(&date).map_or(true, |seen| *seen != mtime);
            if needs_regeneration {
                regenerate_day(&self.data_dir, date).await?;
                last_seen.insert(date, mtime);
                regenerated.push(date);
            }
        }
        if !regenerated.is_empty() {
            self.logger.debug(
                "aggregation",
                &format!("regenerated aggregates for {} day(s)", regenerated.len()),
            );
        }
        Ok(regenerated)
    }

    /// Spawns the coarse poll loop; returns a handle the caller can abort.
    pub fn spawn(self: Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    self.logger
                        .warn("aggregation", &format!("aggregation pass failed: {e}"));
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    fn record(ts: DateTime<Utc>, status: Status, latency: Option<f64>) -> ResultRecord {
        ResultRecord {
            timestamp: ts,
            endpoint_id: "e1".into(),
            protocol: Protocol::Http,
            status,
            latency_ms: latency,
            error: None,
            detail: None,
        }
    }

    #[test]
    fn availability_is_zero_for_empty_bucket() {
        let aggregates = compute_aggregates(&[], Granularity::Hourly);
        assert!(aggregates.is_empty());
    }

    #[test]
    fn hourly_bucket_computes_availability_and_latency() {
        let base = Utc::now().date_naive().and_hms_opt(10, 0, 0).unwrap().and_utc();
        let results = vec![
            record(base, Status::Success, Some(10.0)),
            record(base + chrono::Duration::minutes(5), Status::Success, Some(20.0)),
            record(base + chrono::Duration::minutes(10), Status::Failure, None),
        ];
        let aggregates = compute_aggregates(&results, Granularity::Hourly);
        assert_eq!(aggregates.len(), 1);
        let a = &aggregates[0];
        assert_eq!(a.count, 3);
        assert_eq!(a.success_count, 2);
        assert_eq!(a.avg_latency_ms, Some(15.0));
        assert!((a.availability_pct - 66.666_666_666_666_66).abs() < 1e-6);
    }

    #[tokio::test]
    async fn regenerate_day_produces_hourly_and_daily_files() {
        let dir = tempfile::tempdir().unwrap();
        let date = Utc::now().date_naive();
        let now = Utc::now();
        let mut file = crate::model::DailyFile::new(date, now);
        file.insert_ordered(record(now, Status::Success, Some(5.0)), now);
        daily_file::write_daily_file_atomic(&daily_file::daily_file_path(dir.path(), date), &file)
            .await
            .unwrap();

        regenerate_day(dir.path(), date).await.unwrap();

        assert!(read_aggregates(&hourly_path(dir.path(), date))
            .await
            .unwrap()
            .is_some());
        assert!(read_aggregates(&daily_path(dir.path(), date))
            .await
            .unwrap()
            .is_some());
    }
}
