//! Synchronous query API serving dashboards: time-series and aggregate
//! statistics over a time range, with a bounded LRU response cache
//! (key = canonical request hash; grounded on `dashflow`'s `lru` dependency)
//! invalidated by source-file mtime.

use crate::aggregation::{self, percentile};
use crate::error::{EngineError, EngineResult};
use crate::model::config::ConfigSnapshot;
use crate::model::{Granularity, ResultRecord, Status};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{watch, Mutex};

/// An exact sample count above which statistics fall back to the nearest
/// stored percentile approximation instead of an exact in-memory sort
/// (documented choice, spec §4.4: "from the nearest stored percentile
/// approximation" when `count > 100k`).
const EXACT_PERCENTILE_SAMPLE_CEILING: usize = 100_000;

const DEFAULT_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Latency,
    Availability,
    SuccessRate,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub endpoint_ids: Vec<String>,
    pub regions: Vec<String>,
    pub granularity: Granularity,
    /// Per-series down-sampling ceiling (resolved open question: applies
    /// per-series, not globally across all endpoints in the response).
    pub max_points: usize,
    pub metric: Metric,
}

impl QueryRequest {
    fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.start.timestamp_nanos_opt().unwrap_or(0).hash(&mut hasher);
        self.end.timestamp_nanos_opt().unwrap_or(0).hash(&mut hasher);
        self.endpoint_ids.hash(&mut hasher);
        self.regions.hash(&mut hasher);
        self.granularity.hash(&mut hasher);
        self.max_points.hash(&mut hasher);
        self.metric.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone)]
pub struct TimeSeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
    pub count: u64,
    pub status: Option<Status>,
}

#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub endpoint_id: String,
    pub points: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub endpoint_id: String,
    pub count: u64,
    pub success: u64,
    pub failure: u64,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub availability_pct: f64,
    pub approximated: bool,
}

#[derive(Clone)]
struct CacheEntry<T> {
    value: T,
    sources: Vec<(PathBuf, SystemTime)>,
}

pub struct QueryEngine {
    storage: Storage,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    series_cache: Mutex<LruCache<u64, CacheEntry<Vec<TimeSeries>>>>,
    stats_cache: Mutex<LruCache<u64, CacheEntry<Vec<Statistics>>>>,
}

impl QueryEngine {
    pub fn new(storage: Storage, config_rx: watch::Receiver<Arc<ConfigSnapshot>>) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap();
        Self {
            storage,
            config_rx,
            series_cache: Mutex::new(LruCache::new(capacity)),
            stats_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn resolve_endpoint_ids(&self, req: &QueryRequest) -> Vec<String> {
        let config = self.config_rx.borrow();
        let mut ids: Vec<String> = config
            .enabled_endpoints()
            .filter(|e| req.regions.is_empty() || req.regions.contains(&e.region))
            .map(|e| e.id.clone())
            .collect();

        if !req.endpoint_ids.is_empty() {
            ids.retain(|id| req.endpoint_ids.contains(id));
        }
        ids
    }

    pub async fn time_series(&self, req: QueryRequest) -> EngineResult<Vec<TimeSeries>> {
        validate_request(&req)?;
        let key = req.cache_key();

        if let Some(entry) = self.series_cache.lock().await.get(&key).cloned() {
            if sources_unchanged(&entry.sources).await {
                return Ok(entry.value);
            }
        }

        let endpoint_ids = self.resolve_endpoint_ids(&req);
        let records = self.storage.read_range(req.start, req.end).await?;
        let mut by_endpoint: HashMap<&str, Vec<&ResultRecord>> = HashMap::new();
        for r in &records {
            if endpoint_ids.iter().any(|id| id == &r.endpoint_id) {
                by_endpoint.entry(&r.endpoint_id).or_default().push(r);
            }
        }

        let mut series = Vec::new();
        for endpoint_id in &endpoint_ids {
            let mut records_for_endpoint: Vec<&ResultRecord> = by_endpoint
                .get(endpoint_id.as_str())
                .cloned()
                .unwrap_or_default();
            records_for_endpoint.sort_by_key(|r| r.timestamp);

            let points = match req.granularity {
                Granularity::Raw => {
                    bucket_raw(&records_for_endpoint, req.start, req.end, req.max_points, req.metric)
                }
                Granularity::Hourly | Granularity::Daily => {
                    self.aggregate_points(endpoint_id, &req).await?
                }
            };
            series.push(TimeSeries {
                endpoint_id: endpoint_id.clone(),
                points,
            });
        }

        let sources = data_sources_for_range(self.storage.data_dir(), req.start, req.end).await;
        self.series_cache.lock().await.put(
            key,
            CacheEntry {
                value: series.clone(),
                sources,
            },
        );
        Ok(series)
    }

    async fn aggregate_points(
        &self,
        endpoint_id: &str,
        req: &QueryRequest,
    ) -> EngineResult<Vec<TimeSeriesPoint>> {
        let mut date = req.start.date_naive();
        let last = req.end.date_naive();
        let mut aggregates = Vec::new();
        while date <= last {
            let path = match req.granularity {
                Granularity::Hourly => aggregation::hourly_path(self.storage.data_dir(), date),
                Granularity::Daily => aggregation::daily_path(self.storage.data_dir(), date),
                Granularity::Raw => unreachable!(),
            };
            if let Some(day_aggregates) = aggregation::read_aggregates(&path).await? {
                aggregates.extend(
                    day_aggregates
                        .into_iter()
                        .filter(|a| a.endpoint_id == endpoint_id)
                        .filter(|a| a.bucket_start >= req.start && a.bucket_start < req.end),
                );
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => break,
            };
        }
        aggregates.sort_by_key(|a| a.bucket_start);

        let mut points: Vec<TimeSeriesPoint> = aggregates
            .iter()
            .map(|a| TimeSeriesPoint {
                bucket_start: a.bucket_start,
                value: metric_value(req.metric, a.avg_latency_ms, a.success_count, a.count),
                count: a.count,
                status: None,
            })
            .collect();

        if points.len() > req.max_points {
            points = downsample(&points, req.start, req.end, req.max_points);
        }
        Ok(points)
    }

    pub async fn statistics(&self, req: QueryRequest) -> EngineResult<Vec<Statistics>> {
        validate_request(&req)?;
        let key = req.cache_key();
        if let Some(entry) = self.stats_cache.lock().await.get(&key).cloned() {
            if sources_unchanged(&entry.sources).await {
                return Ok(entry.value);
            }
        }

        let endpoint_ids = self.resolve_endpoint_ids(&req);
        let records = self.storage.read_range(req.start, req.end).await?;

        let mut by_endpoint: HashMap<&str, Vec<&ResultRecord>> = HashMap::new();
        for r in &records {
            if endpoint_ids.iter().any(|id| id == &r.endpoint_id) {
                by_endpoint.entry(&r.endpoint_id).or_default().push(r);
            }
        }

        let mut out = Vec::new();
        for endpoint_id in &endpoint_ids {
            let recs = by_endpoint.get(endpoint_id.as_str()).cloned().unwrap_or_default();
            out.push(statistics_for_endpoint(endpoint_id.clone(), &recs));
        }

        let sources = data_sources_for_range(self.storage.data_dir(), req.start, req.end).await;
        self.stats_cache.lock().await.put(
            key,
            CacheEntry {
                value: out.clone(),
                sources,
            },
        );
        Ok(out)
    }
}

fn statistics_for_endpoint(endpoint_id: String, records: &[&ResultRecord]) -> Statistics {
    let count = records.len() as u64;
    let success_records: Vec<&&ResultRecord> =
        records.iter().filter(|r| r.status == Status::Success).collect();
    let success = success_records.len() as u64;
    let failure = count - success;

    let latencies: Vec<f64> = success_records.iter().filter_map(|r| r.latency_ms).collect();
    let min = latencies.iter().cloned().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.min(v)))
    });
    let max = latencies.iter().cloned().fold(None, |acc: Option<f64>, v| {
        Some(acc.map_or(v, |a| a.max(v)))
    });
    let avg = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    };

    let approximated = latencies.len() > EXACT_PERCENTILE_SAMPLE_CEILING;
    let (p50, p95, p99) = if approximated {
        // Over the exact-sort ceiling: approximate with evenly spaced
        // sub-sampling rather than sorting the whole set.
        let step = (latencies.len() / EXACT_PERCENTILE_SAMPLE_CEILING).max(1);
        let sampled: Vec<f64> = latencies.iter().step_by(step).copied().collect();
        (
            percentile::p50(&sampled),
            percentile::p95(&sampled),
            percentile::p99(&sampled),
        )
    } else {
        (
            percentile::p50(&latencies),
            percentile::p95(&latencies),
            percentile::p99(&latencies),
        )
    };

    Statistics {
        endpoint_id,
        count,
        success,
        failure,
        avg_latency_ms: avg,
        min_latency_ms: min,
        max_latency_ms: max,
        p50_latency_ms: p50,
        p95_latency_ms: p95,
        p99_latency_ms: p99,
        availability_pct: if count == 0 {
            0.0
        } else {
            (success as f64 / count as f64) * 100.0
        },
        approximated,
    }
}

fn metric_value(metric: Metric, avg_latency_ms: Option<f64>, success_count: u64, count: u64) -> f64 {
    match metric {
        Metric::Latency => avg_latency_ms.unwrap_or(0.0),
        Metric::Availability => {
            if count == 0 {
                0.0
            } else {
                (success_count as f64 / count as f64) * 100.0
            }
        }
        Metric::SuccessRate => {
            if count == 0 {
                0.0
            } else {
                success_count as f64 / count as f64
            }
        }
    }
}

fn bucket_raw(
    records: &[&ResultRecord],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_points: usize,
    metric: Metric,
) -> Vec<TimeSeriesPoint> {
    if records.is_empty() {
        return Vec::new();
    }

    if records.len() <= max_points.max(1) {
        return records
            .iter()
            .map(|r| TimeSeriesPoint {
                bucket_start: r.timestamp,
                value: metric_value(
                    metric,
                    r.latency_ms,
                    (r.status == Status::Success) as u64,
                    1,
                ),
                count: 1,
                status: Some(r.status),
            })
            .collect();
    }

    let width = ((end - start).num_milliseconds() as f64 / max_points.max(1) as f64).ceil() as i64;
    let width = width.max(1);

    let mut buckets: Vec<Vec<&ResultRecord>> = vec![Vec::new(); max_points.max(1)];
    for r in records {
        let offset_ms = (r.timestamp - start).num_milliseconds().max(0);
        let idx = ((offset_ms / width) as usize).min(buckets.len() - 1);
        buckets[idx].push(r);
    }

    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, recs)| !recs.is_empty())
        .map(|(i, recs)| {
            let bucket_start = start + chrono::Duration::milliseconds(width * i as i64);
            let count = recs.len() as u64;
            let success_count = recs.iter().filter(|r| r.status == Status::Success).count() as u64;
            let latencies: Vec<f64> = recs.iter().filter_map(|r| r.latency_ms).collect();
            let avg_latency = if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
            };
            let status = majority_status(&recs);
            TimeSeriesPoint {
                bucket_start,
                value: metric_value(metric, avg_latency, success_count, count),
                count,
                status: Some(status),
            }
        })
        .collect()
}

fn majority_status(records: &[&ResultRecord]) -> Status {
    let mut counts: HashMap<Status, usize> = HashMap::new();
    for r in records {
        *counts.entry(r.status).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, c)| *c)
        .map(|(s, _)| s)
        .unwrap_or(Status::Success)
}

fn downsample(
    points: &[TimeSeriesPoint],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_points: usize,
) -> Vec<TimeSeriesPoint> {
    let width = ((end - start).num_milliseconds() as f64 / max_points.max(1) as f64).ceil() as i64;
    let width = width.max(1);

    let mut buckets: Vec<Vec<&TimeSeriesPoint>> = vec![Vec::new(); max_points.max(1)];
    for p in points {
        let offset_ms = (p.bucket_start - start).num_milliseconds().max(0);
        let idx = ((offset_ms / width) as usize).min(buckets.len() - 1);
        buckets[idx].push(p);
    }

    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, pts)| !pts.is_empty())
        .map(|(i, pts)| {
            let bucket_start = start + chrono::Duration::milliseconds(width * i as i64);
            let count: u64 = pts.iter().map(|p| p.count).sum();
            let avg = pts.iter().map(|p| p.value).sum::<f64>() / pts.len() as f64;
            TimeSeriesPoint {
                bucket_start,
                value: avg,
                count,
                status: None,
            }
        })
        .collect()
}

fn validate_request(req: &QueryRequest) -> EngineResult<()> {
    if req.end < req.start {
        return Err(EngineError::validation("query end precedes start"));
    }
    if req.max_points == 0 {
        return Err(EngineError::validation("maxPoints must be > 0"));
    }
    Ok(())
}

async fn data_sources_for_range(
    data_dir: &std::path::Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(PathBuf, SystemTime)> {
    let mut sources = Vec::new();
    let mut date = start.date_naive();
    let last = end.date_naive();
    while date <= last {
        let path = crate::storage::daily_file::daily_file_path(data_dir, date);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if let Ok(mtime) = meta.modified() {
                sources.push((path, mtime));
            }
        }
        date = match date.succ_opt() {
            Some(d) => d,
            None => break,
        };
    }
    sources
}

async fn sources_unchanged(sources: &[(PathBuf, SystemTime)]) -> bool {
    for (path, mtime) in sources {
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(current) if current == *mtime => continue,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Protocol, Region};
    use std::time::Duration;

    fn config_with_endpoint() -> Arc<ConfigSnapshot> {
        let mut config = ConfigSnapshot::default();
        config.regions.push(Region {
            name: "us".into(),
            latency_warn_ms: 200.0,
            latency_critical_ms: 500.0,
        });
        config.endpoints.push(Endpoint {
            id: "e1".into(),
            region: "us".into(),
            name: "t".into(),
            protocol: Protocol::Http,
            address: "https://example.test".into(),
            timeout: Duration::from_secs(5),
            enabled: true,
            follow_redirects: false,
            user_agent: None,
            verify_tls: true,
        });
        Arc::new(config)
    }

    #[tokio::test]
    async fn empty_range_returns_empty_series_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let (_tx, rx) = watch::channel(config_with_endpoint());
        let query = QueryEngine::new(storage, rx);

        let now = Utc::now();
        let req = QueryRequest {
            start: now,
            end: now,
            endpoint_ids: vec![],
            regions: vec![],
            granularity: Granularity::Raw,
            max_points: 100,
            metric: Metric::Latency,
        };
        let series = query.time_series(req).await.unwrap();
        assert_eq!(series.len(), 1);
        assert!(series[0].points.is_empty());
    }

    #[tokio::test]
    async fn statistics_reflect_success_and_failure_counts() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let now = Utc::now();
        storage
            .append(ResultRecord {
                timestamp: now,
                endpoint_id: "e1".into(),
                protocol: Protocol::Http,
                status: Status::Success,
                latency_ms: Some(10.0),
                error: None,
                detail: None,
            })
            .await
            .unwrap();
        storage
            .append(ResultRecord {
                timestamp: now + chrono::Duration::seconds(1),
                endpoint_id: "e1".into(),
                protocol: Protocol::Http,
                status: Status::Failure,
                latency_ms: None,
                error: Some("boom".into()),
                detail: None,
            })
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(config_with_endpoint());
        let query = QueryEngine::new(storage, rx);
        let req = QueryRequest {
            start: now - chrono::Duration::minutes(1),
            end: now + chrono::Duration::minutes(1),
            endpoint_ids: vec![],
            regions: vec![],
            granularity: Granularity::Raw,
            max_points: 100,
            metric: Metric::Latency,
        };
        let stats = query.statistics(req).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[0].success, 1);
        assert_eq!(stats[0].failure, 1);
        assert_eq!(stats[0].availability_pct, 50.0);
    }
}
