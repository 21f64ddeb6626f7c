//! Integration coverage tying raw storage, background aggregation, and the
//! query layer's hourly granularity path together end to end.

use chrono::{TimeZone, Utc};
use netmon_core::aggregation::{regenerate_day, Aggregator};
use netmon_core::model::config::ConfigSnapshot;
use netmon_core::model::{Endpoint, Granularity, Protocol, Region, ResultRecord, Status};
use netmon_core::query::{Metric, QueryEngine, QueryRequest};
use netmon_core::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn config_with(endpoint_id: &str, region: &str) -> Arc<ConfigSnapshot> {
    let mut config = ConfigSnapshot::default();
    config.regions.push(Region {
        name: region.into(),
        latency_warn_ms: 200.0,
        latency_critical_ms: 500.0,
    });
    config.endpoints.push(Endpoint {
        id: endpoint_id.into(),
        region: region.into(),
        name: endpoint_id.into(),
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

fn record(ts: chrono::DateTime<Utc>, status: Status, latency: Option<f64>) -> ResultRecord {
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

#[tokio::test]
async fn hourly_query_reads_regenerated_aggregates() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).await.unwrap();
    let day = Utc.with_ymd_and_hms(2026, 4, 10, 9, 0, 0).unwrap();

    storage.append(record(day, Status::Success, Some(12.0))).await.unwrap();
    storage
        .append(record(day + chrono::Duration::minutes(20), Status::Success, Some(18.0)))
        .await
        .unwrap();
    storage
        .append(record(day + chrono::Duration::minutes(40), Status::Failure, None))
        .await
        .unwrap();

    regenerate_day(dir.path(), day.date_naive()).await.unwrap();

    let (_tx, rx) = watch::channel(config_with("e1", "us"));
    let query = QueryEngine::new(storage, rx);
    let req = QueryRequest {
        start: day - chrono::Duration::hours(1),
        end: day + chrono::Duration::hours(2),
        endpoint_ids: vec![],
        regions: vec![],
        granularity: Granularity::Hourly,
        max_points: 24,
        metric: Metric::Availability,
    };

    let series = query.time_series(req).await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].points.len(), 1);
    let point = &series[0].points[0];
    assert_eq!(point.count, 3);
    assert!((point.value - 66.666_666_666_666_66).abs() < 1e-6);
}

#[tokio::test]
async fn aggregator_run_once_regenerates_only_changed_days() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).await.unwrap();
    let day = Utc.with_ymd_and_hms(2026, 5, 1, 6, 0, 0).unwrap();
    storage.append(record(day, Status::Success, Some(7.0))).await.unwrap();

    let aggregator = Aggregator::new(dir.path());
    let first_pass = aggregator.run_once().await.unwrap();
    assert_eq!(first_pass.len(), 1);

    let second_pass = aggregator.run_once().await.unwrap();
    assert!(second_pass.is_empty());
}

#[tokio::test]
async fn query_resolves_only_endpoints_matching_region_filter() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).await.unwrap();
    let mut config = (*config_with("e1", "us")).clone();
    config.endpoints.push(Endpoint {
        id: "e2".into(),
        region: "eu".into(),
        name: "e2".into(),
        protocol: Protocol::Http,
        address: "https://example.test".into(),
        timeout: Duration::from_secs(5),
        enabled: true,
        follow_redirects: false,
        user_agent: None,
        verify_tls: true,
    });
    let (_tx, rx) = watch::channel(Arc::new(config));
    let query = QueryEngine::new(storage, rx);

    let now = Utc::now();
    let req = QueryRequest {
        start: now - chrono::Duration::minutes(1),
        end: now + chrono::Duration::minutes(1),
        endpoint_ids: vec![],
        regions: vec!["us".into()],
        granularity: Granularity::Raw,
        max_points: 10,
        metric: Metric::Latency,
    };
    let series = query.time_series(req).await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].endpoint_id, "e1");
}
