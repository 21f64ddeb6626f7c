//! Shared data model: endpoints, regions, probe results, daily files and
//! pre-computed aggregates.
//!
//! Wire-facing structs follow the teacher's `#[serde(rename_all = "camelCase")]`
//! convention so the on-disk/over-the-wire schema matches the normative JSON
//! in the specification verbatim.

pub mod config;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Probe protocol. Four variants, data-only, no shared base state -- protocol
/// differences live in [`Detail`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Http,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Icmp => "ICMP",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Timeout,
    Error,
}

/// An HTTP-only breakdown of where the probe's time went.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpPhaseTimings {
    pub dns_ms: Option<u64>,
    pub connect_ms: Option<u64>,
    pub tls_ms: Option<u64>,
    pub ttfb_ms: Option<u64>,
}

/// Protocol-specific side channel carried on a [`ResultRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phases: Option<HttpPhaseTimings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_ttl: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icmp_unreachable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
}

impl Default for Detail {
    fn default() -> Self {
        Self {
            http_status: None,
            http_version: None,
            response_bytes: None,
            phases: None,
            icmp_ttl: None,
            icmp_unreachable: None,
            silent: None,
        }
    }
}

impl Detail {
    pub fn is_empty(&self) -> bool {
        self.http_status.is_none()
            && self.http_version.is_none()
            && self.response_bytes.is_none()
            && self.phases.is_none()
            && self.icmp_ttl.is_none()
            && self.icmp_unreachable.is_none()
            && self.silent.is_none()
    }
}

/// One probe outcome. Renamed from the specification's `Result` to avoid
/// colliding with `std::result::Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub timestamp: DateTime<Utc>,
    pub endpoint_id: String,
    pub protocol: Protocol,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Detail>,
}

impl ResultRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Immutable identity and probe configuration for one monitored target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    pub region: String,
    pub name: String,
    pub protocol: Protocol,
    pub address: String,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub enabled: bool,
    #[serde(default)]
    pub follow_redirects: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_true() -> bool {
    true
}

impl Endpoint {
    pub fn timeout_is_valid(&self) -> bool {
        self.timeout >= Duration::from_millis(1) && self.timeout <= Duration::from_secs(60)
    }
}

/// Latency thresholds used purely for display/aggregation classification --
/// no behavioral effect on probing itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub name: String,
    #[serde(default = "default_warn_ms")]
    pub latency_warn_ms: f64,
    #[serde(default = "default_critical_ms")]
    pub latency_critical_ms: f64,
}

fn default_warn_ms() -> f64 {
    200.0
}
fn default_critical_ms() -> f64 {
    500.0
}

/// Header persisted alongside a day's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyFileMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub result_count: usize,
}

impl DailyFileMetadata {
    pub const SCHEMA_VERSION: &'static str = "1";

    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: Self::SCHEMA_VERSION.to_string(),
            created_at: now,
            last_modified: now,
            result_count: 0,
        }
    }
}

/// One UTC day's worth of results, on-disk representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyFile {
    pub date: NaiveDate,
    pub metadata: DailyFileMetadata,
    pub results: Vec<ResultRecord>,
}

impl DailyFile {
    pub fn new(date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            date,
            metadata: DailyFileMetadata::new(now),
            results: Vec::new(),
        }
    }

    /// Inserts `record` maintaining non-decreasing timestamp order and
    /// refreshes `metadata`.
    pub fn insert_ordered(&mut self, record: ResultRecord, now: DateTime<Utc>) {
        let pos = self
            .results
            .partition_point(|r| r.timestamp <= record.timestamp);
        self.results.insert(pos, record);
        self.metadata.result_count = self.results.len();
        self.metadata.last_modified = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Raw,
    Hourly,
    Daily,
}

/// A pre-computed hourly or daily summary for one (endpoint, bucket).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub endpoint_id: String,
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub count: u64,
    pub success_count: u64,
    pub min_latency_ms: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub availability_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A request to export stored results into a CSV or JSON snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub endpoint_ids: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub compress: bool,
}

/// Transient, in-memory state of a running (or finished) export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: String,
    pub request: ExportRequest,
    pub status: ExportStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<std::path::PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// serde helper: `Duration` as whole milliseconds on the wire.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
