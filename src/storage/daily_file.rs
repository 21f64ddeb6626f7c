//! On-disk daily file I/O: schema-v1 JSON, atomic write, validation and
//! best-effort recovery.
//!
//! Grounded on the teacher's `write_state_atomic` (`http_monitor.rs`):
//! create parent dir, write to a `.tmp` sibling, fsync, then rename onto the
//! final path. Generalized here from a single state file to one file per UTC
//! day.

use crate::error::{EngineError, EngineResult};
use crate::model::{DailyFile, DailyFileMetadata, ResultRecord};
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};

pub const TMP_SUFFIX: &str = ".tmp";

pub fn daily_file_path(data_dir: &Path, date: NaiveDate) -> PathBuf {
    data_dir.join(format!("{}.json", date.format("%Y-%m-%d")))
}

/// Reads `path`, returning `None` when the file does not exist (not an error
/// per the Range-read contract: missing files yield no Results).
pub async fn read_daily_file(path: &Path) -> EngineResult<Option<DailyFile>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let file: DailyFile = serde_json::from_str(&content)
                .map_err(|e| EngineError::corruption(path, e.to_string()))?;
            Ok(Some(file))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::storage(path, e)),
    }
}

/// Writes `file` atomically: serialize -> write `.tmp` -> fsync -> rename.
pub async fn write_daily_file_atomic(path: &Path, file: &DailyFile) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::storage(parent, e))?;
    }

    let tmp_path = tmp_path_for(path);
    let content = serde_json::to_string_pretty(file)?;

    let mut handle = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| EngineError::storage(&tmp_path, e))?;
    use tokio::io::AsyncWriteExt;
    handle
        .write_all(content.as_bytes())
        .await
        .map_err(|e| EngineError::storage(&tmp_path, e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| EngineError::storage(&tmp_path, e))?;
    drop(handle);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| EngineError::storage(path, e))?;
    Ok(())
}

pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Parses `YYYY-MM-DD.json` into a date; non-matching filenames return `None`
/// (skipped, not errored, per the retention/cleanup contract).
pub fn parse_daily_filename(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.strip_suffix(".json")?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    Unparseable(String),
    ResultCountMismatch { recorded: usize, actual: usize },
    OutOfOrder,
    UnknownSchemaVersion(String),
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub path: PathBuf,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Parses, then checks metadata/result-count agreement, monotonic
/// timestamps, and a recognized schema version.
pub async fn validate(path: &Path) -> EngineResult<ValidationReport> {
    let mut issues = Vec::new();

    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ValidationReport {
                path: path.to_path_buf(),
                issues,
            })
        }
        Err(e) => return Err(EngineError::storage(path, e)),
    };

    let file: DailyFile = match serde_json::from_str(&content) {
        Ok(f) => f,
        Err(e) => {
            issues.push(ValidationIssue::Unparseable(e.to_string()));
            return Ok(ValidationReport {
                path: path.to_path_buf(),
                issues,
            });
        }
    };

    if file.metadata.version != DailyFileMetadata::SCHEMA_VERSION {
        issues.push(ValidationIssue::UnknownSchemaVersion(
            file.metadata.version.clone(),
        ));
    }
    if file.metadata.result_count != file.results.len() {
        issues.push(ValidationIssue::ResultCountMismatch {
            recorded: file.metadata.result_count,
            actual: file.results.len(),
        });
    }
    if !file.results.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        issues.push(ValidationIssue::OutOfOrder);
    }

    Ok(ValidationReport {
        path: path.to_path_buf(),
        issues,
    })
}

/// Recovery: rename the broken file to `<name>.bak.<ts>`, reconstruct the
/// best-effort valid prefix (trim after the first malformed record or the
/// first order violation), and atomically write it back under the original
/// name. A zero-record reconstruction leaves the `.bak` file in place and
/// writes a fresh empty daily file instead.
pub async fn recover(path: &Path, date: NaiveDate) -> EngineResult<DailyFile> {
    let now = Utc::now();
    let raw = tokio::fs::read_to_string(path).await.ok();

    let salvaged: Vec<ResultRecord> = raw
        .as_deref()
        .and_then(salvage_results)
        .unwrap_or_default();

    let backup_path = path.with_extension(format!("json.bak.{}", now.timestamp()));
    if path.exists() {
        tokio::fs::rename(path, &backup_path)
            .await
            .map_err(|e| EngineError::storage(path, e))?;
    }

    let recovered = if salvaged.is_empty() {
        DailyFile::new(date, now)
    } else {
        let mut file = DailyFile::new(date, now);
        for record in salvaged {
            file.insert_ordered(record, now);
        }
        file
    };

    write_daily_file_atomic(path, &recovered).await?;
    Ok(recovered)
}

/// Attempts to salvage an ordered, valid prefix of `results` from raw JSON
/// text that may have a truncated or otherwise malformed tail.
fn salvage_results(raw: &str) -> Option<Vec<ResultRecord>> {
    if let Ok(file) = serde_json::from_str::<DailyFile>(raw) {
        let mut results = file.results;
        truncate_at_first_disorder(&mut results);
        return Some(results);
    }

    // Whole-document parse failed (likely a truncated tail): fall back to
    // scanning the `results` array value-by-value and keeping the longest
    // well-formed, non-decreasing-timestamp prefix.
    let array_start = raw.find("\"results\"")?;
    let bracket = raw[array_start..].find('[')? + array_start;
    let mut stream = serde_json::Deserializer::from_str(&raw[bracket + 1..]).into_iter::<ResultRecord>();
    let mut results = Vec::new();
    while let Some(Ok(record)) = stream.next() {
        results.push(record);
    }
    truncate_at_first_disorder(&mut results);
    Some(results)
}

fn truncate_at_first_disorder(results: &mut Vec<ResultRecord>) {
    if let Some(bad) = results.windows(2).position(|w| w[0].timestamp > w[1].timestamp) {
        results.truncate(bad + 1);
    }
}
