//! Append-only usage log.
//!
//! One JSON row per tool call, durably appended to a newline-delimited
//! file. A trailing window (30 days) is kept in memory to serve cost
//! estimation and analytics without re-reading the file.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mm_domain::error::Result;

/// One row of the usage table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub role: String,
    pub tool: String,
    pub method: String,
    pub tokens_used: u64,
    pub tokens_estimated: u64,
    pub rewrite_applied: bool,
    #[serde(default)]
    pub tokens_saved: u64,
}

/// Durable append + windowed queries over usage records.
pub trait UsageLog: Send + Sync {
    fn append(&self, record: &UsageRecord) -> Result<()>;

    /// Mean of `tokens_used` for (tool, method) since the given instant.
    /// `None` when no matching records exist.
    fn mean_tokens(&self, tool: &str, method: &str, since: DateTime<Utc>) -> Option<f64>;

    /// All records for one session since the given instant, oldest first.
    fn session_records_since(&self, session_id: &str, since: DateTime<Utc>) -> Vec<UsageRecord>;

    /// All in-window records since the given instant, oldest first.
    fn records_since(&self, since: DateTime<Utc>) -> Vec<UsageRecord>;
}

/// How much history the in-memory window retains. On-disk rows are never
/// pruned by the broker.
const WINDOW_DAYS: i64 = 30;

struct Inner {
    file: File,
    window: VecDeque<UsageRecord>,
}

/// Usage log backed by a newline-delimited JSON file.
pub struct JsonlUsageLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlUsageLog {
    /// Open (or create) the log at `path`, loading the trailing window into
    /// memory. Rows that fail to parse are skipped with a warning so one
    /// corrupt line cannot take the log down.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let cutoff = Utc::now() - Duration::days(WINDOW_DAYS);
        let mut window = VecDeque::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<UsageRecord>(&line) {
                    Ok(record) if record.timestamp >= cutoff => window.push_back(record),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(line = lineno + 1, error = %e, "skipping unparseable usage row");
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::info!(
            path = %path.display(),
            window_rows = window.len(),
            "usage log opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, window }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UsageLog for JsonlUsageLog {
    fn append(&self, record: &UsageRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut inner = self.inner.lock();
        inner.file.write_all(line.as_bytes())?;
        inner.file.write_all(b"\n")?;
        inner.window.push_back(record.clone());

        // Drop window rows that aged out.
        let cutoff = Utc::now() - Duration::days(WINDOW_DAYS);
        while inner
            .window
            .front()
            .is_some_and(|r| r.timestamp < cutoff)
        {
            inner.window.pop_front();
        }
        Ok(())
    }

    fn mean_tokens(&self, tool: &str, method: &str, since: DateTime<Utc>) -> Option<f64> {
        let inner = self.inner.lock();
        let mut sum = 0u64;
        let mut count = 0u64;
        for r in inner.window.iter() {
            if r.timestamp >= since && r.tool == tool && r.method == method {
                sum += r.tokens_used;
                count += 1;
            }
        }
        (count > 0).then(|| sum as f64 / count as f64)
    }

    fn session_records_since(&self, session_id: &str, since: DateTime<Utc>) -> Vec<UsageRecord> {
        self.inner
            .lock()
            .window
            .iter()
            .filter(|r| r.session_id == session_id && r.timestamp >= since)
            .cloned()
            .collect()
    }

    fn records_since(&self, since: DateTime<Utc>) -> Vec<UsageRecord> {
        self.inner
            .lock()
            .window
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tool: &str, method: &str, tokens: u64) -> UsageRecord {
        UsageRecord {
            timestamp: Utc::now(),
            session_id: "s1".into(),
            role: "developer".into(),
            tool: tool.into(),
            method: method.into(),
            tokens_used: tokens,
            tokens_estimated: tokens,
            rewrite_applied: false,
            tokens_saved: 0,
        }
    }

    #[test]
    fn append_and_mean() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlUsageLog::open(dir.path().join("usage.jsonl")).unwrap();

        log.append(&record("exa", "search", 1000)).unwrap();
        log.append(&record("exa", "search", 2000)).unwrap();
        log.append(&record("exa", "contents", 9000)).unwrap();

        let since = Utc::now() - Duration::days(30);
        assert_eq!(log.mean_tokens("exa", "search", since), Some(1500.0));
        assert_eq!(log.mean_tokens("exa", "contents", since), Some(9000.0));
        assert_eq!(log.mean_tokens("zen", "consensus", since), None);
    }

    #[test]
    fn reopen_reloads_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let log = JsonlUsageLog::open(&path).unwrap();
            log.append(&record("serena", "find_symbol", 400)).unwrap();
        }

        let log = JsonlUsageLog::open(&path).unwrap();
        let since = Utc::now() - Duration::days(1);
        assert_eq!(log.mean_tokens("serena", "find_symbol", since), Some(400.0));
    }

    #[test]
    fn corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");

        {
            let log = JsonlUsageLog::open(&path).unwrap();
            log.append(&record("exa", "search", 100)).unwrap();
        }
        // Corrupt the file with a partial row.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{not json\n").unwrap();
        }

        let log = JsonlUsageLog::open(&path).unwrap();
        let since = Utc::now() - Duration::days(1);
        assert_eq!(log.records_since(since).len(), 1);
    }

    #[test]
    fn session_filter() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlUsageLog::open(dir.path().join("usage.jsonl")).unwrap();

        let mut other = record("exa", "search", 100);
        other.session_id = "s2".into();
        log.append(&record("exa", "search", 100)).unwrap();
        log.append(&other).unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert_eq!(log.session_records_since("s1", since).len(), 1);
        assert_eq!(log.session_records_since("s2", since).len(), 1);
    }
}
