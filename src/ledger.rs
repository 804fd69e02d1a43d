#![forbid(unsafe_code)]

//! Per-task suppression records.
//!
//! A record is written whenever a reminder fires or is dismissed. Decay is
//! evaluated at read time against a caller-supplied window; stale records
//! stay on disk until [`DismissalLedger::clear`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use serde::Serialize;

use crate::clock::format_ms_rfc3339;

pub const DEFAULT_SUPPRESSION_MS: i64 = 60 * 60 * 1000;

pub trait DismissalLedger: Send + Sync {
    fn record_at(&self, task_id: &str, now_ms: i64);

    fn last_dismissed(&self, task_id: &str) -> Option<i64>;

    fn clear(&self);

    fn entries(&self) -> BTreeMap<String, i64>;

    /// True iff a record exists and is newer than `now_ms - window_ms`.
    fn is_recently_suppressed_at(&self, task_id: &str, now_ms: i64, window_ms: i64) -> bool {
        self.last_dismissed(task_id)
            .is_some_and(|at| at > now_ms.saturating_sub(window_ms))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotificationStatus {
    pub dismissed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_ago: Option<i64>,
}

impl NotificationStatus {
    #[must_use]
    pub fn from_record(record: Option<i64>, now_ms: i64) -> Self {
        match record {
            None => Self {
                dismissed: false,
                dismissed_at: None,
                minutes_ago: None,
            },
            Some(at) => Self {
                dismissed: true,
                dismissed_at: Some(format_ms_rfc3339(at)),
                minutes_ago: Some(round_div(now_ms - at, 60_000)),
            },
        }
    }
}

/// Integer division rounding half away from zero.
#[must_use]
pub fn round_div(n: i64, d: i64) -> i64 {
    let q = n / d;
    let r = n % d;
    if r.abs() * 2 >= d.abs() {
        q + n.signum() * d.signum()
    } else {
        q
    }
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<BTreeMap<String, i64>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, i64>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DismissalLedger for MemoryLedger {
    fn record_at(&self, task_id: &str, now_ms: i64) {
        self.lock().insert(task_id.to_owned(), now_ms);
    }

    fn last_dismissed(&self, task_id: &str) -> Option<i64> {
        self.lock().get(task_id).copied()
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn entries(&self) -> BTreeMap<String, i64> {
        self.lock().clone()
    }
}

/// Ledger persisted as a JSON object of task id to epoch milliseconds.
#[derive(Debug)]
pub struct JsonFileLedger {
    path: PathBuf,
    io: Mutex<()>,
}

impl JsonFileLedger {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> BTreeMap<String, i64> {
        let data = match std::fs::read(&self.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                tracing::warn!("failed to read dismissal ledger {}: {e}", self.path.display());
                return BTreeMap::new();
            }
        };
        serde_json::from_slice(&data).unwrap_or_else(|e| {
            tracing::warn!(
                "ignoring malformed dismissal ledger at {}: {e}",
                self.path.display()
            );
            BTreeMap::new()
        })
    }

    fn write_map(&self, map: &BTreeMap<String, i64>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(map)?;
        std::fs::write(&tmp, &data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to rename {} -> {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }

    fn io_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.io
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl DismissalLedger for JsonFileLedger {
    fn record_at(&self, task_id: &str, now_ms: i64) {
        let _io = self.io_lock();
        let mut map = self.read_map();
        map.insert(task_id.to_owned(), now_ms);
        if let Err(e) = self.write_map(&map) {
            tracing::warn!(task_id, "failed to persist dismissal: {e:#}");
        }
    }

    fn last_dismissed(&self, task_id: &str) -> Option<i64> {
        let _io = self.io_lock();
        self.read_map().get(task_id).copied()
    }

    fn clear(&self) {
        let _io = self.io_lock();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    "failed to clear dismissal ledger {}: {e}",
                    self.path.display()
                );
            }
        }
    }

    fn entries(&self) -> BTreeMap<String, i64> {
        let _io = self.io_lock();
        self.read_map()
    }
}
