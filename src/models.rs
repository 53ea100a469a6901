use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::router;
use crate::transform::Transform;

// -----------------------------------------------------------------------------
// Stamp
// -----------------------------------------------------------------------------

/// Second-resolution local timestamp encoded as the decimal `YYYYMMDDhhmmss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Stamp(u64);

impl Stamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let dt: DateTime<Local> = time.into();
        Self::from_naive(dt.naive_local())
    }

    pub fn from_naive(dt: NaiveDateTime) -> Self {
        let year = dt.year().max(0) as u64;
        Stamp(
            year * 10_000_000_000
                + dt.month() as u64 * 100_000_000
                + dt.day() as u64 * 1_000_000
                + dt.hour() as u64 * 10_000
                + dt.minute() as u64 * 100
                + dt.second() as u64,
        )
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.len() != 14 {
            return None;
        }
        let stamp = Stamp(text.parse().ok()?);
        stamp.to_naive().map(|_| stamp)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn to_naive(self) -> Option<NaiveDateTime> {
        let v = self.0;
        let year = (v / 10_000_000_000) as i32;
        let month = ((v / 100_000_000) % 100) as u32;
        let day = ((v / 1_000_000) % 100) as u32;
        let hour = ((v / 10_000) % 100) as u32;
        let minute = ((v / 100) % 100) as u32;
        let second = (v % 100) as u32;
        NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
    }

    /// Absolute distance in seconds, or `None` when either side is not a valid date.
    pub fn seconds_between(self, other: Stamp) -> Option<i64> {
        let a = self.to_naive()?;
        let b = other.to_naive()?;
        Some((a - b).num_seconds().abs())
    }

    /// True when the two stamps are more than one second apart.
    pub fn drifted_from(self, other: Stamp) -> bool {
        match self.seconds_between(other) {
            Some(delta) => delta > 1,
            None => true,
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:014}", self.0)
    }
}

// -----------------------------------------------------------------------------
// Scan / diff records
// -----------------------------------------------------------------------------

/// One file found on disk during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub modified: Stamp,
    /// Reserved, not used by the comparison.
    pub status: char,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
    /// `added` and `changed`, in discovery order.
    pub uncooked: Vec<String>,
}

impl DiffResult {
    pub fn is_clean(&self) -> bool {
        self.uncooked.is_empty() && self.deleted.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Worker assignment
// -----------------------------------------------------------------------------

/// Immutable description of one shard's work.
#[derive(Clone)]
pub struct WorkerAssignment {
    pub files: Arc<Vec<String>>,
    pub transform: Arc<dyn Transform>,
    pub shard: String,
    pub worker_id: usize,
    pub worker_count: usize,
}

impl WorkerAssignment {
    pub fn new(
        files: Arc<Vec<String>>,
        transform: Arc<dyn Transform>,
        worker_id: usize,
        worker_count: usize,
    ) -> Self {
        WorkerAssignment {
            files,
            transform,
            shard: router::shard_file_name(worker_id),
            worker_id,
            worker_count,
        }
    }

    pub fn owns(&self, path: &str) -> bool {
        router::worker_id_for(path, self.worker_count) == self.worker_id
    }
}

impl fmt::Debug for WorkerAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerAssignment")
            .field("files", &self.files.len())
            .field("shard", &self.shard)
            .field("worker_id", &self.worker_id)
            .field("worker_count", &self.worker_count)
            .finish()
    }
}

/// Per-shard tally of one worker pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardReport {
    pub worker_id: usize,
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
    pub cooked: usize,
    pub bypassed: usize,
    pub failed: usize,
}

impl ShardReport {
    pub fn is_dirty(&self) -> bool {
        self.added > 0 || self.changed > 0 || self.deleted > 0
    }
}
