//! Backup entries and their last-run records.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// One configured backup entry: a named set of source roots.
#[derive(Clone, Debug)]
pub struct BackupEntry {
    /// Entry name reported to the server.
    pub name: String,
    /// Source roots to archive.
    pub sources: Vec<PathBuf>,
    /// Exclude patterns applied during the walk.
    pub excludes: Vec<String>,
}

/// Outcome classification of a finished run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// The server confirmed the stream.
    Success,
    /// The run ended in an error.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

/// Record of the most recent run of an entry.
#[derive(Clone, Debug)]
pub struct LastRun {
    /// Outcome classification.
    pub status: JobStatus,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Compressed bytes streamed.
    pub bytes: u64,
    /// Objects archived.
    pub objects: u64,
    /// Round-trip time of the session handshake.
    pub handshake_rtt: Duration,
    /// Human-readable error detail for failed runs.
    pub error: Option<String>,
}

/// A backup entry plus its last-result bookkeeping, the record consumed by
/// the external scheduler.
pub struct BackupJob {
    entry: BackupEntry,
    last: Mutex<Option<LastRun>>,
}

impl BackupJob {
    /// Creates a job that has never run.
    #[must_use]
    pub const fn new(entry: BackupEntry) -> Self {
        Self {
            entry,
            last: Mutex::new(None),
        }
    }

    /// Returns the configured entry.
    #[must_use]
    pub const fn entry(&self) -> &BackupEntry {
        &self.entry
    }

    /// Returns a copy of the last-run record, if any run finished.
    #[must_use]
    pub fn last_run(&self) -> Option<LastRun> {
        self.last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Stores the record of a finished run.
    pub fn record(&self, run: LastRun) {
        *self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> BackupEntry {
        BackupEntry {
            name: "etc".into(),
            sources: vec![PathBuf::from("/etc")],
            excludes: vec!["*.tmp".into()],
        }
    }

    #[test]
    fn new_job_has_no_record() {
        let job = BackupJob::new(entry());
        assert!(job.last_run().is_none());
    }

    #[test]
    fn record_replaces_previous_run() {
        let job = BackupJob::new(entry());
        job.record(LastRun {
            status: JobStatus::Failed,
            duration: Duration::from_secs(10),
            bytes: 0,
            objects: 0,
            handshake_rtt: Duration::ZERO,
            error: Some("first".into()),
        });
        job.record(LastRun {
            status: JobStatus::Success,
            duration: Duration::from_secs(20),
            bytes: 1234,
            objects: 56,
            handshake_rtt: Duration::from_millis(3),
            error: None,
        });
        let last = job.last_run().unwrap();
        assert_eq!(last.status, JobStatus::Success);
        assert_eq!(last.bytes, 1234);
        assert!(last.error.is_none());
    }
}
