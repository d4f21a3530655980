use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::classifier::{ClassificationContext, ErrorKind, classify};
use crate::disk::DiskMonitor;
use crate::procutil;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub channel_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub detail: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub error_types: HashMap<String, usize>,
    pub recovery_rate: f64,
    pub recent_errors: usize,
    pub recovery_attempts: usize,
    pub successful_recoveries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    pub overall_status: &'static str,
    pub issues: Vec<String>,
}

/// Bounded history of classified errors plus the kind-specific recovery
/// pipeline of §4.7. When full, the oldest half is dropped in one
/// compaction rather than popping one at a time, to amortize the cost the
/// same way the original's `error_history[-500:]` slice does.
pub struct ErrorJournal {
    entries: Mutex<VecDeque<ErrorRecord>>,
    max_history: usize,
    disk: Arc<DiskMonitor>,
    hls_root: PathBuf,
}

impl ErrorJournal {
    pub fn new(disk: Arc<DiskMonitor>, hls_root: PathBuf, max_history: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_history,
            disk,
            hls_root,
        }
    }

    /// Classifies `message`, runs the matching recovery routine, journals the
    /// result, and returns the resulting record.
    pub async fn record_error(&self, channel_id: &str, message: &str, ctx: ClassificationContext) -> ErrorRecord {
        let (kind, detail) = classify(message, &ctx);
        let mut record = ErrorRecord {
            kind,
            channel_id: channel_id.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            recovery_attempted: false,
            recovery_successful: false,
            detail,
        };
        self.attempt_recovery(&mut record, &ctx).await;
        self.push(record.clone());
        record
    }

    async fn attempt_recovery(&self, record: &mut ErrorRecord, ctx: &ClassificationContext) {
        record.recovery_attempted = true;
        record.recovery_successful = match record.kind {
            ErrorKind::Network => true,
            ErrorKind::DiskSpace => self.recover_disk_space(record).await,
            ErrorKind::ProcessCrash => self.recover_process_crash(record, ctx).await,
            ErrorKind::Transcoder => true,
            ErrorKind::System => true,
        };
    }

    async fn recover_disk_space(&self, record: &mut ErrorRecord) -> bool {
        let (_, before) = self.disk.check();
        let stats = self.disk.evict(Duration::from_secs(1800)).await;
        let (ok, after) = self.disk.check();
        record.detail.insert("disk_info_before".to_string(), json!(before));
        record.detail.insert("cleanup_stats".to_string(), json!(stats));
        record.detail.insert("disk_info_after".to_string(), json!(after));
        ok
    }

    async fn recover_process_crash(&self, record: &mut ErrorRecord, ctx: &ClassificationContext) -> bool {
        if let Some(pid) = ctx.extra.get("crashed_pid").and_then(|v| v.as_u64()) {
            let pid = pid as u32;
            if procutil::is_alive(pid) {
                procutil::kill_process_tree(pid, Duration::from_secs(5)).await;
            }
        }
        let channel_dir = self.hls_root.join(&record.channel_id);
        let removed = remove_suspect_files(&channel_dir).await;
        record.detail.insert("files_removed".to_string(), json!(removed));
        true
    }

    /// Re-runs the recovery routine against the most recent journaled error
    /// for `channel_id`, appending a fresh entry with the outcome. Backs
    /// `POST /api/recovery/<id>`; returns `None` if the channel has no
    /// journaled error to replay.
    pub async fn retry_recovery(&self, channel_id: &str) -> Option<ErrorRecord> {
        let latest = {
            let entries = self.entries.lock();
            entries.iter().rev().find(|e| e.channel_id == channel_id).cloned()
        }?;

        let ctx = ClassificationContext {
            process_crashed: latest.kind == ErrorKind::ProcessCrash,
            extra: latest.detail.clone(),
        };
        let mut record = ErrorRecord {
            kind: latest.kind,
            channel_id: latest.channel_id.clone(),
            message: latest.message.clone(),
            timestamp: Utc::now(),
            recovery_attempted: false,
            recovery_successful: false,
            detail: latest.detail.clone(),
        };
        self.attempt_recovery(&mut record, &ctx).await;
        self.push(record.clone());
        Some(record)
    }

    fn push(&self, record: ErrorRecord) {
        let mut entries = self.entries.lock();
        entries.push_back(record);
        if entries.len() > self.max_history {
            let keep_from = entries.len() / 2;
            entries.drain(0..keep_from);
        }
    }

    pub fn recent(&self, minutes: i64) -> Vec<ErrorRecord> {
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
        self.entries
            .lock()
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let entries = self.entries.lock();
        let total_errors = entries.len();
        let mut error_types: HashMap<String, usize> = HashMap::new();
        let mut recovery_attempts = 0;
        let mut successful_recoveries = 0;
        let cutoff = Utc::now() - chrono::Duration::minutes(60);
        let mut recent_errors = 0;

        for e in entries.iter() {
            *error_types.entry(format!("{:?}", e.kind)).or_default() += 1;
            if e.recovery_attempted {
                recovery_attempts += 1;
            }
            if e.recovery_successful {
                successful_recoveries += 1;
            }
            if e.timestamp >= cutoff {
                recent_errors += 1;
            }
        }

        let recovery_rate = if recovery_attempts > 0 {
            successful_recoveries as f64 / recovery_attempts as f64 * 100.0
        } else {
            0.0
        };

        ErrorStatistics {
            total_errors,
            error_types,
            recovery_rate,
            recent_errors,
            recovery_attempts,
            successful_recoveries,
        }
    }

    /// Aggregates disk pressure, recent error rate, and CPU/RAM pressure into
    /// an overall health verdict.
    pub async fn health(&self) -> HealthStatus {
        let mut issues = Vec::new();
        let mut overall = "healthy";

        let (disk_ok, snapshot) = self.disk.check();
        if !disk_ok {
            overall = "warning";
            issues.push(format!(
                "low disk space: {} MB free ({:.1}%)",
                snapshot.free_mb, snapshot.free_percent
            ));
        }

        let recent_count = self.recent(30).len();
        if recent_count > 10 {
            overall = "warning";
            issues.push(format!("high error rate: {recent_count} errors in the last 30 minutes"));
        }

        let (cpu, mem) = procutil::SystemPressure::sample().await;
        if cpu > 90.0 {
            overall = "warning";
            issues.push(format!("high CPU usage: {cpu:.1}%"));
        }
        if mem > 90.0 {
            overall = "warning";
            issues.push(format!("high memory usage: {mem:.1}%"));
        }

        HealthStatus {
            timestamp: Utc::now(),
            overall_status: overall,
            issues,
        }
    }
}

/// Removes zero-byte or very-recently-modified files from a crashed
/// channel's output directory — these are the files the crashed transcoder
/// may have left mid-write, per §4.7's PROCESS_CRASH recovery routine.
async fn remove_suspect_files(dir: &std::path::Path) -> u64 {
    let mut removed = 0u64;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if meta.len() == 0 || age < Duration::from_secs(10) {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn journal() -> (ErrorJournal, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskMonitor::new(dir.path().to_path_buf(), 500));
        let j = ErrorJournal::new(disk, dir.path().to_path_buf(), 1000);
        (j, dir)
    }

    #[tokio::test]
    async fn network_errors_are_not_retried_but_marked_successful() {
        let (journal, _dir) = journal();
        let record = journal
            .record_error("ch1", "Connection refused", ClassificationContext::default())
            .await;
        assert_eq!(record.kind, ErrorKind::Network);
        assert!(record.recovery_attempted);
        assert!(record.recovery_successful);
    }

    #[tokio::test]
    async fn journal_compacts_when_over_capacity() {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskMonitor::new(dir.path().to_path_buf(), 500));
        let journal = ErrorJournal::new(disk, dir.path().to_path_buf(), 4);
        for i in 0..6 {
            journal
                .record_error(&format!("ch{i}"), "weird error", ClassificationContext::default())
                .await;
        }
        assert!(journal.entries.lock().len() <= 4);
    }

    #[tokio::test]
    async fn statistics_report_totals_by_kind() {
        let (journal, _dir) = journal();
        journal
            .record_error("ch1", "Connection refused", ClassificationContext::default())
            .await;
        journal
            .record_error("ch1", "No space left on device", ClassificationContext::default())
            .await;
        let stats = journal.statistics();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.recovery_attempts, 2);
    }

    #[tokio::test]
    async fn retry_recovery_replays_latest_error_for_channel() {
        let (journal, _dir) = journal();
        journal
            .record_error("ch1", "Connection refused", ClassificationContext::default())
            .await;
        let replayed = journal.retry_recovery("ch1").await.expect("has an entry to replay");
        assert_eq!(replayed.kind, ErrorKind::Network);
        assert_eq!(journal.entries.lock().len(), 2);
    }

    #[tokio::test]
    async fn retry_recovery_returns_none_for_unknown_channel() {
        let (journal, _dir) = journal();
        assert!(journal.retry_recovery("ghost").await.is_none());
    }
}
