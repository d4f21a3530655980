pub mod command;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::classifier::ClassificationContext;
use crate::config::Config;
use crate::errors::SupervisorError;
use crate::ids::validate_channel_id;
use crate::journal::ErrorJournal;
use crate::locks::LockRegistry;

const SETTLE_INTERVAL: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub stream_url: String,
    pub start_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub error_message: Option<String>,
    pub output_dir: PathBuf,
}

/// Supervisor-internal state. Never exposed outside the run loop: the child
/// handle and the `stopping` flag are mutation details the mailbox protocol
/// hides from callers.
struct ChannelState {
    record: ChannelRecord,
    child_alive: bool,
    stopping: bool,
}

enum Command {
    Start {
        channel_id: String,
        stream_url: String,
        resp: oneshot::Sender<Result<ChannelRecord, SupervisorError>>,
    },
    PrepareStop {
        channel_id: String,
        resp: oneshot::Sender<PrepareStopOutcome>,
    },
    FinalizeStop {
        channel_id: String,
    },
    GetStatus {
        channel_id: String,
        resp: oneshot::Sender<Option<ChannelRecord>>,
    },
    List {
        resp: oneshot::Sender<Vec<ChannelRecord>>,
    },
    UpdateActivity {
        channel_id: String,
    },
    ChildExited {
        channel_id: String,
        rc: Option<i32>,
        stderr: String,
    },
}

enum PrepareStopOutcome {
    NoRecord,
    AlreadyStopped,
    Live { pid: u32 },
}

/// Cheap, cloneable front for the Process Supervisor. Every method sends a
/// message onto the supervisor's mailbox and awaits the response — the
/// channel-record map and child-handle map are owned exclusively by the
/// single task running [`run`], which is the redesign called for in the
/// spec: the per-channel monitor task reports exits by message instead of
/// re-entering a held mutex.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<Command>,
}

impl Supervisor {
    pub fn spawn(config: Arc<Config>, locks: Arc<LockRegistry>, journal: Arc<ErrorJournal>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let handle = Supervisor { tx: tx.clone() };
        tokio::spawn(run(config, locks, journal, tx, rx));
        handle
    }

    pub async fn start(&self, channel_id: &str, stream_url: String) -> Result<ChannelRecord, SupervisorError> {
        validate_channel_id(channel_id)?;
        if stream_url.trim().is_empty() {
            return Err(SupervisorError::InvalidArgument(
                "stream_url must not be empty".to_string(),
            ));
        }
        let (resp, rx) = oneshot::channel();
        self.send(Command::Start {
            channel_id: channel_id.to_string(),
            stream_url,
            resp,
        })
        .await;
        rx.await.unwrap_or(Err(SupervisorError::NotFound))
    }

    pub async fn stop(&self, channel_id: &str) -> bool {
        let (resp, rx) = oneshot::channel();
        self.send(Command::PrepareStop {
            channel_id: channel_id.to_string(),
            resp,
        })
        .await;

        match rx.await.unwrap_or(PrepareStopOutcome::NoRecord) {
            PrepareStopOutcome::NoRecord => false,
            PrepareStopOutcome::AlreadyStopped => true,
            PrepareStopOutcome::Live { pid } => {
                command::terminate_then_kill(pid, STOP_TIMEOUT).await;
                self.send(Command::FinalizeStop {
                    channel_id: channel_id.to_string(),
                })
                .await;
                true
            }
        }
    }

    pub async fn get_status(&self, channel_id: &str) -> Option<ChannelRecord> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::GetStatus {
            channel_id: channel_id.to_string(),
            resp,
        })
        .await;
        rx.await.ok().flatten()
    }

    pub async fn list(&self) -> Vec<ChannelRecord> {
        let (resp, rx) = oneshot::channel();
        self.send(Command::List { resp }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn update_activity(&self, channel_id: &str) {
        self.send(Command::UpdateActivity {
            channel_id: channel_id.to_string(),
        })
        .await;
    }

    pub async fn is_running(&self, channel_id: &str) -> bool {
        matches!(
            self.get_status(channel_id).await,
            Some(r) if r.status == ProcessStatus::Running
        )
    }

    async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            tracing::error!("supervisor mailbox closed");
        }
    }
}

async fn run(
    config: Arc<Config>,
    locks: Arc<LockRegistry>,
    journal: Arc<ErrorJournal>,
    self_tx: mpsc::Sender<Command>,
    mut rx: mpsc::Receiver<Command>,
) {
    // Startup self-cleanup (§4.4): stale locks first, then orphan
    // transcoders from a previous, ungracefully terminated instance.
    locks.cleanup_stale(Duration::from_secs(config.lock_timeout));
    command::reap_orphan_transcoders(&config.ffmpeg_path, &config.hls_output_dir).await;

    let mut channels: HashMap<String, ChannelState> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Start {
                channel_id,
                stream_url,
                resp,
            } => {
                let result = handle_start(
                    &config,
                    &locks,
                    &journal,
                    &mut channels,
                    &self_tx,
                    channel_id,
                    stream_url,
                )
                .await;
                let _ = resp.send(result);
            }
            Command::PrepareStop { channel_id, resp } => {
                let outcome = match channels.get_mut(&channel_id) {
                    None => PrepareStopOutcome::NoRecord,
                    Some(state) if !state.child_alive => PrepareStopOutcome::AlreadyStopped,
                    Some(state) => {
                        state.stopping = true;
                        match state.record.pid {
                            Some(pid) => PrepareStopOutcome::Live { pid },
                            None => PrepareStopOutcome::AlreadyStopped,
                        }
                    }
                };
                let _ = resp.send(outcome);
            }
            Command::FinalizeStop { channel_id } => {
                if let Some(state) = channels.get_mut(&channel_id) {
                    if state.child_alive {
                        state.record.status = ProcessStatus::Stopped;
                        state.child_alive = false;
                    }
                    locks.release(&channel_id);
                }
            }
            Command::GetStatus { channel_id, resp } => {
                let record = channels.get(&channel_id).map(|s| s.record.clone());
                let _ = resp.send(record);
            }
            Command::List { resp } => {
                let records = channels.values().map(|s| s.record.clone()).collect();
                let _ = resp.send(records);
            }
            Command::UpdateActivity { channel_id } => {
                if let Some(state) = channels.get_mut(&channel_id) {
                    state.record.last_activity_time = Utc::now();
                }
            }
            Command::ChildExited {
                channel_id,
                rc,
                stderr,
            } => {
                handle_child_exited(&journal, &locks, &mut channels, channel_id, rc, stderr).await;
            }
        }
    }
}

async fn handle_start(
    config: &Arc<Config>,
    locks: &Arc<LockRegistry>,
    journal: &Arc<ErrorJournal>,
    channels: &mut HashMap<String, ChannelState>,
    self_tx: &mpsc::Sender<Command>,
    channel_id: String,
    stream_url: String,
) -> Result<ChannelRecord, SupervisorError> {
    if let Some(existing) = channels.get(&channel_id) {
        if existing.record.status == ProcessStatus::Running {
            return Err(SupervisorError::AlreadyRunning);
        }
    }

    if !locks.acquire(&channel_id) {
        return Err(SupervisorError::AlreadyRunning);
    }

    let now = Utc::now();
    let output_dir = config.hls_output_dir.join(&channel_id);
    let mut record = ChannelRecord {
        channel_id: channel_id.clone(),
        pid: None,
        status: ProcessStatus::Starting,
        stream_url: stream_url.clone(),
        start_time: now,
        last_activity_time: now,
        error_message: None,
        output_dir: output_dir.clone(),
    };

    if let Err(err) = tokio::fs::create_dir_all(&output_dir).await {
        locks.release(&channel_id);
        return Err(SupervisorError::SpawnFailed(format!(
            "failed to create output directory: {err}"
        )));
    }

    let mut cmd = command::build_ffmpeg_command(config, &stream_url, &output_dir);
    cmd.stdout(std::process::Stdio::null());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            locks.release(&channel_id);
            return Err(SupervisorError::SpawnFailed(format!("failed to spawn ffmpeg: {err}")));
        }
    };

    tokio::time::sleep(SETTLE_INTERVAL).await;

    match child.try_wait() {
        Ok(Some(status)) => {
            let stderr_text = drain_stderr(&mut child).await;
            let message = last_nonempty_line(&stderr_text)
                .unwrap_or_else(|| format!("ffmpeg exited immediately with status {status}"));
            let ctx = ClassificationContext {
                process_crashed: true,
                extra: serde_json::json!({
                    "process_start_failed": true,
                    "return_code": status.code(),
                })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            };
            journal.record_error(&channel_id, &message, ctx).await;
            locks.release(&channel_id);
            Err(SupervisorError::SpawnFailed(message))
        }
        Ok(None) => {
            record.pid = child.id();
            record.status = ProcessStatus::Running;
            channels.insert(
                channel_id.clone(),
                ChannelState {
                    record: record.clone(),
                    child_alive: true,
                    stopping: false,
                },
            );
            spawn_monitor(channel_id, child, self_tx.clone());
            Ok(record)
        }
        Err(err) => {
            locks.release(&channel_id);
            Err(SupervisorError::SpawnFailed(format!("failed to probe child status: {err}")))
        }
    }
}

async fn handle_child_exited(
    journal: &Arc<ErrorJournal>,
    locks: &Arc<LockRegistry>,
    channels: &mut HashMap<String, ChannelState>,
    channel_id: String,
    rc: Option<i32>,
    stderr: String,
) {
    let Some(state) = channels.get_mut(&channel_id) else {
        return;
    };
    if !state.child_alive {
        // Already finalized by an explicit stop(); nothing left to do.
        return;
    }
    let crashed_pid = state.record.pid;
    state.child_alive = false;
    state.record.pid = None;

    if state.stopping {
        state.record.status = ProcessStatus::Stopped;
        state.stopping = false;
        locks.release(&channel_id);
        return;
    }

    if rc == Some(0) {
        state.record.status = ProcessStatus::Stopped;
    } else {
        let message = last_nonempty_line(&stderr).unwrap_or_else(|| "ffmpeg exited unexpectedly".to_string());
        let ctx = ClassificationContext {
            process_crashed: true,
            extra: serde_json::json!({
                "crashed_pid": crashed_pid,
                "return_code": rc,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        };
        let record = journal.record_error(&channel_id, &message, ctx).await;
        state.record.status = ProcessStatus::Error;
        state.record.error_message = Some(record.message);
    }
    locks.release(&channel_id);
}

fn spawn_monitor(channel_id: String, mut child: Child, tx: mpsc::Sender<Command>) {
    tokio::spawn(async move {
        let captured = Arc::new(parking_lot::Mutex::new(String::new()));
        if let Some(stderr) = child.stderr.take() {
            let captured = captured.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "ffmpeg", "{line}");
                    let mut buf = captured.lock();
                    buf.push_str(&line);
                    buf.push('\n');
                }
            });
        }

        let status = child.wait().await;
        let rc = status.ok().and_then(|s| s.code());
        let stderr_text = captured.lock().clone();

        let _ = tx
            .send(Command::ChildExited {
                channel_id,
                rc,
                stderr: stderr_text,
            })
            .await;
    });
}

async fn drain_stderr(child: &mut Child) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}

fn last_nonempty_line(text: &str) -> Option<String> {
    text.lines().rev().find(|l| !l.trim().is_empty()).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskMonitor;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        Arc::new(Config {
            ffmpeg_path: PathBuf::from("/bin/false"),
            hls_output_dir: dir.join("hls"),
            lock_dir: dir.join("locks"),
            ..Config::default()
        })
    }

    async fn supervisor(dir: &std::path::Path) -> Supervisor {
        std::fs::create_dir_all(dir.join("hls")).unwrap();
        std::fs::create_dir_all(dir.join("locks")).unwrap();
        let config = test_config(dir);
        let locks = Arc::new(LockRegistry::new(config.lock_dir.clone()));
        let disk = Arc::new(DiskMonitor::new(config.hls_output_dir.clone(), 500));
        let journal = Arc::new(ErrorJournal::new(disk, config.hls_output_dir.clone(), 1000));
        Supervisor::spawn(config, locks, journal)
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_error_and_releases_lock() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        // /bin/false exits immediately with nonzero status and no stderr.
        let result = sup.start("ch1", "http://example.invalid/stream".to_string()).await;
        assert!(result.is_err());
        assert!(!sup.is_running("ch1").await);
    }

    #[tokio::test]
    async fn invalid_channel_id_is_rejected() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let result = sup.start("../etc", "http://u".to_string()).await;
        assert!(matches!(result, Err(SupervisorError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn stop_of_unknown_channel_returns_false() {
        let dir = tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        assert!(!sup.stop("ghost").await);
    }
}
