use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::cleaner::ArtifactCleaner;
use crate::config::Config;
use crate::disk::DiskMonitor;
use crate::idle::IdleReaper;
use crate::journal::{ErrorJournal, ErrorStatistics, HealthStatus};
use crate::locks::LockRegistry;
use crate::process::Supervisor;

/// Aggregate status returned by `GET /api/status`, mirroring the original's
/// `ServiceContainer.get_status()` composition of each subsystem's own
/// status.
#[derive(Debug, Serialize)]
pub struct ContainerStatus {
    pub initialized: bool,
    pub running: bool,
    pub channel_count: usize,
    pub active_locks: usize,
    pub error_stats: ErrorStatistics,
}

enum RunningTasks {
    NotStarted,
    Started {
        idle_handle: tokio::task::JoinHandle<()>,
        idle_shutdown: watch::Sender<()>,
        cleaner_handle: tokio::task::JoinHandle<()>,
        cleaner_shutdown: watch::Sender<()>,
    },
}

/// Composes every subsystem in dependency order (locks, disk monitor, error
/// journal, process supervisor, idle reaper, artifact cleaner) behind one
/// handle, the way the original's `ServiceContainer` wires up its services
/// before the Flask app is allowed to accept requests. Unlike a DI container
/// with reflection-based wiring, the dependency order here is just the order
/// the fields are constructed in — Rust's ownership makes the graph explicit.
pub struct Container {
    pub config: Arc<Config>,
    pub locks: Arc<LockRegistry>,
    pub disk: Arc<DiskMonitor>,
    pub journal: Arc<ErrorJournal>,
    pub supervisor: Supervisor,
    running: tokio::sync::Mutex<RunningTasks>,
}

impl Container {
    /// Constructs every subsystem. Equivalent to the original's
    /// `ServiceContainer.initialize()`: if a later step fails, nothing keeps
    /// a half-built supervisor alive, since the whole chain is still inside
    /// one constructor and earlier `Arc`s are simply dropped.
    pub fn initialize(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let locks = Arc::new(LockRegistry::new(config.lock_dir.clone()));
        let disk = Arc::new(DiskMonitor::new(config.hls_output_dir.clone(), config.min_free_space_mb));
        let journal = Arc::new(ErrorJournal::new(
            disk.clone(),
            config.hls_output_dir.clone(),
            config.max_error_history,
        ));
        let supervisor = Supervisor::spawn(config.clone(), locks.clone(), journal.clone());

        tracing::info!("service container initialized");
        Ok(Self {
            config,
            locks,
            disk,
            journal,
            supervisor,
            running: tokio::sync::Mutex::new(RunningTasks::NotStarted),
        })
    }

    /// Starts the background loops (idle reaper, artifact cleaner). Calling
    /// this twice is a no-op on the second call.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if matches!(*running, RunningTasks::Started { .. }) {
            tracing::warn!("container already started");
            return;
        }

        let reaper = IdleReaper::new(
            self.supervisor.clone(),
            Duration::from_secs(self.config.idle_timeout),
            Duration::from_secs(self.config.idle_check_interval),
        );
        let (idle_handle, idle_shutdown) = reaper.spawn();

        let cleaner = ArtifactCleaner::new(
            self.config.hls_output_dir.clone(),
            Duration::from_secs(self.config.hls_max_age * 60),
            Duration::from_secs(self.config.hls_cleanup_interval),
        );
        let (cleaner_handle, cleaner_shutdown) = cleaner.spawn();

        *running = RunningTasks::Started {
            idle_handle,
            idle_shutdown,
            cleaner_handle,
            cleaner_shutdown,
        };
        tracing::info!("background tasks started");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.running.lock().await, RunningTasks::Started { .. })
    }

    /// Stops every `RUNNING` channel, then halts the background loops.
    /// Sequential, not concurrent: draining channels first means the idle
    /// reaper and artifact cleaner never race a stop that is already in
    /// flight.
    pub async fn stop(&self) {
        for record in self.supervisor.list().await {
            if record.status == crate::process::ProcessStatus::Running {
                self.supervisor.stop(&record.channel_id).await;
            }
        }

        let mut running = self.running.lock().await;
        if let RunningTasks::Started {
            idle_handle,
            idle_shutdown,
            cleaner_handle,
            cleaner_shutdown,
        } = std::mem::replace(&mut *running, RunningTasks::NotStarted)
        {
            let _ = idle_shutdown.send(());
            let _ = cleaner_shutdown.send(());
            let _ = idle_handle.await;
            let _ = cleaner_handle.await;
        }
        tracing::info!("background tasks stopped");
    }

    /// Full teardown used on process exit: stop everything, nothing left
    /// running afterward.
    pub async fn shutdown(&self) {
        self.stop().await;
        tracing::info!("service container shut down");
    }

    pub async fn status(&self) -> ContainerStatus {
        let channels = self.supervisor.list().await;
        ContainerStatus {
            initialized: true,
            running: self.is_running().await,
            channel_count: channels.len(),
            active_locks: self.locks.list_active().len(),
            error_stats: self.journal.statistics(),
        }
    }

    pub async fn health(&self) -> HealthStatus {
        self.journal.health().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            ffmpeg_path: PathBuf::from("/bin/false"),
            hls_output_dir: dir.join("hls"),
            lock_dir: dir.join("locks"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn start_then_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hls")).unwrap();
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        let container = Container::initialize(test_config(dir.path())).unwrap();

        container.start().await;
        assert!(container.is_running().await);
        container.start().await;
        assert!(container.is_running().await);

        container.stop().await;
        assert!(!container.is_running().await);
    }

    #[tokio::test]
    async fn status_reports_zero_channels_initially() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hls")).unwrap();
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        let container = Container::initialize(test_config(dir.path())).unwrap();
        let status = container.status().await;
        assert_eq!(status.channel_count, 0);
    }
}
