use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::process::{ProcessStatus, Supervisor};

/// Periodically stops any `RUNNING` channel that has had no activity for
/// longer than `idle_timeout`. "Activity" is whatever the control plane
/// reports via [`Supervisor::update_activity`] — typically a client polling
/// the HLS playlist for that channel.
pub struct IdleReaper {
    supervisor: Supervisor,
    idle_timeout: Duration,
    check_interval: Duration,
}

impl IdleReaper {
    pub fn new(supervisor: Supervisor, idle_timeout: Duration, check_interval: Duration) -> Self {
        Self {
            supervisor,
            idle_timeout,
            check_interval,
        }
    }

    /// Spawns the reaper loop, returning a handle whose drop (or explicit
    /// `send(())`) via `shutdown` stops it. Errors from individual `stop()`
    /// calls never abort the sweep — one stuck channel should not prevent
    /// the rest of the fleet from being reaped.
    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, watch::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        shutdown_rx.mark_unchanged();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("idle reaper shutting down");
                        return;
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    async fn sweep(&self) {
        let now = Utc::now();
        for record in self.supervisor.list().await {
            if record.status != ProcessStatus::Running {
                continue;
            }
            let idle_for = now.signed_duration_since(record.last_activity_time);
            let idle_for = idle_for.to_std().unwrap_or(Duration::ZERO);
            if idle_for < self.idle_timeout {
                continue;
            }
            tracing::info!(
                channel_id = %record.channel_id,
                idle_seconds = idle_for.as_secs(),
                "reaping idle channel"
            );
            self.supervisor.stop(&record.channel_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::disk::DiskMonitor;
    use crate::journal::ErrorJournal;
    use crate::locks::LockRegistry;
    use std::path::PathBuf;
    use tempfile::tempdir;

    async fn test_supervisor(dir: &std::path::Path) -> Supervisor {
        std::fs::create_dir_all(dir.join("hls")).unwrap();
        std::fs::create_dir_all(dir.join("locks")).unwrap();
        let config = Arc::new(Config {
            ffmpeg_path: PathBuf::from("/bin/false"),
            hls_output_dir: dir.join("hls"),
            lock_dir: dir.join("locks"),
            ..Config::default()
        });
        let locks = Arc::new(LockRegistry::new(config.lock_dir.clone()));
        let disk = Arc::new(DiskMonitor::new(config.hls_output_dir.clone(), 500));
        let journal = Arc::new(ErrorJournal::new(disk, config.hls_output_dir.clone(), 1000));
        Supervisor::spawn(config, locks, journal)
    }

    #[tokio::test]
    async fn sweep_ignores_non_running_channels() {
        let dir = tempdir().unwrap();
        let sup = test_supervisor(dir.path()).await;
        let reaper = IdleReaper::new(sup.clone(), Duration::from_secs(300), Duration::from_secs(60));
        // No running channels: sweep should complete without panicking.
        reaper.sweep().await;
        assert!(sup.list().await.is_empty());
    }
}
