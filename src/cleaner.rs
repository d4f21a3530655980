use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;

/// Periodic sweep of the HLS output tree enforcing the three-tier artifact
/// rule: playlists are never touched, stray non-segment files are always
/// removed, and `segment_*.ts` files are removed only once they are older
/// than `max_age`. This is distinct from [`crate::disk::DiskMonitor::evict`],
/// which is the coarser emergency-eviction routine used under disk pressure
/// and ignores the segment/non-segment distinction.
pub struct ArtifactCleaner {
    hls_root: PathBuf,
    max_age: Duration,
    interval: Duration,
}

impl ArtifactCleaner {
    pub fn new(hls_root: PathBuf, max_age: Duration, interval: Duration) -> Self {
        Self {
            hls_root,
            max_age,
            interval,
        }
    }

    pub fn spawn(self) -> (tokio::task::JoinHandle<()>, watch::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        shutdown_rx.mark_unchanged();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("artifact cleaner shutting down");
                        return;
                    }
                }
            }
        });
        (handle, shutdown_tx)
    }

    pub async fn sweep(&self) {
        clean_dir(&self.hls_root, self.max_age).await;
    }
}

fn clean_dir(dir: &Path, max_age: Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%err, dir = %dir.display(), "cannot scan directory for artifact cleanup");
                }
                return;
            }
        };

        let mut children = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            children.push(entry.path());
        }

        for child in &children {
            let Ok(meta) = tokio::fs::metadata(child).await else {
                continue;
            };
            if meta.is_dir() {
                clean_dir(child, max_age).await;
                continue;
            }

            match classify_artifact(child) {
                Artifact::Playlist => continue,
                Artifact::Segment => {
                    let age = meta
                        .modified()
                        .ok()
                        .and_then(|m| SystemTime::now().duration_since(m).ok())
                        .unwrap_or(Duration::ZERO);
                    if age <= max_age {
                        continue;
                    }
                    remove_file(child).await;
                }
                Artifact::Other => {
                    remove_file(child).await;
                }
            }
        }

        if dir_is_empty(dir).await {
            let _ = tokio::fs::remove_dir(dir).await;
        }
    })
}

enum Artifact {
    Playlist,
    Segment,
    Other,
}

fn classify_artifact(path: &Path) -> Artifact {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Artifact::Other;
    };
    if name.ends_with(".m3u8") {
        Artifact::Playlist
    } else if name.starts_with("segment_") && name.ends_with(".ts") {
        Artifact::Segment
    } else {
        Artifact::Other
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(%err, file = %path.display(), "failed to remove artifact"),
    }
}

async fn dir_is_empty(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn set_mtime_hours_ago(path: &Path, hours: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        let t = SystemTime::now() - Duration::from_secs(hours * 3600);
        file.set_modified(t).unwrap();
    }

    #[tokio::test]
    async fn playlist_is_never_removed_regardless_of_age() {
        let dir = tempdir().unwrap();
        let channel = dir.path().join("ch1");
        fs::create_dir_all(&channel).unwrap();
        let playlist = channel.join("playlist.m3u8");
        fs::write(&playlist, "#EXTM3U").unwrap();
        set_mtime_hours_ago(&playlist, 1000);

        let cleaner = ArtifactCleaner::new(dir.path().to_path_buf(), Duration::from_secs(60), Duration::from_secs(60));
        cleaner.sweep().await;

        assert!(playlist.exists());
    }

    #[tokio::test]
    async fn non_segment_files_are_always_removed() {
        let dir = tempdir().unwrap();
        let channel = dir.path().join("ch1");
        fs::create_dir_all(&channel).unwrap();
        fs::write(channel.join("playlist.m3u8"), "#EXTM3U").unwrap();
        let stray = channel.join("leftover.tmp");
        fs::write(&stray, "junk").unwrap();

        let cleaner = ArtifactCleaner::new(dir.path().to_path_buf(), Duration::from_secs(3600), Duration::from_secs(60));
        cleaner.sweep().await;

        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn segments_are_kept_until_they_age_past_max_age() {
        let dir = tempdir().unwrap();
        let channel = dir.path().join("ch1");
        fs::create_dir_all(&channel).unwrap();
        fs::write(channel.join("playlist.m3u8"), "#EXTM3U").unwrap();
        let fresh = channel.join("segment_001.ts");
        fs::write(&fresh, vec![0u8; 4]).unwrap();
        let old = channel.join("segment_000.ts");
        fs::write(&old, vec![0u8; 4]).unwrap();
        set_mtime_hours_ago(&old, 2);

        let cleaner = ArtifactCleaner::new(dir.path().to_path_buf(), Duration::from_secs(3600), Duration::from_secs(60));
        cleaner.sweep().await;

        assert!(fresh.exists());
        assert!(!old.exists());
    }
}
