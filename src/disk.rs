use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Measures free space on the HLS volume and performs emergency eviction of
/// old files. Used both standalone (`/api/health`) and as the recovery
/// routine for `DISK_SPACE` errors (§4.7).
pub struct DiskMonitor {
    hls_root: PathBuf,
    min_free_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSnapshot {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    pub free_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictStats {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub directories_removed: u64,
}

impl DiskMonitor {
    pub fn new(hls_root: PathBuf, min_free_mb: u64) -> Self {
        Self {
            hls_root,
            min_free_mb,
        }
    }

    /// `ok` is true when free space on the HLS volume is at least
    /// `min_free_mb`.
    pub fn check(&self) -> (bool, DiskSnapshot) {
        let snapshot = match statvfs_snapshot(&self.hls_root) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(%err, path = %self.hls_root.display(), "failed to stat filesystem");
                DiskSnapshot {
                    total_mb: 0,
                    used_mb: 0,
                    free_mb: 0,
                    free_percent: 0.0,
                }
            }
        };
        (snapshot.free_mb >= self.min_free_mb, snapshot)
    }

    /// Recursive size of a directory tree, in bytes. Tolerates files
    /// vanishing mid-walk.
    pub async fn directory_bytes(&self, path: &Path) -> u64 {
        directory_bytes_inner(path.to_path_buf()).await
    }

    /// Walks the HLS root bottom-up, deleting every regular file older than
    /// `max_age` except `playlist.m3u8` files (never deleted here — a
    /// `RUNNING` channel's playlist must survive emergency eviction), and
    /// removing directories left empty by the sweep.
    pub async fn evict(&self, max_age: Duration) -> EvictStats {
        let mut stats = EvictStats::default();
        evict_dir(&self.hls_root, max_age, &mut stats).await;
        stats
    }
}

fn directory_bytes_inner(path: PathBuf) -> std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send>> {
    Box::pin(async move {
        let mut total = 0u64;
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(e) => e,
            Err(_) => return 0,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                total += directory_bytes_inner(entry.path()).await;
            } else {
                total += meta.len();
            }
        }
        total
    })
}

fn evict_dir<'a>(
    dir: &'a Path,
    max_age: Duration,
    stats: &'a mut EvictStats,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%err, dir = %dir.display(), "cannot scan directory for eviction");
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
                evict_dir(child, max_age, stats).await;
                continue;
            }

            if child.file_name().and_then(|n| n.to_str()) == Some("playlist.m3u8") {
                continue;
            }

            let age = meta
                .modified()
                .ok()
                .and_then(|m| SystemTime::now().duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age <= max_age {
                continue;
            }

            let len = meta.len();
            match tokio::fs::remove_file(child).await {
                Ok(()) => {
                    stats.files_deleted += 1;
                    stats.bytes_freed += len;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(%err, file = %child.display(), "failed to evict file"),
            }
        }

        if dir_is_empty(dir).await {
            match tokio::fs::remove_dir(dir).await {
                Ok(()) => stats.directories_removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(_) => {}
            }
        }
    })
}

async fn dir_is_empty(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

fn statvfs_snapshot(path: &Path) -> anyhow::Result<DiskSnapshot> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let block_size = stat.fragment_size().max(1);
    let total = stat.blocks() * block_size;
    let free = stat.blocks_available() * block_size;
    let used = total.saturating_sub(free);
    let mb = |bytes: u64| bytes / (1024 * 1024);
    let free_percent = if total > 0 {
        (free as f64 / total as f64) * 100.0
    } else {
        0.0
    };
    Ok(DiskSnapshot {
        total_mb: mb(total),
        used_mb: mb(used),
        free_mb: mb(free),
        free_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn evict_deletes_old_segments_but_keeps_playlist() {
        let dir = tempdir().unwrap();
        let channel = dir.path().join("ch1");
        fs::create_dir_all(&channel).unwrap();
        let playlist = channel.join("playlist.m3u8");
        fs::write(&playlist, "#EXTM3U").unwrap();
        let old_segment = channel.join("segment_000.ts");
        fs::write(&old_segment, vec![0u8; 10]).unwrap();
        set_mtime_hours_ago(&old_segment, 2);

        let monitor = DiskMonitor::new(dir.path().to_path_buf(), 500);
        let stats = monitor.evict(Duration::from_secs(3600)).await;

        assert_eq!(stats.files_deleted, 1);
        assert!(playlist.exists());
        assert!(!old_segment.exists());
    }

    #[tokio::test]
    async fn evict_removes_empty_directories() {
        let dir = tempdir().unwrap();
        let channel = dir.path().join("ch1");
        fs::create_dir_all(&channel).unwrap();
        let segment = channel.join("segment_000.ts");
        fs::write(&segment, vec![0u8; 4]).unwrap();
        set_mtime_hours_ago(&segment, 2);

        let monitor = DiskMonitor::new(dir.path().to_path_buf(), 500);
        monitor.evict(Duration::from_secs(3600)).await;

        assert!(!channel.exists());
    }

    fn set_mtime_hours_ago(path: &Path, hours: u64) {
        let file = fs::File::options().write(true).open(path).unwrap();
        let t = SystemTime::now() - Duration::from_secs(hours * 3600);
        file.set_modified(t).unwrap();
    }
}
