use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::fcntl::{FlockArg, flock};
use parking_lot::Mutex;

const LOCK_PREFIX: &str = "ffmpeg_lock_";
const LOCK_SUFFIX: &str = ".lock";

/// Host-scoped mutual exclusion keyed by channel, backed by advisory
/// `flock(2)` locks on per-channel lock files. Ownership is always inferred
/// from the held file descriptor, never from the file's mere existence — a
/// lock file can outlive its owner (a crash) without implying anyone still
/// holds it.
pub struct LockRegistry {
    lock_dir: PathBuf,
    active: Mutex<HashMap<String, File>>,
}

impl LockRegistry {
    pub fn new(lock_dir: PathBuf) -> Self {
        Self {
            lock_dir,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn lock_path(&self, channel_id: &str) -> PathBuf {
        self.lock_dir
            .join(format!("{LOCK_PREFIX}{channel_id}{LOCK_SUFFIX}"))
    }

    /// Non-blocking attempt to take an exclusive lock. Returns `false` on
    /// contention or any OS error; never blocks.
    pub fn acquire(&self, channel_id: &str) -> bool {
        let path = self.lock_path(channel_id);
        let file = match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(channel_id, %err, "failed to open lock file");
                return false;
            }
        };

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                tracing::debug!(channel_id, "lock contended, already running elsewhere");
                return false;
            }
            Err(err) => {
                tracing::warn!(channel_id, %err, "failed to acquire lock");
                return false;
            }
        }

        let mut file = file;
        let pid = std::process::id();
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Err(err) = writeln!(file, "{pid}\n{epoch}") {
            tracing::warn!(channel_id, %err, "failed to write lock metadata");
        }
        let _ = file.sync_all();

        self.active.lock().insert(channel_id.to_string(), file);
        true
    }

    /// Releases a lock held by this process. No-op returning `false` if not
    /// held here.
    pub fn release(&self, channel_id: &str) -> bool {
        let file = self.active.lock().remove(channel_id);
        let Some(file) = file else {
            return false;
        };
        let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
        drop(file);
        let path = self.lock_path(channel_id);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(channel_id, %err, "failed to remove lock file");
            }
        }
        true
    }

    /// True if held by this process, or if a probe finds contention held by
    /// another process. A successful probe (no contention found) means the
    /// file is stale; it is unlinked and `false` is returned.
    pub fn is_locked(&self, channel_id: &str) -> bool {
        if self.active.lock().contains_key(channel_id) {
            return true;
        }

        let path = self.lock_path(channel_id);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => return false,
        };

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
                drop(file);
                let _ = fs::remove_file(&path);
                false
            }
            Err(nix::errno::Errno::EWOULDBLOCK) => true,
            Err(_) => false,
        }
    }

    /// Unlinks any lock file in `lock_dir` whose mtime is older than
    /// `timeout` and which is not actually held (probed via try-lock).
    pub fn cleanup_stale(&self, timeout: Duration) {
        let entries = match fs::read_dir(&self.lock_dir) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(%err, dir = %self.lock_dir.display(), "cannot scan lock dir");
                return;
            }
        };

        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(channel_id) = channel_id_from_lock_path(&path) else {
                continue;
            };
            if self.active.lock().contains_key(&channel_id) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(mtime) = meta.modified() else { continue };
            let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
            if age < timeout {
                continue;
            }

            let Ok(file) = File::open(&path) else { continue };
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
                    drop(file);
                    if fs::remove_file(&path).is_ok() {
                        tracing::info!(channel_id, "reaped stale lock file");
                    }
                }
                Err(_) => {}
            }
        }
    }

    /// Enumerates lock files and returns the channel ids currently held (by
    /// self or another process).
    pub fn list_active(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(entries) = fs::read_dir(&self.lock_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Some(channel_id) = channel_id_from_lock_path(&path) {
                if self.is_locked(&channel_id) {
                    out.push(channel_id);
                }
            }
        }
        out
    }
}

impl Drop for LockRegistry {
    fn drop(&mut self) {
        let held: Vec<String> = self.active.lock().keys().cloned().collect();
        for channel_id in held {
            self.release(&channel_id);
        }
    }
}

fn channel_id_from_lock_path(path: &std::path::Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(LOCK_PREFIX)?
        .strip_suffix(LOCK_SUFFIX)
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_release_roundtrip() {
        let dir = tempdir().unwrap();
        let reg = LockRegistry::new(dir.path().to_path_buf());
        assert!(reg.acquire("ch1"));
        assert!(reg.is_locked("ch1"));
        assert!(reg.release("ch1"));
        assert!(!reg.is_locked("ch1"));
    }

    #[test]
    fn acquire_is_exclusive_within_process() {
        let dir = tempdir().unwrap();
        let reg = LockRegistry::new(dir.path().to_path_buf());
        assert!(reg.acquire("ch1"));
        // Second in-process acquire reuses the map and would overwrite the
        // handle; the contract under test here is that a *second registry*
        // (simulating another process) observes contention.
        let other = LockRegistry::new(dir.path().to_path_buf());
        assert!(!other.acquire("ch1"));
    }

    #[test]
    fn list_active_reports_held_locks() {
        let dir = tempdir().unwrap();
        let reg = LockRegistry::new(dir.path().to_path_buf());
        reg.acquire("ch1");
        reg.acquire("ch2");
        let mut active = reg.list_active();
        active.sort();
        assert_eq!(active, vec!["ch1".to_string(), "ch2".to_string()]);
    }

    #[test]
    fn cleanup_stale_unlinks_old_unheld_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ffmpeg_lock_ch1.lock");
        fs::write(&path, "1234\n0\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        filetime_set(&path, old);

        let reg = LockRegistry::new(dir.path().to_path_buf());
        reg.cleanup_stale(Duration::from_secs(30));
        assert!(!path.exists());
    }

    fn filetime_set(path: &std::path::Path, time: SystemTime) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}
