use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::config::Config;
use crate::procutil;

/// Builds the transcoder invocation described in §6.2: AAC audio at a fixed
/// bitrate, HLS muxer, segment duration/list size from config, the
/// `segment_%03d.ts` filename pattern, deletion/timestamp/reconnect flags,
/// and the playlist path. The exact flag set is not part of the external
/// contract beyond the filenames it produces, so this is grounded in shape
/// (not byte-for-byte) on the original's `_build_ffmpeg_command`.
pub fn build_ffmpeg_command(cfg: &Config, stream_url: &str, output_dir: &Path) -> Command {
    let mut cmd = Command::new(&cfg.ffmpeg_path);
    cmd.kill_on_drop(true)
        .arg("-loglevel")
        .arg("warning")
        .arg("-reconnect")
        .arg("1")
        .arg("-reconnect_streamed")
        .arg("1")
        .arg("-reconnect_delay_max")
        .arg("15")
        .arg("-i")
        .arg(stream_url)
        .arg("-c:a")
        .arg("aac")
        .arg("-b:a")
        .arg("128k")
        .arg("-f")
        .arg("hls")
        .arg("-hls_time")
        .arg(cfg.hls_segment_duration.to_string())
        .arg("-hls_list_size")
        .arg(cfg.hls_segment_list_size.to_string())
        .arg("-hls_segment_filename")
        .arg(output_dir.join("segment_%03d.ts"))
        .arg("-hls_flags")
        .arg("delete_segments+program_date_time")
        .arg("-avoid_negative_ts")
        .arg("make_zero")
        .arg("-fflags")
        .arg("+discardcorrupt+genpts")
        .arg(output_dir.join("playlist.m3u8"));
    cmd
}

/// Graceful-then-forceful termination of a single pid: SIGTERM, then up to
/// `timeout` polling for exit, then SIGKILL if it survived. Shared by
/// `stop()` and the startup orphan reaper.
pub async fn terminate_then_kill(pid: u32, timeout: Duration) {
    if !procutil::is_alive(pid) {
        return;
    }
    nix_kill(pid, nix::sys::signal::Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !procutil::is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if procutil::is_alive(pid) {
        tracing::warn!(pid, "process survived SIGTERM, sending SIGKILL");
        nix_kill(pid, nix::sys::signal::Signal::SIGKILL);
    }
}

fn nix_kill(pid: u32, sig: nix::sys::signal::Signal) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig);
}

/// Startup self-cleanup step 2: find and terminate orphan transcoders from a
/// previous, ungracefully terminated instance (by executable name + cmdline
/// reference to the configured HLS root).
pub async fn reap_orphan_transcoders(ffmpeg_path: &PathBuf, hls_root: &Path) {
    let exe_name = ffmpeg_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("ffmpeg");
    let orphans = procutil::find_orphans(exe_name, hls_root);
    for pid in orphans {
        tracing::warn!(pid, "terminating orphan transcoder from a previous instance");
        terminate_then_kill(pid, Duration::from_secs(5)).await;
    }
}
