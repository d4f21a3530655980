use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

/// Typed configuration record. Replaces the original's dynamic
/// config-dict-of-dicts with a flat, validated struct; environment overrides
/// are applied through the declarative table in [`apply_env_overrides`]
/// rather than ad hoc `os.getenv` calls scattered through the codebase.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub ffmpeg_path: PathBuf,

    pub hls_output_dir: PathBuf,
    pub hls_segment_duration: u32,
    pub hls_segment_list_size: u32,
    pub hls_max_age: u64,
    pub hls_cleanup_interval: u64,

    pub lock_dir: PathBuf,
    pub lock_timeout: u64,

    pub idle_timeout: u64,
    pub idle_check_interval: u64,

    pub min_free_space_mb: u64,
    pub max_error_history: usize,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            ffmpeg_path: PathBuf::from("/usr/bin/ffmpeg"),
            hls_output_dir: PathBuf::from("/tmp/hls"),
            hls_segment_duration: 6,
            hls_segment_list_size: 35,
            hls_max_age: 720,
            hls_cleanup_interval: 180,
            lock_dir: PathBuf::from("/tmp"),
            lock_timeout: 30,
            idle_timeout: 300,
            idle_check_interval: 60,
            min_free_space_mb: 500,
            max_error_history: 1000,
            log_level: "info".to_string(),
        }
    }
}

/// Optional command-line overrides layered on top of environment and
/// compiled-in defaults (precedence: defaults < env < CLI).
#[derive(Debug, Parser)]
#[command(name = "transcoder-supervisor", about = "Per-channel FFmpeg/HLS transcoder supervisor")]
pub struct Cli {
    #[arg(long, env = "AUDIO_SERVICE_HOST")]
    pub host: Option<String>,
    #[arg(long, env = "AUDIO_SERVICE_PORT")]
    pub port: Option<u16>,
    #[arg(long, env = "FFMPEG_PATH")]
    pub ffmpeg_path: Option<PathBuf>,
    #[arg(long, env = "HLS_OUTPUT_DIR")]
    pub hls_output_dir: Option<PathBuf>,
    #[arg(long, env = "LOCK_DIR")]
    pub lock_dir: Option<PathBuf>,
    #[arg(long, env = "AUDIO_SERVICE_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// `(env_var, apply)` table — the Rust equivalent of the original's
/// `env_mappings` dict-of-tuples, minus the dynamic dispatch.
fn apply_env_overrides(cfg: &mut Config) {
    macro_rules! override_parsed {
        ($env:literal, $field:expr) => {
            if let Ok(raw) = env::var($env) {
                match raw.parse() {
                    Ok(v) => $field = v,
                    Err(_) => tracing::warn!(env = $env, value = %raw, "invalid override, ignoring"),
                }
            }
        };
    }
    macro_rules! override_string {
        ($env:literal, $field:expr) => {
            if let Ok(raw) = env::var($env) {
                $field = raw;
            }
        };
    }
    macro_rules! override_path {
        ($env:literal, $field:expr) => {
            if let Ok(raw) = env::var($env) {
                $field = PathBuf::from(raw);
            }
        };
    }

    override_string!("AUDIO_SERVICE_HOST", cfg.host);
    override_parsed!("AUDIO_SERVICE_PORT", cfg.port);
    override_string!("AUDIO_SERVICE_LOG_LEVEL", cfg.log_level);
    override_path!("FFMPEG_PATH", cfg.ffmpeg_path);
    override_path!("HLS_OUTPUT_DIR", cfg.hls_output_dir);
    override_parsed!("HLS_SEGMENT_DURATION", cfg.hls_segment_duration);
    override_parsed!("HLS_SEGMENT_LIST_SIZE", cfg.hls_segment_list_size);
    override_parsed!("HLS_MAX_AGE", cfg.hls_max_age);
    override_parsed!("HLS_CLEANUP_INTERVAL", cfg.hls_cleanup_interval);
    override_path!("LOCK_DIR", cfg.lock_dir);
    override_parsed!("LOCK_TIMEOUT", cfg.lock_timeout);
    override_parsed!("IDLE_TIMEOUT", cfg.idle_timeout);
    override_parsed!("IDLE_CHECK_INTERVAL", cfg.idle_check_interval);
    override_parsed!("MIN_FREE_SPACE_MB", cfg.min_free_space_mb);
    override_parsed!("MAX_ERROR_HISTORY", cfg.max_error_history);
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) {
    if let Some(v) = &cli.host {
        cfg.host = v.clone();
    }
    if let Some(v) = cli.port {
        cfg.port = v;
    }
    if let Some(v) = &cli.ffmpeg_path {
        cfg.ffmpeg_path = v.clone();
    }
    if let Some(v) = &cli.hls_output_dir {
        cfg.hls_output_dir = v.clone();
    }
    if let Some(v) = &cli.lock_dir {
        cfg.lock_dir = v.clone();
    }
    if let Some(v) = &cli.log_level {
        cfg.log_level = v.clone();
    }
}

impl Config {
    /// Loads `.env` (if present), applies environment overrides over the
    /// compiled-in defaults, then layers CLI flags on top, validates, and
    /// ensures the directories it owns exist.
    pub fn load(cli: &Cli) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(?path, "loaded .env"),
            Err(dotenvy::Error::Io(_)) => {}
            Err(err) => tracing::warn!(%err, "failed to parse .env"),
        }

        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        apply_cli_overrides(&mut cfg, cli);
        cfg.validate()?;
        cfg.ensure_directories()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("invalid port number: {}", self.port);
        }
        if self.idle_timeout == 0 {
            anyhow::bail!("invalid idle timeout: {}", self.idle_timeout);
        }
        if self.lock_timeout == 0 {
            anyhow::bail!("invalid lock timeout: {}", self.lock_timeout);
        }
        if !self.ffmpeg_path.exists() {
            tracing::warn!(path = %self.ffmpeg_path.display(), "ffmpeg not found at configured path");
        }
        Ok(())
    }

    fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hls_output_dir)
            .with_context(|| format!("creating hls output dir {}", self.hls_output_dir.display()))?;
        std::fs::create_dir_all(&self.lock_dir)
            .with_context(|| format!("creating lock dir {}", self.lock_dir.display()))?;
        Ok(())
    }
}
