//! Startup checks for the ABR orchestrator
//!
//! Runs before the daemon accepts any work:
//! - Encoder availability and version (HLS variant streams need FFmpeg 4+)
//! - Output root and lock directory creation
//! - Sweep of stream locks left behind by dead processes

use crate::config::Config;
use crate::lock::StreamLocks;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Oldest FFmpeg major version with `-var_stream_map` support
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),

    #[error("Cannot create directory {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What startup found, for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// Encoder major version, `None` when the check was skipped
    pub encoder_major: Option<u32>,
    pub stale_locks_removed: usize,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .trim()
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Run `<binary> -version` and check the reported major version
pub fn check_encoder_available(binary: &str) -> Result<u32, StartupError> {
    let output = Command::new(binary).arg("-version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
            binary, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            binary, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major_version = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major_version < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major_version
        )));
    }

    Ok(major_version)
}

fn ensure_dir(path: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(path).map_err(|source| StartupError::Directory {
        path: path.display().to_string(),
        source,
    })
}

/// Create the output root and lock directory
pub fn prepare_directories(cfg: &Config) -> Result<(), StartupError> {
    ensure_dir(&cfg.output.root)?;
    ensure_dir(&cfg.output.lock_dir)?;
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Encoder version (unless `skip_encoder_check`)
/// 2. Directory creation
/// 3. Stale lock sweep
pub fn run_startup_checks(
    cfg: &Config,
    skip_encoder_check: bool,
) -> Result<StartupReport, StartupError> {
    let encoder_major = if skip_encoder_check {
        warn!("skipping encoder check");
        None
    } else {
        let major = check_encoder_available(&cfg.encoder.binary)?;
        info!(binary = %cfg.encoder.binary, major, "encoder available");
        Some(major)
    };

    prepare_directories(cfg)?;

    let stale_locks_removed = StreamLocks::new(&cfg.output.lock_dir).sweep_stale()?;
    if stale_locks_removed > 0 {
        info!(count = stale_locks_removed, "removed stale stream locks at startup");
    }

    Ok(StartupReport {
        encoder_major,
        stale_locks_removed,
    })
}
