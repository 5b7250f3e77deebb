//! Quality ladder module: turns a source key and the configured profiles
//! into a concrete multi-rendition encode specification.
//!
//! Building is pure. Nothing here touches the filesystem or spawns a
//! process, so the same inputs always yield the same [`EncodeSpec`].

use crate::config::{Config, QualityProfile};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Name of the per-rendition sub-manifest written by the encoder
pub const RENDITION_PLAYLIST: &str = "playlist.m3u8";

/// Segment file pattern inside each rendition directory
pub const SEGMENT_PATTERN: &str = "segment%05d.ts";

/// Errors produced while building an encode spec
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LadderError {
    #[error("quality ladder is empty")]
    EmptyLadder,

    #[error("invalid profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("invalid encoder settings: {0}")]
    InvalidSettings(String),
}

/// Encoder settings shared by every rendition of every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSettings {
    /// Source `s` is read from `{input_base_url}/{s}`
    pub input_base_url: String,
    /// Jobs write under `{output_base}/{source_key}`
    pub output_base: PathBuf,
    pub preset: String,
    pub tune: String,
    pub frame_rate: u32,
    pub gop_size: u32,
    pub segment_seconds: u32,
    pub playlist_size: u32,
    pub audio_sample_rate: u32,
}

impl EncodeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            input_base_url: cfg.ingest.input_base_url.clone(),
            output_base: cfg.output.root.clone(),
            preset: cfg.encoder.preset.clone(),
            tune: cfg.encoder.tune.clone(),
            frame_rate: cfg.encoder.frame_rate,
            gop_size: cfg.encoder.gop_size,
            segment_seconds: cfg.encoder.segment_seconds,
            playlist_size: cfg.encoder.playlist_size,
            audio_sample_rate: cfg.encoder.audio_sample_rate,
        }
    }
}

/// Per-rendition part of an encode spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenditionSpec {
    /// Output stream index inside the encoder invocation
    pub index: usize,
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Scale filter; aspect ratio preserved, dimensions divisible by 2
    pub scale_filter: String,
    pub gop_size: u32,
    pub keyint_min: u32,
    pub force_key_frames: String,
    pub segment_seconds: u32,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub codec_profile: String,
    pub codec_level: String,
    /// RFC 6381 codec identification advertised in the manifest
    pub codecs: String,
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
}

impl RenditionSpec {
    /// Upper bound on the rendition's bits per second, audio included
    pub fn peak_bandwidth_bps(&self) -> u64 {
        (self.max_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64) * 1000
    }
}

/// Everything needed to launch one encoder for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodeSpec {
    pub source_key: String,
    pub input_url: String,
    /// Directory owned by this job; renditions live in sub-directories
    pub output_root: PathBuf,
    pub preset: String,
    pub tune: String,
    pub frame_rate: u32,
    pub segment_seconds: u32,
    pub playlist_size: u32,
    pub audio_sample_rate: u32,
    /// Highest quality first, in ladder order
    pub renditions: Vec<RenditionSpec>,
}

impl EncodeSpec {
    /// Rendition sub-directories, in ladder order
    pub fn output_dirs(&self) -> impl Iterator<Item = &PathBuf> {
        self.renditions.iter().map(|r| &r.output_dir)
    }
}

/// Build the encode spec for `source_key` across `profiles`.
///
/// Fails only on invalid profile or settings data.
pub fn build_encode_spec(
    source_key: &str,
    profiles: &[QualityProfile],
    settings: &EncodeSettings,
) -> Result<EncodeSpec, LadderError> {
    if profiles.is_empty() {
        return Err(LadderError::EmptyLadder);
    }
    if settings.gop_size == 0 || settings.segment_seconds == 0 || settings.frame_rate == 0 {
        return Err(LadderError::InvalidSettings(
            "gop_size, segment_seconds and frame_rate must be positive".to_string(),
        ));
    }

    let output_root = settings.output_base.join(source_key);
    // One expression for all renditions keeps segment boundaries aligned
    let force_key_frames = format!("expr:gte(t,n_forced*{})", settings.segment_seconds);

    let renditions = profiles
        .iter()
        .enumerate()
        .map(|(index, profile)| {
            validate_profile(profile)?;
            let codecs = codec_string(&profile.codec_profile, &profile.codec_level)
                .ok_or_else(|| invalid(profile, "unsupported codec profile or level"))?;
            let output_dir = output_root.join(&profile.name);

            Ok(RenditionSpec {
                index,
                name: profile.name.clone(),
                width: profile.width,
                height: profile.height,
                scale_filter: format!(
                    "scale=w={}:h={}:force_original_aspect_ratio=decrease:force_divisible_by=2",
                    profile.width, profile.height
                ),
                gop_size: settings.gop_size,
                keyint_min: settings.gop_size,
                force_key_frames: force_key_frames.clone(),
                segment_seconds: settings.segment_seconds,
                video_bitrate_kbps: profile.video_bitrate_kbps,
                max_bitrate_kbps: profile.max_bitrate_kbps,
                buffer_size_kbps: profile.buffer_size_kbps,
                audio_bitrate_kbps: profile.audio_bitrate_kbps,
                codec_profile: profile.codec_profile.clone(),
                codec_level: profile.codec_level.clone(),
                codecs,
                playlist_path: output_dir.join(RENDITION_PLAYLIST),
                output_dir,
            })
        })
        .collect::<Result<Vec<_>, LadderError>>()?;

    Ok(EncodeSpec {
        source_key: source_key.to_string(),
        input_url: format!(
            "{}/{}",
            settings.input_base_url.trim_end_matches('/'),
            source_key
        ),
        output_root,
        preset: settings.preset.clone(),
        tune: settings.tune.clone(),
        frame_rate: settings.frame_rate,
        segment_seconds: settings.segment_seconds,
        playlist_size: settings.playlist_size,
        audio_sample_rate: settings.audio_sample_rate,
        renditions,
    })
}

fn validate_profile(profile: &QualityProfile) -> Result<(), LadderError> {
    if profile.name.is_empty() {
        return Err(invalid(profile, "name is empty"));
    }
    if profile.width == 0 || profile.height == 0 {
        return Err(invalid(profile, "width and height must be positive"));
    }
    let bitrates = [
        ("video_bitrate_kbps", profile.video_bitrate_kbps),
        ("max_bitrate_kbps", profile.max_bitrate_kbps),
        ("buffer_size_kbps", profile.buffer_size_kbps),
        ("audio_bitrate_kbps", profile.audio_bitrate_kbps),
    ];
    if let Some((field, _)) = bitrates.iter().find(|(_, v)| *v == 0) {
        return Err(invalid(profile, &format!("{} must be positive", field)));
    }
    Ok(())
}

fn invalid(profile: &QualityProfile, reason: &str) -> LadderError {
    LadderError::InvalidProfile {
        name: profile.name.clone(),
        reason: reason.to_string(),
    }
}

/// RFC 6381 codec string for an H.264 profile/level with AAC-LC audio.
///
/// `("main", "3.1")` becomes `avc1.4d401f,mp4a.40.2`.
pub fn codec_string(profile: &str, level: &str) -> Option<String> {
    let (profile_idc, constraints) = match profile.to_ascii_lowercase().as_str() {
        "baseline" => (0x42u8, 0xe0u8),
        "main" => (0x4d, 0x40),
        "high" => (0x64, 0x00),
        _ => return None,
    };

    let (major, minor) = level.split_once('.').unwrap_or((level, "0"));
    let major: u8 = major.parse().ok()?;
    let minor: u8 = minor.parse().ok()?;
    if minor > 9 || !(1..=6).contains(&major) {
        return None;
    }
    let level_idc = major * 10 + minor;

    Some(format!(
        "avc1.{:02x}{:02x}{:02x},mp4a.40.2",
        profile_idc, constraints, level_idc
    ))
}
