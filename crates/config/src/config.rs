//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Where live sources come from and how their publishing state is queried
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// Status endpoint of the ingestion server (nginx-rtmp `stat` XML)
    #[serde(default = "default_status_url")]
    pub status_url: String,
    /// Application whose streams are transcoded
    #[serde(default = "default_application")]
    pub application: String,
    /// Base URL the encoder pulls `{input_base_url}/{source_key}` from
    #[serde(default = "default_input_base_url")]
    pub input_base_url: String,
    /// Upper bound on a single status query
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_status_url() -> String {
    "http://localhost:8080/stat".to_string()
}

fn default_application() -> String {
    "live".to_string()
}

fn default_input_base_url() -> String {
    "rtmp://localhost:1935/live".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            status_url: default_status_url(),
            application: default_application(),
            input_base_url: default_input_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcilerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Disable to run with manual start/stop only
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            enabled: true,
        }
    }
}

/// Output and lock locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Each source writes under `{root}/{source_key}`
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
    /// Directory holding one lock marker per source
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("/tmp/hls_shared")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/tmp/abr_orchestrator_locks")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            lock_dir: default_lock_dir(),
        }
    }
}

/// Encoder invocation settings shared by every rendition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_tune")]
    pub tune: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Keyframe interval in frames, identical for all renditions
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    /// Segments kept in each rendition playlist
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    /// Time allowed for a graceful quit before the encoder is killed
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Kill the encoder when no new segment shows up for this long (0 disables)
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    #[serde(default = "default_manifest_refresh_ms")]
    pub manifest_refresh_ms: u64,
}

fn default_binary() -> String {
    "ffmpeg".to_string()
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_tune() -> String {
    "zerolatency".to_string()
}

fn default_frame_rate() -> u32 {
    30
}

fn default_gop_size() -> u32 {
    60
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    6
}

fn default_audio_sample_rate() -> u32 {
    44100
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_stall_timeout_secs() -> u64 {
    30
}

fn default_manifest_refresh_ms() -> u64 {
    2000
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            preset: default_preset(),
            tune: default_tune(),
            frame_rate: default_frame_rate(),
            gop_size: default_gop_size(),
            segment_seconds: default_segment_seconds(),
            playlist_size: default_playlist_size(),
            audio_sample_rate: default_audio_sample_rate(),
            stop_grace_secs: default_stop_grace_secs(),
            stall_timeout_secs: default_stall_timeout_secs(),
            manifest_refresh_ms: default_manifest_refresh_ms(),
        }
    }
}

/// Job table retention policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// How long a failed job stays visible through status queries
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
}

fn default_failed_retention_secs() -> u64 {
    30
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            failed_retention_secs: default_failed_retention_secs(),
        }
    }
}

/// Control API listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8083".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// One rung of the quality ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityProfile {
    /// Rendition label, also the rendition's directory name
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    pub audio_bitrate_kbps: u32,
    /// H.264 profile (`baseline`, `main`, `high`)
    pub codec_profile: String,
    /// H.264 level (`3.0`, `3.1`, `4.0`, ...)
    pub codec_level: String,
}

impl QualityProfile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        width: u32,
        height: u32,
        video_bitrate_kbps: u32,
        max_bitrate_kbps: u32,
        buffer_size_kbps: u32,
        audio_bitrate_kbps: u32,
        codec_profile: &str,
        codec_level: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            video_bitrate_kbps,
            max_bitrate_kbps,
            buffer_size_kbps,
            audio_bitrate_kbps,
            codec_profile: codec_profile.to_string(),
            codec_level: codec_level.to_string(),
        }
    }
}

/// The ladder used when the config file does not define one
pub fn default_ladder() -> Vec<QualityProfile> {
    vec![
        QualityProfile::new("1080p", 1920, 1080, 5000, 5500, 5000, 128, "main", "4.0"),
        QualityProfile::new("720p", 1280, 720, 2800, 3000, 2800, 128, "main", "3.1"),
        QualityProfile::new("480p", 854, 480, 1400, 1500, 1400, 128, "main", "3.0"),
        QualityProfile::new("360p", 640, 360, 800, 900, 800, 96, "baseline", "3.0"),
    ]
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_ladder")]
    pub ladder: Vec<QualityProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            reconciler: ReconcilerConfig::default(),
            output: OutputConfig::default(),
            encoder: EncoderConfig::default(),
            jobs: JobsConfig::default(),
            server: ServerConfig::default(),
            ladder: default_ladder(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ABR_INGEST_STATUS_URL -> ingest.status_url
    /// - ABR_INGEST_APPLICATION -> ingest.application
    /// - ABR_INPUT_BASE_URL -> ingest.input_base_url
    /// - ABR_POLL_INTERVAL_SECS -> reconciler.poll_interval_secs
    /// - ABR_OUTPUT_ROOT -> output.root
    /// - ABR_LOCK_DIR -> output.lock_dir
    /// - ABR_ENCODER_BINARY -> encoder.binary
    /// - ABR_SERVER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ABR_INGEST_STATUS_URL") {
            self.ingest.status_url = val;
        }

        if let Ok(val) = env::var("ABR_INGEST_APPLICATION") {
            self.ingest.application = val;
        }

        if let Ok(val) = env::var("ABR_INPUT_BASE_URL") {
            self.ingest.input_base_url = val;
        }

        // Unparseable values keep the existing setting
        if let Ok(val) = env::var("ABR_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.reconciler.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("ABR_OUTPUT_ROOT") {
            self.output.root = PathBuf::from(val);
        }

        if let Ok(val) = env::var("ABR_LOCK_DIR") {
            self.output.lock_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("ABR_ENCODER_BINARY") {
            self.encoder.binary = val;
        }

        if let Ok(val) = env::var("ABR_SERVER_BIND") {
            self.server.bind = val;
        }
    }

    /// Check invariants that parsing alone cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconciler.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconciler.poll_interval_secs must be positive".to_string(),
            ));
        }

        let enc = &self.encoder;
        if enc.frame_rate == 0 || enc.gop_size == 0 || enc.segment_seconds == 0 {
            return Err(ConfigError::Invalid(
                "encoder.frame_rate, gop_size and segment_seconds must be positive".to_string(),
            ));
        }
        let frames_per_segment = enc.frame_rate * enc.segment_seconds;
        if frames_per_segment % enc.gop_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "encoder.gop_size {} does not divide {} frames per segment",
                enc.gop_size, frames_per_segment
            )));
        }

        validate_ladder(&self.ladder)
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Checks that the ladder is non-empty, well-formed and ordered
/// highest quality first.
pub fn validate_ladder(ladder: &[QualityProfile]) -> Result<(), ConfigError> {
    if ladder.is_empty() {
        return Err(ConfigError::Invalid("ladder has no profiles".to_string()));
    }

    let mut names = HashSet::new();
    for profile in ladder {
        let safe_name = !profile.name.is_empty()
            && profile
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe_name {
            return Err(ConfigError::Invalid(format!(
                "profile name '{}' must be non-empty and use only [A-Za-z0-9_-]",
                profile.name
            )));
        }
        if !names.insert(profile.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate profile name '{}'",
                profile.name
            )));
        }
    }

    for pair in ladder.windows(2) {
        let (higher, lower) = (&pair[0], &pair[1]);
        let key = |p: &QualityProfile| (p.height, p.max_bitrate_kbps);
        if key(lower) >= key(higher) {
            return Err(ConfigError::Invalid(format!(
                "profile '{}' must rank below '{}' (ladder is highest quality first)",
                lower.name, higher.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for var in [
            "ABR_INGEST_STATUS_URL",
            "ABR_INGEST_APPLICATION",
            "ABR_INPUT_BASE_URL",
            "ABR_POLL_INTERVAL_SECS",
            "ABR_OUTPUT_ROOT",
            "ABR_LOCK_DIR",
            "ABR_ENCODER_BINARY",
            "ABR_SERVER_BIND",
        ] {
            env::remove_var(var);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            poll in 1u64..60,
            timeout_ms in 100u64..10_000,
            segment_seconds in 1u32..10,
            playlist_size in 1u32..20,
            retention in 0u64..600,
            enabled in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[ingest]
status_url = "http://ingest:8080/stat"
timeout_ms = {}

[reconciler]
poll_interval_secs = {}
enabled = {}

[output]
root = "/srv/hls"

[encoder]
segment_seconds = {}
playlist_size = {}

[jobs]
failed_retention_secs = {}
"#,
                timeout_ms, poll, enabled, segment_seconds, playlist_size, retention
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.ingest.status_url.as_str(), "http://ingest:8080/stat");
            prop_assert_eq!(config.ingest.timeout_ms, timeout_ms);
            prop_assert_eq!(config.reconciler.poll_interval_secs, poll);
            prop_assert_eq!(config.reconciler.enabled, enabled);
            prop_assert_eq!(config.output.root, PathBuf::from("/srv/hls"));
            prop_assert_eq!(config.encoder.segment_seconds, segment_seconds);
            prop_assert_eq!(config.encoder.playlist_size, playlist_size);
            prop_assert_eq!(config.jobs.failed_retention_secs, retention);
            // Untouched sections keep their defaults
            prop_assert_eq!(config.ladder, default_ladder());
        }

        #[test]
        fn prop_env_overrides_poll_interval(
            initial in 1u64..30,
            override_secs in 1u64..120,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[reconciler]\npoll_interval_secs = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ABR_POLL_INTERVAL_SECS", override_secs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.reconciler.poll_interval_secs, override_secs);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.ingest.status_url, "http://localhost:8080/stat");
        assert_eq!(config.reconciler.poll_interval_secs, 3);
        assert_eq!(config.encoder.gop_size, 60);
        assert_eq!(config.encoder.segment_seconds, 2);
        assert_eq!(config.ladder.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ladder_section_replaces_default() {
        let toml_str = r#"
[[ladder]]
name = "720p"
width = 1280
height = 720
video_bitrate_kbps = 2800
max_bitrate_kbps = 3000
buffer_size_kbps = 2800
audio_bitrate_kbps = 128
codec_profile = "main"
codec_level = "3.1"

[[ladder]]
name = "360p"
width = 640
height = 360
video_bitrate_kbps = 800
max_bitrate_kbps = 900
buffer_size_kbps = 800
audio_bitrate_kbps = 96
codec_profile = "baseline"
codec_level = "3.0"
"#;
        let config = Config::parse_toml(toml_str).expect("ladder should parse");
        assert_eq!(config.ladder.len(), 2);
        assert_eq!(config.ladder[0].name, "720p");
        assert_eq!(config.ladder[1].max_bitrate_kbps, 900);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_paths_and_urls() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("ABR_OUTPUT_ROOT", "/data/out");
        env::set_var("ABR_LOCK_DIR", "/data/locks");
        env::set_var("ABR_INGEST_STATUS_URL", "http://rtmp:8080/stat");
        env::set_var("ABR_POLL_INTERVAL_SECS", "not-a-number");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.output.root, PathBuf::from("/data/out"));
        assert_eq!(config.output.lock_dir, PathBuf::from("/data/locks"));
        assert_eq!(config.ingest.status_url, "http://rtmp:8080/stat");
        assert_eq!(config.reconciler.poll_interval_secs, 3);
    }

    #[test]
    fn test_validate_rejects_misordered_ladder() {
        let mut ladder = default_ladder();
        ladder.swap(0, 1);
        assert!(matches!(
            validate_ladder(&ladder),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_and_unsafe_names() {
        let mut ladder = default_ladder();
        ladder[1].name = "1080p".to_string();
        assert!(validate_ladder(&ladder).is_err());

        let mut ladder = default_ladder();
        ladder[0].name = "../up".to_string();
        assert!(validate_ladder(&ladder).is_err());

        assert!(validate_ladder(&[]).is_err());
    }

    #[test]
    fn test_validate_rejects_misaligned_gop() {
        let mut config = Config::default();
        config.encoder.gop_size = 45;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gop_size"));

        config.encoder.gop_size = 30;
        assert!(config.validate().is_ok());
    }
}
