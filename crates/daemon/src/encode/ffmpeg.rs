//! FFmpeg encoder module
//!
//! Turns an [`EncodeSpec`] into a single ffmpeg invocation that reads the
//! live source once and writes every rendition as segmented HLS.

use super::ladder::{EncodeSpec, RENDITION_PLAYLIST, SEGMENT_PATTERN};
use std::io;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// HLS muxer flags; segments are independently decodable and old ones are pruned
const HLS_FLAGS: &str = "delete_segments+independent_segments+program_date_time";

/// Launches encoder processes for encode specs.
///
/// The Job Manager only talks to this trait, so tests can substitute a
/// stand-in process for the real encoder.
pub trait EncoderLauncher: Send + Sync + 'static {
    fn launch(&self, spec: &EncodeSpec) -> io::Result<Child>;
}

/// Launches the real ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    binary: String,
}

impl FfmpegLauncher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, spec: &EncodeSpec) -> io::Result<Child> {
        build_ffmpeg_command(&self.binary, spec).spawn()
    }
}

/// Build the ffmpeg argument list for an encode spec
///
/// Per rendition the arguments carry:
/// - one video and one audio map from the single input
/// - libx264 with the shared GOP size, scene-cut disabled and forced
///   keyframes on segment boundaries
/// - the rendition's scale filter and rate-control triple
/// - AAC stereo audio at the rendition's audio bitrate
///
/// followed by the HLS muxer writing `{output_root}/{name}/playlist.m3u8`.
pub fn build_ffmpeg_args(spec: &EncodeSpec) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-y",
        "-fflags",
        "+genpts",
        "-avoid_negative_ts",
        "make_zero",
        "-i",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(spec.input_url.clone());

    for _ in &spec.renditions {
        args.extend(["-map", "0:v:0", "-map", "0:a:0"].map(String::from));
    }

    // Constant output frame rate so a GOP measured in frames is a fixed duration
    args.push("-r".to_string());
    args.push(spec.frame_rate.to_string());

    for r in &spec.renditions {
        let i = r.index;
        let mut push = |flag: String, value: String| {
            args.push(flag);
            args.push(value);
        };

        push(format!("-c:v:{i}"), "libx264".to_string());
        push(format!("-preset:v:{i}"), spec.preset.clone());
        push(format!("-tune:v:{i}"), spec.tune.clone());
        push(format!("-profile:v:{i}"), r.codec_profile.clone());
        push(format!("-level:v:{i}"), r.codec_level.clone());
        push(format!("-g:v:{i}"), r.gop_size.to_string());
        push(format!("-keyint_min:v:{i}"), r.keyint_min.to_string());
        push(format!("-sc_threshold:v:{i}"), "0".to_string());
        push(format!("-force_key_frames:v:{i}"), r.force_key_frames.clone());
        push(format!("-filter:v:{i}"), r.scale_filter.clone());
        push(format!("-b:v:{i}"), format!("{}k", r.video_bitrate_kbps));
        push(format!("-maxrate:v:{i}"), format!("{}k", r.max_bitrate_kbps));
        push(format!("-bufsize:v:{i}"), format!("{}k", r.buffer_size_kbps));
        push(format!("-c:a:{i}"), "aac".to_string());
        push(format!("-b:a:{i}"), format!("{}k", r.audio_bitrate_kbps));
        push(format!("-ac:a:{i}"), "2".to_string());
        push(format!("-ar:a:{i}"), spec.audio_sample_rate.to_string());
    }

    let var_stream_map = spec
        .renditions
        .iter()
        .map(|r| format!("v:{i},a:{i},name:{}", r.name, i = r.index))
        .collect::<Vec<_>>()
        .join(" ");
    let root = spec.output_root.to_string_lossy();

    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        spec.segment_seconds.to_string(),
        "-hls_list_size".to_string(),
        spec.playlist_size.to_string(),
        "-hls_flags".to_string(),
        HLS_FLAGS.to_string(),
        "-hls_segment_type".to_string(),
        "mpegts".to_string(),
        "-hls_segment_filename".to_string(),
        format!("{}/%v/{}", root, SEGMENT_PATTERN),
        "-var_stream_map".to_string(),
        var_stream_map,
    ]);
    args.push(format!("{}/%v/{}", root, RENDITION_PLAYLIST));

    args
}

/// Build a ready-to-spawn ffmpeg command.
///
/// stdin is piped so the supervisor can request a graceful quit; stderr is
/// piped so encoder errors reach the log.
pub fn build_ffmpeg_command(binary: &str, spec: &EncodeSpec) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(build_ffmpeg_args(spec))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
