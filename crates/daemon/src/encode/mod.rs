//! Encoding modules: quality ladder expansion and encoder invocation

pub mod ffmpeg;
pub mod ladder;

pub use ffmpeg::{build_ffmpeg_args, build_ffmpeg_command, EncoderLauncher, FfmpegLauncher};
pub use ladder::{
    build_encode_spec, codec_string, EncodeSettings, EncodeSpec, LadderError, RenditionSpec,
    RENDITION_PLAYLIST, SEGMENT_PATTERN,
};
