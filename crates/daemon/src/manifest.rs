//! Manifest generator: builds the top-level adaptive playlist that points
//! at each rendition's own playlist.
//!
//! Only renditions with playable output are listed. A rendition directory
//! that exists but has no valid playlist or no segment on disk is skipped,
//! which is the normal situation during the first seconds of a job.

use crate::encode::{EncodeSpec, RenditionSpec, RENDITION_PLAYLIST};
use m3u8_rs::Playlist;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name of the top-level manifest inside a job's output root
pub const MASTER_PLAYLIST: &str = "master.m3u8";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to write manifest {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// One `#EXT-X-STREAM-INF` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    pub name: String,
    /// Peak bits per second; a safe upper bound for client pre-flight selection
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
    pub codecs: String,
    /// Playlist path relative to the master
    pub uri: String,
}

impl VariantEntry {
    fn from_rendition(r: &RenditionSpec) -> Self {
        Self {
            name: r.name.clone(),
            bandwidth: r.peak_bandwidth_bps(),
            width: r.width,
            height: r.height,
            codecs: r.codecs.clone(),
            uri: format!("{}/{}", r.name, RENDITION_PLAYLIST),
        }
    }
}

/// Top-level manifest content, highest quality first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManifestDocument {
    pub variants: Vec<VariantEntry>,
}

impl ManifestDocument {
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Render as an HLS master playlist
    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-INDEPENDENT-SEGMENTS\n");
        for v in &self.variants {
            // Writing to a String cannot fail
            let _ = write!(
                out,
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\"\n{}\n",
                v.bandwidth, v.width, v.height, v.codecs, v.uri
            );
        }
        out
    }
}

/// Result of a publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The manifest changed and was rewritten
    Written(usize),
    /// The manifest on disk already matched
    Unchanged(usize),
    /// No rendition has output yet; nothing was written
    Empty,
}

/// Build the manifest for a job from what is currently on disk.
///
/// Ladder order is preserved, so the same set of available renditions
/// always produces the same document.
pub fn regenerate(spec: &EncodeSpec) -> ManifestDocument {
    ManifestDocument {
        variants: spec
            .renditions
            .iter()
            .filter(|r| rendition_has_output(r))
            .map(VariantEntry::from_rendition)
            .collect(),
    }
}

/// Whether a rendition has a valid media playlist with at least one segment
/// present on disk
pub fn rendition_has_output(rendition: &RenditionSpec) -> bool {
    let Ok(bytes) = fs::read(&rendition.playlist_path) else {
        return false;
    };
    match m3u8_rs::parse_playlist_res(&bytes) {
        Ok(Playlist::MediaPlaylist(playlist)) => playlist
            .segments
            .iter()
            .any(|segment| segment_exists(&rendition.output_dir, &segment.uri)),
        Ok(Playlist::MasterPlaylist(_)) => false,
        Err(_) => {
            debug!(path = %rendition.playlist_path.display(), "rendition playlist not parseable yet");
            false
        }
    }
}

fn segment_exists(dir: &Path, uri: &str) -> bool {
    // Absolute URLs point elsewhere and cannot be checked locally
    if uri.contains("://") {
        return false;
    }
    let name = uri.split('?').next().unwrap_or(uri);
    fs::metadata(dir.join(name))
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Regenerate and write `master.m3u8` under the job's output root.
///
/// The file is replaced atomically and only when its content changes, so
/// redundant calls leave the file untouched.
pub fn publish(spec: &EncodeSpec) -> Result<PublishOutcome, ManifestError> {
    let document = regenerate(spec);
    if document.is_empty() {
        return Ok(PublishOutcome::Empty);
    }

    let rendered = document.render();
    let path = spec.output_root.join(MASTER_PLAYLIST);
    if fs::read_to_string(&path).is_ok_and(|existing| existing == rendered) {
        return Ok(PublishOutcome::Unchanged(document.variants.len()));
    }

    write_atomic(&path, rendered.as_bytes()).map_err(|source| ManifestError::Write {
        path: path.clone(),
        source,
    })?;
    debug!(
        source_key = %spec.source_key,
        variants = document.variants.len(),
        "published master playlist"
    );
    Ok(PublishOutcome::Written(document.variants.len()))
}

/// Write through a sibling temporary file and rename over the target, so
/// readers see either the old or the new manifest, never a partial one.
fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("m3u8.tmp");
    fs::write(&tmp, contents)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
