//! Ingestion status client.
//!
//! The reconciler only needs one thing from the ingestion layer: the set of
//! source keys currently publishing. [`SourceStatus`] is that seam;
//! [`NginxRtmpStatus`] implements it against the nginx-rtmp `stat` page.

use crate::config::IngestConfig;
use crate::jobs::is_valid_source_key;
use async_trait::async_trait;
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// The status query failed; the reconciler treats this as "no information"
#[derive(Debug, Error)]
pub enum PollError {
    #[error("status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("status endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("unparseable status document: {0}")]
    Parse(#[from] quick_xml::DeError),
}

/// Read-only view of which sources are publishing
#[async_trait]
pub trait SourceStatus: Send + Sync {
    async fn published_sources(&self) -> Result<BTreeSet<String>, PollError>;
}

/// Polls an nginx-rtmp statistics endpoint
#[derive(Debug, Clone)]
pub struct NginxRtmpStatus {
    client: reqwest::Client,
    url: String,
    application: String,
}

impl NginxRtmpStatus {
    /// `timeout` bounds the whole request so a hung ingest server cannot
    /// stall the reconciler
    pub fn new(
        url: impl Into<String>,
        application: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PollError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            application: application.into(),
        })
    }

    pub fn from_config(cfg: &IngestConfig) -> Result<Self, PollError> {
        Self::new(
            cfg.status_url.clone(),
            cfg.application.clone(),
            Duration::from_millis(cfg.timeout_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SourceStatus for NginxRtmpStatus {
    async fn published_sources(&self) -> Result<BTreeSet<String>, PollError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::Status(status));
        }
        let body = response.text().await?;
        parse_published(&body, &self.application)
    }
}

#[derive(Debug, Deserialize)]
struct RtmpStat {
    #[serde(rename = "server", default)]
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    #[serde(rename = "application", default)]
    applications: Vec<Application>,
}

#[derive(Debug, Deserialize)]
struct Application {
    #[serde(default)]
    name: String,
    #[serde(default)]
    live: Option<Live>,
}

#[derive(Debug, Deserialize)]
struct Live {
    #[serde(rename = "stream", default)]
    streams: Vec<Stream>,
}

#[derive(Debug, Deserialize)]
struct Stream {
    #[serde(default)]
    name: String,
    /// Present as an empty element while a publisher is connected
    #[serde(default)]
    publishing: Option<IgnoredAny>,
}

/// Extract the publishing streams of `application` from an nginx-rtmp stat
/// document.
///
/// Streams with viewers but no publisher are not sources. Names that are
/// not usable as source keys are skipped.
pub fn parse_published(xml: &str, application: &str) -> Result<BTreeSet<String>, PollError> {
    let stat: RtmpStat = quick_xml::de::from_str(xml)?;

    let published = stat
        .servers
        .into_iter()
        .flat_map(|server| server.applications)
        .filter(|app| app.name == application)
        .filter_map(|app| app.live)
        .flat_map(|live| live.streams)
        .filter(|stream| stream.publishing.is_some())
        .filter_map(|stream| {
            if is_valid_source_key(&stream.name) {
                Some(stream.name)
            } else {
                warn!(name = %stream.name, "ignoring stream with unusable name");
                None
            }
        })
        .collect();
    Ok(published)
}
