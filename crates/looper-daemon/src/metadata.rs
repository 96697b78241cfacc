//! oEmbed metadata lookup (title, author, thumbnail) for loaded media.
//!
//! Best effort: any failure leaves the placeholder metadata in place.

use looper_proto::config::MetadataConfig;
use looper_proto::media_ref::MediaRef;
use looper_proto::records::MediaMetadata;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("invalid oEmbed endpoint {0}")]
    Endpoint(String),
    #[error("oEmbed lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("oEmbed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("oEmbed endpoint returned status: {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
}

#[derive(Clone)]
pub struct MetadataClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl MetadataClient {
    pub fn new(config: &MetadataConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
        }
    }

    pub fn lookup_url(&self, media: &MediaRef) -> Result<Url, LookupError> {
        Url::parse_with_params(
            &self.endpoint,
            &[("url", media.watch_url().as_str()), ("format", "json")],
        )
        .map_err(|_| LookupError::Endpoint(self.endpoint.clone()))
    }

    pub async fn fetch(&self, media: &MediaRef) -> Result<MediaMetadata, LookupError> {
        let url = self.lookup_url(media)?;
        debug!("metadata: fetching {}", url);

        let request = async {
            let response = self
                .client
                .get(url)
                .header("Accept", "application/json")
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(LookupError::Status(response.status()));
            }
            Ok(response.json::<OEmbedResponse>().await?)
        };

        let data = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| LookupError::Timeout(self.timeout))??;

        Ok(into_metadata(media, data))
    }
}

/// Missing fields fall back to the placeholder values.
fn into_metadata(media: &MediaRef, data: OEmbedResponse) -> MediaMetadata {
    let placeholder = MediaMetadata::placeholder(media);
    let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
    MediaMetadata {
        title: non_empty(data.title).unwrap_or(placeholder.title),
        author: non_empty(data.author_name).unwrap_or(placeholder.author),
        thumbnail_url: non_empty(data.thumbnail_url).unwrap_or(placeholder.thumbnail_url),
    }
    .sanitized()
}
