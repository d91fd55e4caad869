//! Best-effort image download.

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;

use crate::util::{validate_url, UrlValidationError};

/// Hard cap on stored image bytes (1 MiB). Longer bodies are cut here.
pub const MAX_IMAGE_SIZE: usize = 1024 * 1024;

/// Why an image could not be downloaded. Never leaves this module's
/// [`ImageSource`] implementation; it only feeds the log line.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Invalid image URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
}

/// Where the parser gets item images from.
#[async_trait]
pub trait ImageSource: Sync {
    /// Returns the image bytes, or `None` if they are unavailable for any reason.
    async fn fetch(&self, url: &str) -> Option<Vec<u8>>;
}

/// Downloads images over HTTP with the shared client.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// GETs `url` and returns at most [`MAX_IMAGE_SIZE`] bytes of the body.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let url = validate_url(url)?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ImageError::HttpStatus(response.status().as_u16()));
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !append_capped(&mut bytes, &chunk, MAX_IMAGE_SIZE) {
                tracing::debug!(limit = MAX_IMAGE_SIZE, "Image truncated at size cap");
                break;
            }
        }
        // Dropping the stream here closes the connection even when truncated

        Ok(bytes)
    }
}

#[async_trait]
impl ImageSource for ImageFetcher {
    async fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        match self.download(url).await {
            Ok(bytes) => {
                tracing::trace!(url = %url, bytes = bytes.len(), "Image downloaded");
                Some(bytes)
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Image unavailable");
                None
            }
        }
    }
}

/// Appends as much of `chunk` as fits under `limit`.
///
/// Returns `false` once bytes had to be dropped, i.e. reading should stop.
fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buf.len());
    if chunk.len() > room {
        buf.extend_from_slice(&chunk[..room]);
        return false;
    }
    buf.extend_from_slice(chunk);
    true
}
