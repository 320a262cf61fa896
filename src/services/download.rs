//! Remote image download.
//!
//! Fetches an absolute HTTP(S) URL with a hard byte cap enforced while the
//! body streams in, so an oversized transfer is aborted the moment the cap
//! is crossed rather than after buffering it.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use std::time::Duration;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{AppError, Result};

const MAX_REDIRECTS: usize = 5;
const ERROR_BODY_PREVIEW: usize = 256;

/// Raw bytes plus the observed Content-Type header.
#[derive(Debug)]
pub struct Download {
    pub body: Bytes,
    pub content_type: Option<String>,
}

pub struct Downloader {
    client: reqwest::Client,
    max_bytes: u64,
}

impl Downloader {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::Internal(format!("http client init failed: {e}")))?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    pub async fn fetch(&self, url: &Url) -> Result<Download> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AppError::Validation(format!(
                    "unsupported download scheme: {other}"
                )))
            }
        }

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(ERROR_BODY_PREVIEW);
            return Err(AppError::DownloadFailed {
                status: Some(status.as_u16()),
                message,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(AppError::DownloadTooLarge {
                    max_bytes: self.max_bytes,
                });
            }
        }

        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(AppError::DownloadTooLarge {
                    max_bytes: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(AppError::DownloadFailed {
                status: Some(status.as_u16()),
                message: "empty response body".to_string(),
            });
        }

        Ok(Download {
            body: body.freeze(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_non_http_schemes() {
        let downloader = Downloader::new(&HttpConfig::default()).unwrap();
        let url = Url::parse("ftp://example.com/a.jpg").unwrap();
        assert!(matches!(
            downloader.fetch(&url).await,
            Err(AppError::Validation(_))
        ));
    }
}
