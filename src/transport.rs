//! HTTP transport seam.
//!
//! The engine only ever issues two kinds of request: a `HEAD` to discover a
//! resource's size and a ranged `GET` for one segment. [`Transport`] captures
//! exactly that, so the probe and fetch logic can be exercised without a
//! network.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use thiserror::Error;

use crate::plan::ByteRange;

/// Response to a `HEAD` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadResponse {
    pub status: u16,
    /// Raw `Content-Length` header value.
    pub content_length: Option<String>,
    /// Raw `Content-Type` header value.
    pub content_type: Option<String>,
}

/// Response to a ranged `GET`.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub status: u16,
    pub body: Bytes,
}

/// A request that produced no usable response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Request(String),
}

/// Issues the two request kinds the engine needs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `HEAD url`.
    async fn head(&self, url: &str) -> Result<HeadResponse, TransportError>;

    /// Sends `GET url` with `Range: bytes=start-end` and reads the whole body.
    async fn get_range(&self, url: &str, range: ByteRange) -> Result<RangeResponse, TransportError>;
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// [`Transport`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a client tuned for many short ranged requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn head(&self, url: &str) -> Result<HeadResponse, TransportError> {
        let response = self.client.head(url).send().await?;
        let headers = response.headers();
        Ok(HeadResponse {
            status: response.status().as_u16(),
            content_length: header_string(headers, CONTENT_LENGTH),
            content_type: header_string(headers, CONTENT_TYPE),
        })
    }

    async fn get_range(&self, url: &str, range: ByteRange) -> Result<RangeResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, range.header_value())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(RangeResponse { status, body })
    }
}
