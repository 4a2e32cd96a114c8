//! One ranged `GET`, one outcome.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::FetchError;
use crate::fs::FileSystem;
use crate::plan::ByteRange;
use crate::transport::{Transport, TransportError};

/// Fetches a single segment into a temp file. Never retries.
#[derive(Clone)]
pub struct SegmentFetcher {
    transport: Arc<dyn Transport>,
    fs: Arc<dyn FileSystem>,
    timeout: Duration,
}

impl SegmentFetcher {
    /// Creates a fetcher with the given request timeout.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, fs: Arc<dyn FileSystem>, timeout: Duration) -> Self {
        Self {
            transport,
            fs,
            timeout,
        }
    }

    /// Fetches `range` of `url` and writes it durably to `dest`.
    ///
    /// Returns the number of bytes written, which always equals `range.len()`.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, timeouts, statuses other than 200/206, empty
    /// bodies, bodies that do not match the range, and write errors.
    pub async fn fetch(&self, url: &str, range: ByteRange, dest: &Path) -> Result<u64, FetchError> {
        let response = match tokio::time::timeout(self.timeout, self.transport.get_range(url, range)).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => return Err(FetchError::Timeout),
            Ok(Err(TransportError::Request(msg))) => return Err(FetchError::Transport(msg)),
            Ok(Ok(response)) => response,
        };

        if response.status != 200 && response.status != 206 {
            return Err(FetchError::Status(response.status));
        }
        if response.body.is_empty() {
            return Err(FetchError::EmptyBody);
        }

        let body = slice_to_range(response.status, response.body, range)?;
        self.fs.write_durable(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

/// Checks the body against the requested range.
///
/// A 200 carrying the full resource means the server ignored `Range`; the
/// requested bytes are cut out of it.
#[allow(clippy::cast_possible_truncation)]
fn slice_to_range(status: u16, body: Bytes, range: ByteRange) -> Result<Bytes, FetchError> {
    let actual = body.len() as u64;
    if actual == range.len() {
        return Ok(body);
    }
    if status == 200 && actual > range.end {
        return Ok(body.slice(range.start as usize..=range.end as usize));
    }
    Err(FetchError::LengthMismatch {
        expected: range.len(),
        actual,
    })
}
