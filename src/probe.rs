//! Size discovery via `HEAD`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::ProbeError;
use crate::transport::{Transport, TransportError};

/// What a successful probe learned about a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    /// Total length in bytes, always positive.
    pub size: u64,
    /// `Content-Type`, if the server sent one.
    pub content_type: Option<String>,
}

/// Issues metadata-only requests. Stateless and safe to race.
#[derive(Clone)]
pub struct SizeProbe {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl SizeProbe {
    /// Creates a probe with the given request timeout.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Discovers the size of `url`.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, timeouts, non-2xx statuses, and missing,
    /// unparsable or zero `Content-Length`.
    pub async fn probe(&self, url: &str) -> Result<ProbeInfo, ProbeError> {
        let response = match tokio::time::timeout(self.timeout, self.transport.head(url)).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => return Err(ProbeError::Timeout),
            Ok(Err(TransportError::Request(msg))) => return Err(ProbeError::Transport(msg)),
            Ok(Ok(response)) => response,
        };

        if !(200..300).contains(&response.status) {
            return Err(ProbeError::Status(response.status));
        }

        let raw = response.content_length.ok_or(ProbeError::MissingLength)?;
        let size = match raw.trim().parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => return Err(ProbeError::InvalidLength(raw)),
        };

        log::debug!("Probed {url}: {size} bytes");
        Ok(ProbeInfo {
            size,
            content_type: response.content_type,
        })
    }
}
