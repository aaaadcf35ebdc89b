//! Readiness probing.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};

/// Per-request timeout of a readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Boxed future returned by [`HealthCheck::check`].
pub type HealthFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Decides whether the tool listening on `address:port` is ready.
pub trait HealthCheck: Send + Sync {
    /// Resolves to true once the tool answers.
    fn check<'a>(&'a self, address: &'a str, port: u16) -> HealthFuture<'a>;
}

/// Probes an HTTP endpoint and expects `200 OK`.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthCheck {
    /// Creates a probe for `path` (for example `/system_stats`).
    ///
    /// # Errors
    /// `Config` if the HTTP client cannot be built.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            path: path.into(),
        })
    }

    /// Returns the probe URL for `address:port`.
    #[must_use]
    pub fn url(&self, address: &str, port: u16) -> String {
        let host = if address.contains(':') && !address.starts_with('[') {
            format!("[{}]", address)
        } else {
            address.to_string()
        };
        format!("http://{}:{}{}", host, port, self.path)
    }
}

impl HealthCheck for HttpHealthCheck {
    fn check<'a>(&'a self, address: &'a str, port: u16) -> HealthFuture<'a> {
        Box::pin(async move {
            let url = self.url(address, port);
            match self.client.get(&url).send().await {
                Ok(response) => response.status() == reqwest::StatusCode::OK,
                Err(e) => {
                    trace!("[PROCESS] Probe {} failed: {}", url, e);
                    false
                }
            }
        })
    }
}
