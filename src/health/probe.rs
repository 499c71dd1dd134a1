//! Backend capability probes.

use crate::config::BackendConfig;
use crate::errors::{ConfigurationError, RawError};
use async_trait::async_trait;
use std::time::Duration;

/// Capability checks run by the health monitor, in this order
#[async_trait]
pub trait BackendProbe: Send + Sync {
    /// Basic reachability of the REST endpoint
    async fn connectivity(&self) -> Result<(), RawError>;

    /// Read one row from the core table
    async fn core_table(&self) -> Result<(), RawError>;

    /// Read one row from the derived view
    async fn derived_view(&self) -> Result<(), RawError>;

    /// Whether the realtime endpoint is available
    async fn realtime(&self) -> Result<(), RawError>;
}

/// Probe that talks to a PostgREST-style backend over HTTP
pub struct HttpBackendProbe {
    http: reqwest::Client,
    backend: BackendConfig,
}

impl HttpBackendProbe {
    /// Create a probe with its own HTTP client
    pub fn new(backend: BackendConfig, timeout: Duration) -> Result<Self, ConfigurationError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tracker-data-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigurationError::HttpClient(e.to_string()))?;
        Ok(Self::with_client(http, backend))
    }

    /// Create a probe using an existing HTTP client
    pub fn with_client(http: reqwest::Client, backend: BackendConfig) -> Self {
        Self { http, backend }
    }

    async fn get(&self, endpoint: &str) -> Result<reqwest::Response, RawError> {
        let response = self
            .http
            .get(self.backend.build_url(endpoint))
            .header("apikey", self.backend.api_key())
            .bearer_auth(self.backend.api_key())
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await?;
        Ok(response)
    }

    async fn expect_success(&self, endpoint: &str) -> Result<(), RawError> {
        let response = self.get(endpoint).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(RawError::from_response(status.as_u16(), &body))
    }

    fn table_endpoint(name: &str) -> String {
        format!("rest/v1/{name}?select=*&limit=1")
    }
}

#[async_trait]
impl BackendProbe for HttpBackendProbe {
    async fn connectivity(&self) -> Result<(), RawError> {
        self.expect_success("rest/v1/").await
    }

    async fn core_table(&self) -> Result<(), RawError> {
        self.expect_success(&Self::table_endpoint(&self.backend.core_table))
            .await
    }

    async fn derived_view(&self) -> Result<(), RawError> {
        self.expect_success(&Self::table_endpoint(&self.backend.derived_view))
            .await
    }

    async fn realtime(&self) -> Result<(), RawError> {
        let response = self.get("realtime/v1/").await?;
        let status = response.status();
        // Any answer below 500 means the realtime service is deployed.
        if status.is_server_error() {
            return Err(RawError::from_response(status.as_u16(), ""));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HttpBackendProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackendProbe")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
