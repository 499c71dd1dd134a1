//! Integration tests
//!
//! End-to-end flows through `ResilientClient`, plus the HTTP health probe
//! against a WireMock server.

mod end_to_end;
mod health_probe;
mod offline_replay;
mod resilience;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracker_data_client::{
    BackendProbe, ClientConfig, ConnectivitySignal, DataResult, OperationKind, RawError,
    ResilientClient, RetryPolicy, WriteOutcome,
};
use wiremock::MockServer;

/// Helper to create a mock server
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Probe that always reports a healthy backend
pub struct StaticProbe;

#[async_trait]
impl BackendProbe for StaticProbe {
    async fn connectivity(&self) -> Result<(), RawError> {
        Ok(())
    }

    async fn core_table(&self) -> Result<(), RawError> {
        Ok(())
    }

    async fn derived_view(&self) -> Result<(), RawError> {
        Ok(())
    }

    async fn realtime(&self) -> Result<(), RawError> {
        Ok(())
    }
}

/// Fast retries without jitter, for paused-clock tests
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new()
        .max_attempts(3)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(100))
        .with_jitter(false)
}

/// Client over `StaticProbe` sharing `signal`
pub fn test_client(config: ClientConfig, signal: ConnectivitySignal) -> Arc<ResilientClient> {
    let client = ResilientClient::builder(config)
        .probe(Arc::new(StaticProbe))
        .connectivity(signal)
        .build()
        .expect("client should build");
    Arc::new(client)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tool {
    pub id: u32,
    pub name: String,
}

/// In-memory stand-in for the backend's `tools` table
#[derive(Default)]
pub struct FakeBackend {
    rows: Mutex<BTreeMap<u32, Tool>>,
    pub list_calls: AtomicU32,
    pub update_log: Mutex<Vec<(u32, String)>>,
    failures_left: AtomicU32,
}

impl FakeBackend {
    pub fn with_tools(tools: &[(u32, &str)]) -> Arc<Self> {
        let backend = Self::default();
        {
            let mut rows = backend.rows.lock();
            for (id, name) in tools {
                rows.insert(
                    *id,
                    Tool {
                        id: *id,
                        name: name.to_string(),
                    },
                );
            }
        }
        Arc::new(backend)
    }

    /// Make the next `n` calls fail with a 503
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<(), RawError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(RawError::new("503", "Service Unavailable").with_status(503));
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<Tool>, RawError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        Ok(self.rows.lock().values().cloned().collect())
    }

    pub fn update(&self, id: u32, name: &str) -> Result<Tool, RawError> {
        self.maybe_fail()?;
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| RawError::new("PGRST116", "JSON object requested, multiple (or no) rows returned"))?;
        row.name = name.to_string();
        self.update_log.lock().push((id, name.to_string()));
        Ok(row.clone())
    }

    pub fn name_of(&self, id: u32) -> Option<String> {
        self.rows.lock().get(&id).map(|t| t.name.clone())
    }
}

/// The kind of CRUD wrapper an application builds on the client
pub struct ToolService {
    client: Arc<ResilientClient>,
    backend: Arc<FakeBackend>,
}

impl ToolService {
    pub fn new(client: Arc<ResilientClient>, backend: Arc<FakeBackend>) -> Self {
        Self { client, backend }
    }

    pub async fn all_tools(&self) -> DataResult<Vec<Tool>> {
        let backend = self.backend.clone();
        self.client
            .execute_read("tools", "tools:all", Some(Duration::from_secs(60)), || {
                let backend = backend.clone();
                async move { backend.list() }
            })
            .await
    }

    pub async fn update_tool(&self, id: u32, name: &str) -> DataResult<WriteOutcome<Tool>> {
        let backend = self.backend.clone();
        let name = name.to_string();
        self.client
            .execute_write("tools", OperationKind::Update, move || {
                let backend = backend.clone();
                let name = name.clone();
                async move { backend.update(id, &name) }
            })
            .await
    }
}
