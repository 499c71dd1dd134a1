//! Read, write and invalidate through the full stack

use super::*;
use pretty_assertions::assert_eq;
use tracker_data_client::{CircuitState, ErrorCategory};

fn client() -> Arc<ResilientClient> {
    let config = ClientConfig::builder()
        .retry_policy(fast_retry())
        .build()
        .unwrap();
    test_client(config, ConnectivitySignal::online())
}

#[tokio::test(start_paused = true)]
async fn test_tools_all_cached_then_invalidated_by_update() {
    let backend = FakeBackend::with_tools(&[(1, "Hammer"), (2, "Saw")]);
    let client = client();
    let tools = ToolService::new(client.clone(), backend.clone());

    // First read misses the cache and reaches the backend.
    let first = tools.all_tools().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);

    // Within the TTL the cached value is returned.
    tokio::time::advance(Duration::from_secs(30)).await;
    let second = tools.all_tools().await.unwrap();
    assert_eq!(second, first);
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);

    // An update invalidates every `tools:` key.
    let updated = tools.update_tool(1, "Claw hammer").await.unwrap();
    assert_eq!(updated.completed().map(|t| t.name), Some("Claw hammer".to_string()));

    let third = tools.all_tools().await.unwrap();
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
    assert_eq!(third[0].name, "Claw hammer");

    let metrics = client.metrics();
    assert_eq!(metrics.reads, 3);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.writes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_entry_expires_after_ttl() {
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client(), backend.clone());

    tools.all_tools().await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    tools.all_tools().await.unwrap();
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    tools.all_tools().await.unwrap();
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_transparently() {
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let client = client();
    let tools = ToolService::new(client.clone(), backend.clone());

    backend.fail_next(2);
    let result = tools.all_tools().await.unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 3);
    assert_eq!(client.metrics().retries, 2);
    assert_eq!(client.circuit_state("tools"), CircuitState::Closed);
}

#[tokio::test]
async fn test_missing_row_is_a_data_error() {
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client(), backend);

    let err = tools.update_tool(99, "Ghost").await.unwrap_err();

    assert_eq!(err.code(), "PGRST116");
    assert_eq!(err.category(), ErrorCategory::Data);
    assert!(!err.is_retryable());
    assert!(!err.user_message().is_empty());
}
