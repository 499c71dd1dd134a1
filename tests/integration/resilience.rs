//! Rate limiting and circuit breaking as seen by callers

use super::*;
use tracker_data_client::{CircuitBreakerConfig, CircuitState, RateLimiterConfig};

fn client_with(rate: RateLimiterConfig, breaker: CircuitBreakerConfig) -> Arc<ResilientClient> {
    let config = ClientConfig::builder()
        .retry_policy(fast_retry())
        .rate_limit(rate)
        .circuit_breaker(breaker)
        .build()
        .unwrap();
    test_client(config, ConnectivitySignal::online())
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_call_over_cap() {
    let client = client_with(
        RateLimiterConfig::new()
            .max_per_window(3)
            .window(Duration::from_secs(1)),
        CircuitBreakerConfig::default(),
    );
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    // Distinct updates so each call reaches the limiter.
    for name in ["a", "b", "c"] {
        tools.update_tool(1, name).await.unwrap();
    }
    let err = tools.update_tool(1, "d").await.unwrap_err();
    assert_eq!(err.code(), "RATE_LIMITED");
    assert!(err.is_retryable());
    assert_eq!(backend.name_of(1).as_deref(), Some("c"));

    tokio::time::advance(Duration::from_secs(1)).await;
    tools.update_tool(1, "e").await.unwrap();
    assert_eq!(backend.name_of(1).as_deref(), Some("e"));
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_then_recovers_through_single_trial() {
    let client = client_with(
        RateLimiterConfig::default(),
        CircuitBreakerConfig::new()
            .failure_threshold(2)
            .recovery_timeout(Duration::from_secs(30)),
    );
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    // Two exhausted retry sequences open the circuit.
    backend.fail_next(6);
    assert!(tools.all_tools().await.is_err());
    assert!(tools.all_tools().await.is_err());
    assert_eq!(client.circuit_state("tools"), CircuitState::Open);
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 6);

    // Fails fast without touching the backend.
    let err = tools.all_tools().await.unwrap_err();
    assert_eq!(err.code(), "CIRCUIT_OPEN");
    assert_eq!(backend.list_calls.load(Ordering::SeqCst), 6);

    // Other resources are unaffected.
    assert_eq!(client.circuit_state("categories"), CircuitState::Closed);

    tokio::time::advance(Duration::from_secs(30)).await;
    let recovered = tools.all_tools().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(client.circuit_state("tools"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_circuit() {
    let client = client_with(
        RateLimiterConfig::default(),
        CircuitBreakerConfig::new()
            .failure_threshold(1)
            .recovery_timeout(Duration::from_secs(10)),
    );
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    backend.fail_next(3);
    assert!(tools.all_tools().await.is_err());
    assert_eq!(client.circuit_state("tools"), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(10)).await;
    backend.fail_next(3);
    assert!(tools.all_tools().await.is_err());
    assert_eq!(client.circuit_state("tools"), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(5)).await;
    let err = tools.all_tools().await.unwrap_err();
    assert_eq!(err.code(), "CIRCUIT_OPEN");
}

#[tokio::test(start_paused = true)]
async fn test_validation_errors_do_not_trip_breaker() {
    let client = client_with(
        RateLimiterConfig::default(),
        CircuitBreakerConfig::new().failure_threshold(1),
    );
    let backend = FakeBackend::with_tools(&[]);
    let tools = ToolService::new(client.clone(), backend);

    for _ in 0..3 {
        let err = tools.update_tool(7, "nope").await.unwrap_err();
        assert_eq!(err.code(), "PGRST116");
    }
    assert_eq!(client.circuit_state("tools"), CircuitState::Closed);
}
