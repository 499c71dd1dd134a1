//! Offline queueing and replay on reconnect

use super::*;
use pretty_assertions::assert_eq;
use tracker_data_client::RateLimiterConfig;

async fn wait_until_drained(client: &ResilientClient) {
    for _ in 0..100 {
        if client.pending_writes() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_offline_updates_replay_in_order_on_reconnect() {
    let signal = ConnectivitySignal::offline();
    let config = ClientConfig::builder()
        .retry_policy(fast_retry())
        .build()
        .unwrap();
    let client = test_client(config, signal.clone());
    client.start();

    let backend = FakeBackend::with_tools(&[(1, "Hammer"), (2, "Saw")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    for name in ["Mallet", "Sledge", "Claw hammer"] {
        let outcome = tools.update_tool(1, name).await.unwrap();
        assert!(outcome.is_queued());
    }
    tools.update_tool(2, "Hacksaw").await.unwrap();

    assert_eq!(client.pending_writes(), 4);
    assert!(backend.update_log.lock().is_empty());
    assert_eq!(backend.name_of(1).as_deref(), Some("Hammer"));

    signal.set_online(true);
    wait_until_drained(&client).await;

    assert_eq!(client.pending_writes(), 0);
    let replayed: Vec<String> = backend
        .update_log
        .lock()
        .iter()
        .filter(|(id, _)| *id == 1)
        .map(|(_, name)| name.clone())
        .collect();
    assert_eq!(replayed, vec!["Mallet", "Sledge", "Claw hammer"]);
    assert_eq!(backend.name_of(1).as_deref(), Some("Claw hammer"));
    assert_eq!(client.metrics().queued_writes, 4);
    assert_eq!(client.metrics().replayed_writes, 4);

    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_replay_keeps_operation_queued() {
    let signal = ConnectivitySignal::offline();
    let config = ClientConfig::builder()
        .retry_policy(RetryPolicy::no_retry())
        .auto_flush(false)
        .build()
        .unwrap();
    let client = test_client(config, signal.clone());

    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());
    tools.update_tool(1, "Mallet").await.unwrap();
    tools.update_tool(1, "Sledge").await.unwrap();

    signal.set_online(true);
    backend.fail_next(1);
    let report = client.flush_offline_queue().await;

    assert_eq!(report.replayed, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 2);
    let queued = client.offline_queue().snapshot();
    assert_eq!(queued[0].attempts, 1);
    assert_eq!(queued[1].attempts, 0);

    let report = client.flush_offline_queue().await;
    assert_eq!(report.replayed, 2);
    assert_eq!(backend.name_of(1).as_deref(), Some("Sledge"));
}

#[tokio::test(start_paused = true)]
async fn test_queued_write_invalidates_cached_reads() {
    let signal = ConnectivitySignal::online();
    let client = test_client(ClientConfig::default(), signal.clone());
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    tools.all_tools().await.unwrap();
    assert_eq!(client.cache().len(), 1);

    signal.set_online(false);
    tools.update_tool(1, "Mallet").await.unwrap();
    assert!(client.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_online_write_lands_after_older_queued_write() {
    let signal = ConnectivitySignal::offline();
    let config = ClientConfig::builder()
        .retry_policy(RetryPolicy::no_retry())
        .auto_flush(false)
        .build()
        .unwrap();
    let client = test_client(config, signal.clone());
    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    assert!(tools.update_tool(1, "Mallet").await.unwrap().is_queued());

    signal.set_online(true);
    backend.fail_next(1);
    let report = client.flush_offline_queue().await;
    assert_eq!(report.failed, 1);
    assert_eq!(client.pending_writes(), 1);

    // Online, but the older write to the same resource is still queued.
    let outcome = tools.update_tool(1, "Sledge").await.unwrap();
    assert!(outcome.is_queued());
    assert_eq!(client.offline_queue().pending("tools"), 2);
    assert!(backend.update_log.lock().is_empty());

    let report = client.flush_offline_queue().await;
    assert_eq!(report.replayed, 2);
    assert_eq!(
        *backend.update_log.lock(),
        vec![(1, "Mallet".to_string()), (1, "Sledge".to_string())]
    );
    assert_eq!(backend.name_of(1).as_deref(), Some("Sledge"));
}

#[tokio::test(start_paused = true)]
async fn test_write_queued_while_online_is_flushed_by_watcher() {
    let signal = ConnectivitySignal::online();
    let config = ClientConfig::builder()
        .retry_policy(fast_retry())
        .build()
        .unwrap();
    let client = test_client(config, signal.clone());
    client.start();

    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());

    // A write queued just before connectivity was reported back.
    let queued_backend = backend.clone();
    client
        .offline_queue()
        .enqueue("tools", OperationKind::Update, move || {
            let backend = queued_backend.clone();
            async move { backend.update(1, "Mallet").map(|_| ()) }
        });

    assert!(tools.update_tool(1, "Sledge").await.unwrap().is_queued());
    wait_until_drained(&client).await;

    assert_eq!(client.pending_writes(), 0);
    assert_eq!(
        *backend.update_log.lock(),
        vec![(1, "Mallet".to_string()), (1, "Sledge".to_string())]
    );
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backlog_larger_than_rate_limit_drains_after_reconnect() {
    let signal = ConnectivitySignal::offline();
    let config = ClientConfig::builder()
        .retry_policy(fast_retry())
        .rate_limit(
            RateLimiterConfig::new()
                .max_per_window(2)
                .window(Duration::from_secs(10)),
        )
        .build()
        .unwrap();
    let client = test_client(config, signal.clone());
    client.start();

    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());
    for name in ["Mallet", "Sledge", "Claw hammer"] {
        assert!(tools.update_tool(1, name).await.unwrap().is_queued());
    }

    signal.set_online(true);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(client.pending_writes(), 0);
    assert_eq!(backend.update_log.lock().len(), 3);
    assert_eq!(backend.name_of(1).as_deref(), Some("Claw hammer"));
    assert_eq!(client.metrics().rate_limited, 0);
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_replay_is_retried_while_online() {
    let signal = ConnectivitySignal::offline();
    let config = ClientConfig::builder()
        .retry_policy(RetryPolicy::no_retry())
        .flush_retry_interval(Duration::from_secs(1))
        .build()
        .unwrap();
    let client = test_client(config, signal.clone());
    client.start();

    let backend = FakeBackend::with_tools(&[(1, "Hammer")]);
    let tools = ToolService::new(client.clone(), backend.clone());
    tools.update_tool(1, "Mallet").await.unwrap();

    backend.fail_next(2);
    signal.set_online(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.pending_writes(), 1);

    // Retries after 1s and then 2s; the second retry succeeds.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(client.pending_writes(), 0);
    assert_eq!(backend.name_of(1).as_deref(), Some("Mallet"));
    assert_eq!(client.offline_queue().snapshot().len(), 0);
    client.shutdown().await;
}
