//! HTTP health probe against a mock backend

use super::*;
use serde_json::json;
use tracker_data_client::health::checks;
use tracker_data_client::{BackendConfig, HealthConfig, HealthStatus, HttpBackendProbe};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

const API_KEY: &str = "test-anon-key";

async fn mount_rest(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(header("apikey", API_KEY))
        .and(header("Authorization", format!("Bearer {API_KEY}").as_str()))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!([])))
        .mount(server)
        .await;
}

fn probe_for(server: &MockServer) -> HttpBackendProbe {
    let backend = BackendConfig::new(&server.uri(), API_KEY)
        .unwrap()
        .with_core_table("tools")
        .with_derived_view("tool_stats");
    HttpBackendProbe::new(backend, Duration::from_secs(2)).unwrap()
}

#[tokio::test]
async fn test_probe_reports_each_capability() {
    let server = setup_mock_server().await;
    mount_rest(&server, "/rest/v1/", 200).await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/tools"))
        .and(query_param("select", "*"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/tool_stats"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "code": "42P01",
            "message": "relation \"public.tool_stats\" does not exist",
            "details": null,
            "hint": null
        })))
        .mount(&server)
        .await;

    let probe = probe_for(&server);
    assert!(probe.connectivity().await.is_ok());
    assert!(probe.core_table().await.is_ok());

    let err = probe.derived_view().await.unwrap_err();
    assert_eq!(err.code, "42P01");
    assert_eq!(err.http_status, Some(404));

    // Unmounted realtime route answers 404, which still counts as reachable.
    assert!(probe.realtime().await.is_ok());
}

#[tokio::test]
async fn test_realtime_server_error_is_unavailable() {
    let server = setup_mock_server().await;
    Mock::given(method("GET"))
        .and(path("/realtime/v1/"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = probe_for(&server).realtime().await.unwrap_err();
    assert_eq!(err.code, "503");
}

#[tokio::test]
async fn test_client_health_from_http_backend() {
    let server = setup_mock_server().await;
    mount_rest(&server, "/rest/v1/", 200).await;
    mount_rest(&server, "/rest/v1/tools", 200).await;
    mount_rest(&server, "/rest/v1/tool_stats", 500).await;

    let config = ClientConfig::builder()
        .backend(&server.uri(), API_KEY)
        .unwrap()
        .health(
            HealthConfig::new()
                .probe_timeout(Duration::from_secs(2))
                .latency_threshold(Duration::from_secs(5)),
        )
        .build()
        .unwrap();
    let client = tracker_data_client::create_client(config).unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let counter = seen.clone();
    client.subscribe_health(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let snapshot = client.check_health().await;
    assert_eq!(snapshot.status, HealthStatus::Degraded);
    assert!(snapshot.check(checks::CONNECTIVITY));
    assert!(snapshot.check(checks::CORE_TABLE));
    assert!(!snapshot.check(checks::DERIVED_VIEW));
    assert!(snapshot.latency_ms.is_some());
    assert_eq!(client.health(), Some(snapshot));
    assert_eq!(client.latency_statistics().count, 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_backend_is_down() {
    let server = setup_mock_server().await;
    let uri = server.uri();
    drop(server);

    let config = ClientConfig::builder()
        .backend(&uri, API_KEY)
        .unwrap()
        .health(HealthConfig::new().probe_timeout(Duration::from_secs(2)))
        .build()
        .unwrap();
    let client = tracker_data_client::create_client(config).unwrap();

    let snapshot = client.check_health().await;
    assert_eq!(snapshot.status, HealthStatus::Down);
    assert!(snapshot.error.is_some());
}
