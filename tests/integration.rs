//! End-to-end tests for the HTTP API over the in-memory cluster

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use ryw::api::{build_state, create_router};
use ryw::common::config::{ReplicaConfig, WriteConfig};
use ryw::common::METRICS;
use ryw::router::ReplicaId;
use ryw::store::{Account, AccountStore, Backends, MemoryCluster};
use ryw::{Config, Lsn};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const EMAIL: &str = "user@example.com";

struct Harness {
    cluster: Arc<MemoryCluster>,
    app: Router,
    account: Account,
}

async fn harness() -> Harness {
    let config = Config {
        port: Some(0),
        replicas: ["a", "b", "c"]
            .iter()
            .map(|id| ReplicaConfig {
                id: id.to_string(),
                url: None,
            })
            .collect(),
        writes: WriteConfig {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        },
        ..Default::default()
    };
    let cluster = Arc::new(MemoryCluster::from_config(&config));
    let account = cluster.ensure_account(EMAIL).await.unwrap();
    let app = create_router(build_state(&config, Backends::from_cluster(cluster.clone())));

    Harness {
        cluster,
        app,
        account,
    }
}

fn post_ride(auth: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/rides")
        .header("content-type", "application/x-www-form-urlencoded");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, auth: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn create(h: &Harness, distance: &str) -> Value {
    let (status, body) = send(&h.app, post_ride(Some(EMAIL), &format!("distance={}", distance))).await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", body);
    body
}

#[tokio::test]
async fn test_write_then_read_sees_own_write() {
    let h = harness().await;

    let created = create(&h, "42.0").await;
    assert_eq!(created["distance"], 42.0);
    assert_eq!(created["user_id"], h.account.id);
    let id = created["id"].as_i64().unwrap();

    // Only b has the write; a and c stay at the origin
    h.cluster
        .replicate(&ReplicaId::from("b"), h.cluster.primary_position())
        .unwrap();
    assert_eq!(h.cluster.replica_position(&"a".into()), Some(Lsn::ZERO));

    for _ in 0..50 {
        let (status, body) = send(&h.app, get(&format!("/rides/{}", id), Some(EMAIL))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["distance"], 42.0);
        assert_eq!(body["id"], id);
    }
}

#[tokio::test]
async fn test_read_falls_back_to_primary_when_all_replicas_lag() {
    let h = harness().await;
    let id = create(&h, "7.25").await["id"].as_i64().unwrap();

    let (status, body) = send(&h.app, get(&format!("/rides/{}", id), Some(EMAIL))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["distance"], 7.3);
}

#[tokio::test]
async fn test_successive_writes_raise_the_bound() {
    let h = harness().await;
    let first = create(&h, "1").await["id"].as_i64().unwrap();
    h.cluster.replicate_all();
    let second = create(&h, "2").await["id"].as_i64().unwrap();

    // Every replica has the first ride but none has the second
    for id in [first, second] {
        let (status, _) = send(&h.app, get(&format!("/rides/{}", id), Some(EMAIL))).await;
        assert_eq!(status, StatusCode::OK);
    }
}

#[tokio::test]
async fn test_fresh_session_reads_from_primary() {
    let h = harness().await;
    h.cluster.ensure_account("fresh@example.com").await.unwrap();
    let id = create(&h, "10").await["id"].as_i64().unwrap();

    // Nothing replicated, but a session with no writes reads the primary
    let (status, body) =
        send(&h.app, get(&format!("/rides/{}", id), Some("fresh@example.com"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], h.account.id);
}

#[tokio::test]
async fn test_validation_errors() {
    let h = harness().await;

    for body in ["", "distance=", "other=1"] {
        let (status, json) = send(&h.app, post_ride(Some(EMAIL), body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"], "Please specify parameter 'distance'.");
    }

    let (status, json) = send(&h.app, post_ride(Some(EMAIL), "distance=abc")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"], "Parameter 'distance' must be a floating-point number.");

    assert_eq!(h.cluster.primary_position(), Lsn::ZERO);
}

#[tokio::test]
async fn test_missing_content_type_counts_as_missing_parameter() {
    let h = harness().await;
    let request = Request::builder()
        .method("POST")
        .uri("/rides")
        .header("authorization", EMAIL)
        .body(Body::from("distance=3"))
        .unwrap();

    let (status, json) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["error"], "Please specify parameter 'distance'.");
}

#[tokio::test]
async fn test_authentication_errors() {
    let h = harness().await;

    for request in [get("/rides/1", None), get("/rides/1", Some("")), post_ride(None, "distance=1")] {
        let (status, json) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Please specify credentials in the Authorization header.");
    }

    let (status, json) = send(&h.app, get("/rides/1", Some("nobody@example.com"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "Credentials in Authorization were invalid.");
}

#[tokio::test]
async fn test_authentication_runs_before_validation() {
    let h = harness().await;
    let (status, json) = send(&h.app, post_ride(Some("nobody@example.com"), "distance=abc")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"], "Credentials in Authorization were invalid.");
}

#[tokio::test]
async fn test_missing_ride() {
    let h = harness().await;

    let (status, json) = send(&h.app, get("/rides/999", Some(EMAIL))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Object of type 'ride' with ID '999' was not found.");

    let (status, json) = send(&h.app, get("/rides/abc", Some(EMAIL))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "Object of type 'ride' with ID 'abc' was not found.");
}

#[tokio::test]
async fn test_write_conflicts_are_retried() {
    let h = harness().await;
    h.cluster.inject_write_conflicts(2);

    let created = create(&h, "15").await;
    assert_eq!(created["distance"], 15.0);
    assert_eq!(h.cluster.primary_position(), Lsn::new(1));
}

#[tokio::test]
async fn test_exhausted_write_conflicts_fail_without_effect() {
    let h = harness().await;
    h.cluster.inject_write_conflicts(3);

    let (status, json) = send(&h.app, post_ride(Some(EMAIL), "distance=15")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].as_str().unwrap().contains("Write conflict"));
    assert_eq!(h.cluster.primary_position(), Lsn::ZERO);
}

#[tokio::test]
async fn test_advance_failure_still_reports_created() {
    let h = harness().await;
    h.cluster.inject_advance_failures(10);
    let failures_before = METRICS.position_advance_failures.get();

    let created = create(&h, "5.5").await;
    assert!(METRICS.position_advance_failures.get() > failures_before);
    let id = created["id"].as_i64().unwrap();
    assert_eq!(h.cluster.primary_position(), Lsn::new(1));

    // The bound was never set, so the read still goes to the primary
    let (status, _) = send(&h.app, get(&format!("/rides/{}", id), Some(EMAIL))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_outage_routes_reads_to_primary() {
    let h = harness().await;
    let id = create(&h, "8").await["id"].as_i64().unwrap();
    h.cluster.set_status_unavailable(true);

    let (status, body) = send(&h.app, get(&format!("/rides/{}", id), Some(EMAIL))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id);
}

#[tokio::test]
async fn test_replicas_endpoint() {
    let h = harness().await;
    create(&h, "1").await;
    create(&h, "2").await;
    h.cluster.replicate(&"a".into(), Lsn::new(1)).unwrap();

    let (status, json) = send(&h.app, get("/replicas", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["primary"], "0/2");
    assert_eq!(json["replicas"]["a"], "0/1");
    assert_eq!(json["replicas"]["b"], "0/0");

    h.cluster.set_status_unavailable(true);
    let (status, _) = send(&h.app, get("/replicas", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_operational_endpoints_skip_auth() {
    let h = harness().await;

    let (status, json) = send(&h.app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["replicas"], 3);

    let response = h.app.clone().oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("ryw_reads_total{target=\"primary\"}"));
    assert!(text.contains("ryw_position_advance_failures_total"));
}

#[tokio::test]
async fn test_request_id_echoed() {
    let h = harness().await;
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "trace-me")
        .body(Body::empty())
        .unwrap();

    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "trace-me");

    let response = h.app.clone().oneshot(get("/health", None)).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
