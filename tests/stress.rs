//! Concurrent sessions writing and reading back under live replication lag

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ryw::api::{build_state, create_router};
use ryw::store::{AccountStore, Backends, MemoryCluster};
use ryw::Config;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_sessions_never_miss_own_writes() {
    let config = Config {
        port: Some(0),
        ..Default::default()
    };
    let cluster = Arc::new(MemoryCluster::from_config(&config));
    let replication = cluster.spawn_replication(Duration::from_millis(3), Duration::from_millis(1));
    let app = create_router(build_state(&config, Backends::from_cluster(cluster.clone())));

    let sessions = 8;
    let rounds = 25;
    let start = Instant::now();

    let mut handles = Vec::new();
    for s in 0..sessions {
        let email = format!("rider-{}@example.com", s);
        cluster.ensure_account(&email).await.unwrap();
        let app = app.clone();

        handles.push(tokio::spawn(async move {
            for r in 0..rounds {
                let request = Request::builder()
                    .method("POST")
                    .uri("/rides")
                    .header("authorization", &email)
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from(format!("distance={}.5", r)))
                    .unwrap();
                let response = app.clone().oneshot(request).await.unwrap();
                assert_eq!(response.status(), StatusCode::CREATED);
                let bytes = response.into_body().collect().await.unwrap().to_bytes();
                let created: Value = serde_json::from_slice(&bytes).unwrap();
                let id = created["id"].as_i64().unwrap();

                let request = Request::builder()
                    .uri(format!("/rides/{}", id))
                    .header("authorization", &email)
                    .body(Body::empty())
                    .unwrap();
                let response = app.clone().oneshot(request).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK, "session {} lost ride {}", s, id);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    replication.abort();

    let elapsed = start.elapsed();
    println!("{} write/read rounds: {:?}", sessions * rounds, elapsed);
    assert!(elapsed.as_secs_f64() < 30.0, "Too slow");
}
