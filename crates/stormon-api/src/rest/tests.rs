use super::*;
use crate::auth::Credentials;
use crate::config::ScriptConfig;
use crate::error::PollError;
use crate::mock;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Appliance {
    calls: AtomicUsize,
}

async fn cluster(State(app): State<Arc<Appliance>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    app.calls.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth == "Bearer t1" {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    (
        StatusCode::OK,
        Json(json!({
            "name": "umeng",
            "uuid": "abc-123",
            "version": {"full": "NetApp Release 9.14.1", "generation": 9, "major": 14, "minor": 1}
        })),
    )
}

async fn volumes(
    State(app): State<Arc<Appliance>>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Value> {
    app.calls.fetch_add(1, Ordering::SeqCst);
    if q.get("page").map(String::as_str) == Some("2") {
        Json(json!({"records": [{"name": "d"}, {"name": "e"}], "num_records": 2}))
    } else {
        Json(json!({
            "records": [{"name": "a"}, {"name": "b"}, {"name": "c"}],
            "num_records": 3,
            "_links": {"next": {"href": "/api/storage/volumes?page=2"}}
        }))
    }
}

async fn empty() -> Json<Value> {
    Json(json!({"records": [], "num_records": 0}))
}

async fn forbidden() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": {"message": "not authorized for that command", "code": "6"}})),
    )
}

async fn broken() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"message": "Unexpected argument", "code": "262179", "target": "foo"}})),
    )
}

async fn start(cluster_forbidden: bool) -> (Arc<Appliance>, std::net::SocketAddr) {
    let app = Arc::new(Appliance::default());
    let mut router = Router::new()
        .route("/api/storage/volumes", get(volumes))
        .route("/api/storage/empty", get(empty))
        .route("/api/storage/broken", get(broken));
    router = if cluster_forbidden {
        router.route("/api/cluster", get(forbidden))
    } else {
        router.route("/api/cluster", get(cluster))
    };
    let router = router.with_state(app.clone());
    (app, mock::serve(router).await)
}

async fn client(addr: std::net::SocketAddr) -> RestClient {
    let config = mock::connection(addr);
    RestClient::new(&config, Arc::new(Credentials::new(&config)))
        .await
        .unwrap()
}

#[tokio::test]
async fn should_read_cluster_identity_on_init() {
    let (_, addr) = start(false).await;
    let mut rest = client(addr).await;
    rest.init().await.unwrap();
    assert_eq!(rest.cluster().name, "umeng");
    assert_eq!(rest.cluster().uuid, "abc-123");
    assert_eq!(rest.cluster().version_string(), "9.14.1");
}

#[tokio::test]
async fn should_fail_init_on_forbidden() {
    let (_, addr) = start(true).await;
    let mut rest = client(addr).await;
    let err = rest.init().await.unwrap_err();
    assert!(matches!(err, PollError::PermissionDenied { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn should_follow_next_links_in_order() {
    let (app, addr) = start(false).await;
    let mut rest = client(addr).await;
    let href = HrefBuilder::new().api_path("storage/volumes").fields(&["name"]).build();
    let records = rest.fetch_all(&href).await.unwrap();
    let names: Vec<&str> = records.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);

    let stats = rest.stats();
    assert_eq!(stats.num_calls, 2);
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn should_stream_one_batch_per_page() {
    let (_, addr) = start(false).await;
    let mut rest = client(addr).await;
    let mut sizes = Vec::new();
    let total = rest
        .for_each_batch("api/storage/volumes", |batch| {
            sizes.push(batch.len());
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(sizes, vec![3, 2]);
}

#[tokio::test]
async fn should_report_no_instance_for_empty_results() {
    let (_, addr) = start(false).await;
    let mut rest = client(addr).await;
    let err = rest.fetch_all("api/storage/empty").await.unwrap_err();
    assert!(matches!(err, PollError::NoInstance(_)));
}

#[tokio::test]
async fn should_carry_error_details() {
    let (_, addr) = start(false).await;
    let mut rest = client(addr).await;
    let err = rest.get("/api/storage/broken").await.unwrap_err();
    assert_eq!(
        err,
        PollError::ApiResponse {
            status: 400,
            code: "262179".to_string(),
            message: "Unexpected argument".to_string(),
            target: "foo".to_string(),
            api: "/api/storage/broken".to_string(),
        }
    );
}

#[tokio::test]
async fn should_retry_once_with_refreshed_token() {
    let (app, addr) = start(false).await;
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("calls");
    let path = dir.path().join("token.sh");
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\necho x >> {0}\nn=$(wc -l < {0} | tr -d ' ')\necho \"{{\\\"authToken\\\": \\\"t$n\\\"}}\"\n",
            counter.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = mock::connection(addr);
    config.credentials_script = Some(ScriptConfig::new(path));
    let mut rest = RestClient::new(&config, Arc::new(Credentials::new(&config)))
        .await
        .unwrap();
    rest.init().await.unwrap();
    assert_eq!(rest.cluster().name, "umeng");
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
    assert_eq!(rest.stats().num_calls, 2);
}

#[tokio::test]
async fn should_count_failed_calls() {
    let (_, addr) = start(false).await;
    let mut rest = client(addr).await;
    rest.get("api/storage/broken").await.unwrap_err();
    rest.get("api/storage/broken").await.unwrap_err();

    let stats = rest.stats();
    assert_eq!(stats.num_calls, 2);
    assert!(stats.api_time > std::time::Duration::ZERO);
    assert_eq!(stats.bytes_rx, 0);

    rest.get("api/storage/empty").await.unwrap();
    assert_eq!(rest.stats().num_calls, 3);
}
