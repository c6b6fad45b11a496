//! HTTP API tests against real single- and two-node stores.

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use raft::NodeConfig;
use server::{ApiResponse, HttpState, router};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store::{NodeId, Store};
use tempfile::TempDir;
use tower::ServiceExt;

fn config(dir: &Path, id: NodeId) -> NodeConfig {
    NodeConfig::new(id, dir.to_path_buf())
        .with_raft_addr("127.0.0.1:0")
        .with_client_addr(format!("node-{}.test:9301", id))
        .with_election_timeout(300, 600)
        .with_heartbeat_interval(100)
}

async fn leader_app(dir: &Path) -> (Router, Arc<Store>) {
    let store = Arc::new(Store::open(dir, config(dir, 1)).await.unwrap());
    store.bootstrap().await.unwrap();
    store.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    let app = router(HttpState::new(store.clone(), "node-1.test:9301"));
    (app, store)
}

async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, bytes.to_vec())
}

fn parse(body: &[u8]) -> ApiResponse {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_and_query_round_trip() {
    let dir = TempDir::new().unwrap();
    let (app, store) = leader_app(dir.path()).await;

    let (status, _, body) = send(
        &app,
        "POST",
        "/db/execute",
        r#"{"sql":"CREATE TABLE users (id INTEGER, name TEXT)"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let response = parse(&body);
    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["rows_affected"], 0);

    let (_, _, body) = send(
        &app,
        "POST",
        "/db/execute",
        r#"{"sql":"INSERT INTO users VALUES (1, 'fiona'), (2, 'sam')"}"#,
    )
    .await;
    assert_eq!(parse(&body).result.unwrap()["rows_affected"], 2);

    let (status, _, body) = send(
        &app,
        "GET",
        "/db/query",
        r#"{"sql":"SELECT name FROM users ORDER BY id"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result = parse(&body).result.unwrap();
    assert_eq!(result["columns"], serde_json::json!(["name"]));
    assert_eq!(result["values"], serde_json::json!([["fiona"], ["sam"]]));

    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statement_errors_are_reported_in_body() {
    let dir = TempDir::new().unwrap();
    let (app, store) = leader_app(dir.path()).await;

    let (status, _, body) = send(&app, "POST", "/db/execute", r#"{"sql":"DROP TABLE ghost"}"#).await;
    assert_eq!(status, StatusCode::OK);
    let response = parse(&body);
    assert!(response.result.is_none());
    assert!(response.error.unwrap().contains("ghost"));

    let (status, _, body) = send(&app, "POST", "/db/query", r#"{"sql":"SELECT * FROM ghost"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(parse(&body).error.is_some());

    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_requests_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (app, store) = leader_app(dir.path()).await;

    let (status, _, _) = send(&app, "POST", "/db/execute", r#"{"sql":""}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, "POST", "/db/query", "not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, "GET", "/db/execute", r#"{"sql":"SELECT 1"}"#).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    let (status, _, _) = send(
        &app,
        "POST",
        "/join",
        r#"{"id":"2|h:1","addr":"h:2","extra":"x"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, "POST", "/join", r#"{"id":"two|h:1","addr":"h:2"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&app, "POST", "/join", r#"{"id":"2|h:1","node":"h:2"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pretty_output_and_status() {
    let dir = TempDir::new().unwrap();
    let (app, store) = leader_app(dir.path()).await;

    let (_, headers, body) = send(&app, "POST", "/db/query?pretty", r#"{"sql":"SELECT 1 AS one"}"#).await;
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains('\n'));
    assert!(text.contains("\"one\""));

    let (status, _, body) = send(&app, "GET", "/status", "").await;
    assert_eq!(status, StatusCode::OK);
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["http"]["addr"], "node-1.test:9301");
    assert_eq!(status["store"]["leader"], "node-1.test:9301");
    assert_eq!(status["store"]["consensus"]["voters"], 1);
    assert!(status["node"]["uptime"].is_string());

    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_redirects_writes_to_leader() {
    let dirs: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
    let (leader_app, leader) = leader_app(dirs[0].path()).await;

    let follower = Arc::new(
        Store::open(dirs[1].path(), config(dirs[1].path(), 2))
            .await
            .unwrap(),
    );
    let follower_app = router(HttpState::new(follower.clone(), "node-2.test:9301"));

    // Nobody has told the new node who leads yet.
    let (status, _, _) = send(&follower_app, "POST", "/db/execute", r#"{"sql":"SELECT 1"}"#).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let join = serde_json::json!({
        "id": "2|node-2.test:9301",
        "addr": follower.node().raft_addr,
    });
    let (status, _, _) = send(&leader_app, "POST", "/join", &join.to_string()).await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..200 {
        if follower.leader().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let (status, headers, _) = send(
        &follower_app,
        "POST",
        "/db/execute?pretty",
        r#"{"sql":"CREATE TABLE t (id INT)"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        headers.get(header::LOCATION).unwrap(),
        "http://node-1.test:9301/db/execute?pretty"
    );

    follower.close().await.unwrap();
    leader.close().await.unwrap();
}
