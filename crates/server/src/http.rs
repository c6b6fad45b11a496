//! HTTP API of a store node.
//!
//! - `POST /db/execute` - replicate a write (leader only, followers redirect)
//! - `GET|POST /db/query` - read from the local database
//! - `POST /join` - add a node to the cluster
//! - `GET /status` - store, HTTP and process diagnostics
//!
//! Statement bodies are `{"sql": "..."}`. Responses are
//! `{"result": ..., "error": "...", "took": <ms>}`; a `pretty` query
//! parameter selects indented JSON.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::{RawQuery, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use store::{MemberIdentity, Store, StoreError};
use tracing::{debug, info, warn};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    store: Arc<Store>,
    addr: String,
    started_at: SystemTime,
    started: Instant,
}

impl HttpState {
    /// `addr` is the address the HTTP server is reachable at, as reported by
    /// `/status`.
    pub fn new(store: Arc<Store>, addr: impl Into<String>) -> Self {
        Self {
            store,
            addr: addr.into(),
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

/// Build the router with all endpoints.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/db/execute", post(handle_execute))
        .route("/db/query", get(handle_query).post(handle_query))
        .route("/join", post(handle_join))
        .route("/status", get(handle_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SqlRequest {
    #[serde(default)]
    sql: String,
}

/// Body of every statement response.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds spent serving the request.
    #[serde(default)]
    pub took: f64,
}

fn parse_sql(body: &[u8]) -> Result<String, ApiError> {
    let request: SqlRequest =
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if request.sql.trim().is_empty() {
        return Err(ApiError::BadRequest("SQL query is empty".to_string()));
    }
    Ok(request.sql)
}

/// Whether the query string carries a `pretty` parameter, with or without
/// a value.
fn is_pretty(query: Option<&str>) -> bool {
    query
        .unwrap_or_default()
        .split('&')
        .any(|pair| pair.split('=').next() == Some("pretty"))
}

fn json_response<T: Serialize>(value: &T, pretty: bool) -> Response {
    let encoded = if pretty {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    };
    match encoded {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Err(e) => ApiError::Internal(e.to_string()).into_response(),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn finish<T: Serialize>(
    result: Result<T, StoreError>,
    start: Instant,
    pretty: bool,
) -> Result<Response, ApiError> {
    let mut response = ApiResponse::default();
    match result {
        Ok(value) => {
            response.result =
                Some(serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))?);
        }
        Err(e) => response.error = Some(e.to_string()),
    }
    response.took = elapsed_ms(start);
    Ok(json_response(&response, pretty))
}

async fn handle_execute(
    State(state): State<HttpState>,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let sql = parse_sql(&body)?;
    debug!(%sql, "execute request");

    let result = state.store.execute(&sql).await;
    if let Err(StoreError::NotLeader { leader }) = &result {
        return Err(match leader {
            Some(leader) => {
                let location = match &query {
                    Some(q) => format!("http://{}{}?{}", leader, uri.path(), q),
                    None => format!("http://{}{}", leader, uri.path()),
                };
                debug!(%location, "redirecting write to leader");
                ApiError::Redirect(location)
            }
            None => ApiError::Unavailable("no leader elected".to_string()),
        });
    }
    if let Err(e) = &result {
        warn!(%sql, error = %e, "execute failed");
    }
    finish(result, start, is_pretty(query.as_deref()))
}

async fn handle_query(
    State(state): State<HttpState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let sql = parse_sql(&body)?;
    debug!(%sql, "query request");

    let result = state.store.query(&sql).await;
    if let Err(e) = &result {
        warn!(%sql, error = %e, "query failed");
    }
    finish(result, start, is_pretty(query.as_deref()))
}

/// Expects exactly `{"id": "<node id>|<client addr>", "addr": "<raft addr>"}`.
async fn handle_join(State(state): State<HttpState>, body: Bytes) -> Result<Response, ApiError> {
    let fields: HashMap<String, String> =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if fields.len() != 2 {
        return Err(ApiError::BadRequest(format!(
            "expected 2 fields in join request, got {}",
            fields.len()
        )));
    }
    let raft_addr = fields
        .get("addr")
        .ok_or_else(|| ApiError::BadRequest("missing 'addr'".to_string()))?;
    let identity: MemberIdentity = fields
        .get("id")
        .ok_or_else(|| ApiError::BadRequest("missing 'id'".to_string()))?
        .parse()
        .map_err(|e: raft::IdentityError| ApiError::BadRequest(e.to_string()))?;

    let (node_id, node) = identity.into_node(raft_addr.clone());
    state.store.join(node_id, node.clone()).await.map_err(|e| {
        warn!(node_id, %node, error = %e, "join failed");
        ApiError::Internal(e.to_string())
    })?;

    info!(node_id, %node, "join accepted");
    Ok(StatusCode::OK.into_response())
}

async fn handle_status(
    State(state): State<HttpState>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let stats = state.store.stats().await.map_err(|e| {
        warn!(error = %e, "failed to collect stats");
        ApiError::Internal(e.to_string())
    })?;

    let start_time = state
        .started_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let status = serde_json::json!({
        "store": stats,
        "http": { "addr": state.addr },
        "node": {
            "start_time": start_time,
            "uptime": format!("{:?}", state.started.elapsed()),
        },
    });
    Ok(json_response(&status, is_pretty(query.as_deref())))
}
