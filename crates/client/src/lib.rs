//! Client library for the replicated SQL store's HTTP API.
//!
//! Writes sent to a follower are answered with a redirect to the leader;
//! the client follows those for up to [`MAX_REDIRECTS`] hops, re-sending the
//! request body each time.
//!
//! # Example
//!
//! ```no_run
//! use client::Client;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new("localhost:9301")?;
//!
//!     client.execute("CREATE TABLE users (id INTEGER, name TEXT)").await?;
//!     let result = client.execute("INSERT INTO users VALUES (1, 'Alice')").await?;
//!     println!("Inserted {} row(s)", result.rows_affected);
//!
//!     let rows = client.query("SELECT * FROM users").await?;
//!     println!("Columns: {:?}", rows.columns);
//!     println!("Rows: {}", rows.row_count());
//!     Ok(())
//! }
//! ```

mod error;

pub use error::{ClientError, Result};

use reqwest::StatusCode;
use reqwest::header::LOCATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Redirect hops followed before giving up.
pub const MAX_REDIRECTS: usize = 5;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a write.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    #[serde(default)]
    pub rows_affected: u64,
}

/// Rows returned by a read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for one node of the store.
#[derive(Clone, Debug)]
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    /// Create a client for the node whose HTTP API is at `addr`
    /// (`host:port`, optionally with a scheme).
    pub fn new(addr: impl AsRef<str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url(addr.as_ref()),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run a statement that changes the database.
    pub async fn execute(&self, sql: &str) -> Result<ExecuteResult> {
        self.statement("/db/execute", sql).await
    }

    /// Run a read on the node this client points at.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.statement("/db/query", sql).await
    }

    /// Ask this node, which should be the leader, to add a member.
    pub async fn join(&self, node_id: u64, client_addr: &str, raft_addr: &str) -> Result<()> {
        let body = serde_json::json!({
            "id": format!("{}|{}", node_id, client_addr),
            "addr": raft_addr,
        });
        let response = self.post("/join", &body).await?;
        check_status(response).await?;
        Ok(())
    }

    /// Fetch the node's `/status` document.
    pub async fn status(&self) -> Result<serde_json::Value> {
        let url = format!("{}/status", self.base_url);
        let response = self.http.get(&url).send().await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn statement<T: DeserializeOwned>(&self, path: &str, sql: &str) -> Result<T> {
        let body = serde_json::json!({ "sql": sql });
        let response = check_status(self.post(path, &body).await?).await?;
        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Protocol(e.to_string()))?;

        if let Some(message) = api.error {
            return Err(ClientError::Database { message });
        }
        let result = api
            .result
            .ok_or_else(|| ClientError::Protocol("response has neither result nor error".into()))?;
        serde_json::from_value(result).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// POST `body` to `path`, following redirects with the same body.
    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut url = format!("{}{}", self.base_url, path);
        for _ in 0..=MAX_REDIRECTS {
            let response = self.http.post(&url).json(body).send().await?;
            if !response.status().is_redirection() {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| ClientError::Redirect("redirect without location".into()))?;
            debug!(from = %url, to = %location, "following leader redirect");
            url = location.to_string();
        }
        Err(ClientError::Redirect(format!(
            "gave up after {} redirects",
            MAX_REDIRECTS
        )))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}
