//! `sqlraft`: one node of the replicated SQL store.
//!
//! Opens the store in the data directory, serves Raft RPCs on `--raft` and
//! the client API on `--http`. Without `--leader` the node bootstraps a new
//! single-node cluster; with it, the node asks that leader to add it.

use anyhow::{Context, Result};
use clap::Parser;
use raft::NodeConfig;
use server::{HttpState, router};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use store::{NodeId, Store};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_HTTP_ADDR: &str = "localhost:9301";
const DEFAULT_RAFT_ADDR: &str = "localhost:9302";

#[derive(Parser, Debug)]
#[command(name = "sqlraft", about = "Replicated SQL store over Raft")]
struct Args {
    /// HTTP API bind address
    #[arg(long, default_value = DEFAULT_HTTP_ADDR)]
    http: String,

    /// Raft RPC bind address
    #[arg(long, default_value = DEFAULT_RAFT_ADDR)]
    raft: String,

    /// HTTP address of the leader to join; omit to bootstrap a new cluster
    #[arg(long)]
    leader: Option<String>,

    /// Node ID, unique within the cluster
    #[arg(long, default_value_t = 1)]
    id: NodeId,

    /// Directory for the database, Raft log and snapshots
    data_dir: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(Shutdown::Requested) => ExitCode::SUCCESS,
        Ok(Shutdown::Fatal) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{:#}", e), "node failed");
            ExitCode::FAILURE
        }
    }
}

enum Shutdown {
    Requested,
    Fatal,
}

async fn run(args: Args) -> Result<Shutdown> {
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create {}", args.data_dir.display()))?;
    let base = args
        .data_dir
        .canonicalize()
        .context("failed to resolve data directory")?;

    let listener = TcpListener::bind(&args.http)
        .await
        .with_context(|| format!("failed to bind HTTP address {}", args.http))?;

    let config = NodeConfig::new(args.id, base.join(store::store::RAFT_DIR))
        .with_raft_addr(&args.raft)
        .with_client_addr(&args.http);
    let store = Arc::new(Store::open(&base, config).await.context("failed to open store")?);

    match &args.leader {
        None => store.bootstrap().await.context("failed to bootstrap cluster")?,
        Some(leader) => {
            let client = client::Client::new(leader)?;
            client
                .join(args.id, &args.http, &store.node().raft_addr)
                .await
                .with_context(|| format!("failed to join node at {}", leader))?;
            info!(%leader, "joined cluster");
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let app = router(HttpState::new(store.clone(), args.http.clone()));
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });
    info!(http = %args.http, raft = %store.raft_addr(), data = %base.display(), "node started");

    let outcome = tokio::select! {
        res = signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
            Shutdown::Requested
        }
        failure = store.wait_fatal() => match failure {
            Some(reason) => {
                error!(%reason, "consensus stopped, shutting down");
                Shutdown::Fatal
            }
            None => Shutdown::Requested,
        },
    };

    let _ = shutdown_tx.send(());
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "http server stopped with error"),
        Err(e) => warn!(error = %e, "http server task failed"),
    }
    if let Err(e) = store.close().await {
        warn!(error = %e, "failed to close store");
    }
    info!("node stopped");
    Ok(outcome)
}
