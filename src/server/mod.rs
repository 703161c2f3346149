//! HTTP surface of the metrics server.
//!
//! Layers, outermost first: request tracing, response compression, request
//! decompression, then signature verification and response signing.

mod error;
mod handlers;
mod middleware;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::{error, info, info_span, Level, Span};

pub use error::AppError;
pub use middleware::MAX_BODY_BYTES;

use crate::config::ServerConfig;
use crate::engine::UpdateEngine;
use crate::error::ServerError;
use crate::logging::Logger;
use crate::signing::Signer;
use crate::snapshot::SnapshotWorker;
use crate::storage;
use crate::SHUTDOWN_GRACE_SECS;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: Arc<UpdateEngine>,
    pub signer: Option<Signer>,
}

impl AppState {
    pub fn new(engine: Arc<UpdateEngine>, signer: Option<Signer>) -> Self {
        Self { engine, signer }
    }
}

pub fn router(state: AppState, span: Span) -> Router {
    let trace = TraceLayer::new_for_http()
        .make_span_with(move |request: &Request| {
            info_span!(
                target: "relay::server",
                parent: &span,
                "request",
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_response(DefaultOnResponse::new().level(Level::INFO).latency_unit(LatencyUnit::Millis));

    Router::new()
        .route("/", get(handlers::list_html))
        .route("/ping", get(handlers::ping))
        .route("/update/", post(handlers::update_json))
        .route("/updates/", post(handlers::updates_json))
        .route("/update/:kind/:name/:value", post(handlers::update_path))
        .route("/value/", post(handlers::value_json))
        .route("/value/:kind/:name", get(handlers::value_path))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::verify_and_sign))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(trace)
        .with_state(state)
}

/// Run the server until `token` is cancelled.
///
/// Opens the configured backend, restores the snapshot, then serves. After
/// cancellation the listener drain and the final snapshot share one grace
/// window of [`SHUTDOWN_GRACE_SECS`].
pub async fn run(config: ServerConfig, logger: Logger, token: CancellationToken) -> Result<(), ServerError> {
    let backend = storage::open_backend(&config.storage()).await?;
    let engine = Arc::new(UpdateEngine::from_backend(&backend, logger.component("engine")));

    let snapshot = backend.snapshot.clone().map(|target| {
        SnapshotWorker::new(
            engine.clone(),
            target,
            config.store_interval(),
            config.restore,
            logger.component("snapshot"),
        )
    });
    if let Some(worker) = &snapshot {
        restore_snapshot(worker).await;
    }
    let snapshot_task = snapshot.map(|worker| tokio::spawn(worker.run(token.clone())));

    let app = router(AppState::new(engine, config.signer()), logger.component("http"));
    let listener = TcpListener::bind(&config.address)
        .await
        .map_err(|source| ServerError::Bind { address: config.address.clone(), source })?;
    info!(
        target: "relay::server",
        address = %config.address,
        local = ?listener.local_addr().ok(),
        backend = %backend.storage.kind(),
        signed = config.signer().is_some(),
        "Server listening"
    );

    let shutdown = token.clone().cancelled_owned();
    let mut serving = tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(shutdown).await });

    let finished_early = tokio::select! {
        _ = token.cancelled() => None,
        joined = &mut serving => Some(joined),
    };
    if finished_early.is_some() {
        error!(target: "relay::server", "HTTP server exited before shutdown was requested");
        token.cancel();
    }

    info!(target: "relay::server", grace_secs = SHUTDOWN_GRACE_SECS, "Shutting down");
    let drained = timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), async move {
        let served = match finished_early {
            Some(joined) => joined,
            None => serving.await,
        };
        let snapshot = match snapshot_task {
            Some(task) => Some(task.await),
            None => None,
        };
        (served, snapshot)
    })
    .await;

    let (served, snapshot) = drained.map_err(|_| ServerError::ShutdownTimeout { secs: SHUTDOWN_GRACE_SECS })?;
    served?.map_err(ServerError::Serve)?;
    if let Some(joined) = snapshot {
        joined??;
    }

    info!(target: "relay::server", "Server stopped");
    Ok(())
}

/// A failed restore is logged and the server starts with whatever the
/// backend already holds.
async fn restore_snapshot(worker: &SnapshotWorker) -> usize {
    match worker.restore().await {
        Ok(count) => count,
        Err(e) => {
            error!(
                target: "relay::server",
                category = e.category(),
                error = %e,
                "Error restoring data from snapshot, starting without it"
            );
            0
        }
    }
}
