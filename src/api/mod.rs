//! HTTP API: read-only queries over the result store, operational views of
//! the queues, and the object upload endpoint that feeds ingestion.

pub mod error;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::api_routes;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::handlers::DiagnosticsLog;
use crate::queue::{AlarmLog, WorkQueue};
use crate::storage::ObjectStore;
use crate::store::ResultStore;

/// Shared state for API handlers. Holds no mutable state of its own.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ResultStore>,
    pub objects: Arc<dyn ObjectStore>,
    /// Work queues and dead-letter queues reported by `/api/ops/queues`.
    pub queues: Vec<Arc<WorkQueue>>,
    pub alarms: Arc<AlarmLog>,
    pub diagnostics: Arc<DiagnosticsLog>,
    /// Where uploaded emails land; used to tell "not yet parsed" from "unknown".
    pub ingest_prefix: String,
}

/// The full application router with tracing and CORS layers.
pub fn app(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    api_routes(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "API server listening");
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
