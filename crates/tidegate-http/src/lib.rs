//! # tidegate-http
//!
//! REST control plane: quota scans, quota updates, and live connection
//! introspection/termination. The server is a thin axum router over the
//! process-wide registries; persistence stays behind the data-provider
//! contract.

pub mod api;

use axum::routing::{delete, get, put};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use tidegate_provider::DataProvider;
use tidegate_sftp::{ConnectionRegistry, ScanRegistry};

pub use api::ApiResponse;

#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn DataProvider>,
    pub registry: Arc<ConnectionRegistry>,
    pub scans: Arc<ScanRegistry>,
}

pub struct HttpServer {
    state: AppState,
    bind_address: String,
    bind_port: u16,
}

impl HttpServer {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        registry: Arc<ConnectionRegistry>,
        scans: Arc<ScanRegistry>,
        bind_address: String,
        bind_port: u16,
    ) -> Self {
        Self {
            state: AppState {
                provider,
                registry,
                scans,
            },
            bind_address,
            bind_port,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(api::healthz))
            .route(
                "/api/quota-scans",
                get(api::get_user_scans).post(api::start_user_scan),
            )
            .route(
                "/api/quota-scans/folders",
                get(api::get_folder_scans).post(api::start_folder_scan),
            )
            .route("/api/quota/update", put(api::update_quota))
            .route("/api/connections", get(api::get_connections))
            .route("/api/connections/:id", delete(api::close_connection))
            .route("/api/metrics", get(api::get_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.bind_address, self.bind_port)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        info!(address = %addr, "control plane listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await
    }
}
