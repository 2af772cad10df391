//! HTTP surface.
//!
//! Routes, shared state and process-level plumbing (signals, background
//! maintenance). Admission is enforced as middleware on the analysis
//! routes only; health and stats stay reachable under overload.

pub mod error;
pub mod handlers;
pub mod middleware;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::admission::AdmissionController;
use crate::cache::CacheEngine;
use crate::config::Config;
use crate::runner::ExecutionEngine;
use crate::scheduler::WorkerPool;
use crate::service::AnalysisService;

pub use error::ApiError;

/// State shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub admission: Arc<AdmissionController>,
    pub service: Arc<AnalysisService>,
}

impl AppState {
    pub fn new(
        config: Config,
        admission: AdmissionController,
        service: AnalysisService,
    ) -> Self {
        Self {
            config: Arc::new(config),
            admission: Arc::new(admission),
            service: Arc::new(service),
        }
    }

    /// Build every component from configuration.
    ///
    /// Starts the worker pool when `concurrency.use_worker_pool` is set, so
    /// this must run inside a tokio runtime.
    pub fn from_config(config: Config) -> Self {
        let admission = AdmissionController::from_config(&config.concurrency);
        let cache = Arc::new(CacheEngine::from_config(&config.cache));
        let engine = Arc::new(ExecutionEngine::from_config(&config.tool));
        let pool = config.concurrency.use_worker_pool.then(|| {
            Arc::new(WorkerPool::new(
                config.concurrency.max_workers,
                config.concurrency.max_queue_size,
            ))
        });
        let service = AnalysisService::new(cache, engine, pool);
        Self::new(config, admission, service)
    }

    /// Start the periodic sweepers. They stop on their own once the state
    /// they sweep is dropped.
    pub fn spawn_maintenance(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.admission
                .spawn_sweeper(self.config.concurrency.client_sweep_interval()),
        ];
        if self.config.cache.sweep_interval_secs > 0 {
            let interval = std::time::Duration::from_secs(self.config.cache.sweep_interval_secs);
            handles.push(self.service.cache().spawn_sweeper(interval));
        }
        handles
    }
}

pub fn build_router(state: AppState) -> Router {
    let analyses = Router::new()
        .route("/api/analyses/:name", post(handlers::run_analysis))
        .route(
            "/api/analyses/:name/download",
            post(handlers::download_analysis),
        )
        // Flat paths from earlier releases; `/api/stats` takes precedence.
        .route("/api/:name", post(handlers::run_analysis))
        .route("/api/:name/download", post(handlers::download_analysis))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware::admission_middleware,
        ));

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/api/stats", get(handlers::stats))
        .merge(analyses)
        .layer(from_fn(middleware::cors_middleware))
        .layer(DefaultBodyLimit::max(state.config.server.max_upload_bytes()))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then finish in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                tracing::warn!("failed to register signal handlers, falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
}
