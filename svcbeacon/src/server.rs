//! HTTP surface served on the registered listener

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use svcbeacon_discovery::{RunningService, ServiceId};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    service_id: Arc<ServiceId>,
}

impl AppState {
    pub fn new(service_id: ServiceId) -> Self {
        Self {
            service_id: Arc::new(service_id),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe; answers as long as the process serves requests
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service_id": state.service_id.as_str(),
    }))
}

/// Serve HTTP until a signal arrives or a background task fails, then shut
/// the service down and deregister it.
pub async fn run(mut service: RunningService) -> Result<()> {
    let listener: TcpListener = service
        .take_listener()
        .context("listener already taken")?;
    let router = create_router(AppState::new(service.service_id().clone()));

    let http_shutdown = CancellationToken::new();
    let http_handle = {
        let http_shutdown = http_shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
        })
    };

    info!(
        service_id = %service.service_id(),
        address = %service.local_addr(),
        "HTTP server listening"
    );

    let task_result = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, starting graceful shutdown...");
            Ok(())
        }
        result = service.wait() => {
            if let Err(e) = &result {
                error!(error = %e, "Background task failed");
            }
            result
        }
    };

    http_shutdown.cancel();
    match http_handle.await {
        Ok(Ok(())) => info!("HTTP server stopped"),
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    let shutdown_result = service.shutdown().await;

    task_result?;
    shutdown_result?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
