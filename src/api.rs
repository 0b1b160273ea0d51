//! REST surface over the lifecycle manager.
//!
//! Every handler is a thin pass-through; failures are reported as
//! `{"success": false, "error": ...}` with a matching status code.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::container::{ContainerLifecycleManager, ContainerStatus};
use crate::node::config::MIN_PASSPHRASE_LEN;
use crate::node::{NodeLocation, Passphrase};

pub struct ApiState {
    pub manager: Arc<ContainerLifecycleManager>,
}

pub type SharedState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ContainerStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// Omitted when the price table matches neither location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<NodeLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    fn ok() -> Self {
        Self {
            success: true,
            status: None,
            checked_at: None,
            value: None,
            logs: None,
            location: None,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok()
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn outcome(op: &str, success: bool) -> Reply {
    if success {
        (StatusCode::OK, Json(ApiResponse::ok()))
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::failed(format!("{op} failed, see daemon log"))),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    pub location: NodeLocation,
}

#[derive(Deserialize)]
pub struct PassphraseRequest {
    pub passphrase: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn status(State(state): State<SharedState>) -> Reply {
    let status = state.manager.status().await;
    (
        StatusCode::OK,
        Json(ApiResponse {
            status: Some(status),
            checked_at: Some(Utc::now()),
            ..ApiResponse::ok()
        }),
    )
}

async fn exists(State(state): State<SharedState>) -> Reply {
    let value = state.manager.exists().await;
    (
        StatusCode::OK,
        Json(ApiResponse {
            value: Some(value),
            ..ApiResponse::ok()
        }),
    )
}

async fn running(State(state): State<SharedState>) -> Reply {
    let value = state.manager.running().await;
    (
        StatusCode::OK,
        Json(ApiResponse {
            value: Some(value),
            ..ApiResponse::ok()
        }),
    )
}

async fn start(State(state): State<SharedState>) -> Reply {
    outcome("start", state.manager.start().await)
}

async fn stop(State(state): State<SharedState>) -> Reply {
    outcome("stop", state.manager.stop().await)
}

async fn restart(State(state): State<SharedState>) -> Reply {
    outcome("restart", state.manager.restart().await)
}

async fn remove(State(state): State<SharedState>) -> Reply {
    outcome("remove", state.manager.remove().await)
}

async fn logs(State(state): State<SharedState>, Query(query): Query<LogsQuery>) -> Reply {
    match state.manager.logs(query.tail).await {
        Some(logs) => (
            StatusCode::OK,
            Json(ApiResponse {
                logs: Some(logs),
                ..ApiResponse::ok()
            }),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::failed("logs unavailable")),
        ),
    }
}

async fn set_passphrase(
    State(state): State<SharedState>,
    Json(body): Json<PassphraseRequest>,
) -> Reply {
    let passphrase = Passphrase::new(body.passphrase);
    if passphrase.expose().chars().count() < MIN_PASSPHRASE_LEN {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::failed(format!(
                "passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
            ))),
        );
    }
    state.manager.store().set_passphrase(passphrase).await;
    (StatusCode::OK, Json(ApiResponse::ok()))
}

async fn clear_passphrase(State(state): State<SharedState>) -> Reply {
    state.manager.store().clear_passphrase().await;
    (StatusCode::OK, Json(ApiResponse::ok()))
}

async fn refresh_config(State(state): State<SharedState>) -> Reply {
    outcome("config refresh", state.manager.refresh_config().await)
}

async fn location(State(state): State<SharedState>) -> Reply {
    let location = state.manager.store().snapshot().await.location();
    (
        StatusCode::OK,
        Json(ApiResponse {
            location,
            ..ApiResponse::ok()
        }),
    )
}

async fn set_location(
    State(state): State<SharedState>,
    Json(body): Json<LocationRequest>,
) -> Reply {
    match state.manager.store().set_location(body.location).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse {
                location: Some(body.location),
                ..ApiResponse::ok()
            }),
        ),
        Err(e) => {
            warn!(location = ?body.location, error = %e, "location update failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::failed(e.to_string())),
            )
        }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/node/status", get(status))
        .route("/api/v1/node/exists", get(exists))
        .route("/api/v1/node/running", get(running))
        .route("/api/v1/node/start", post(start))
        .route("/api/v1/node/stop", post(stop))
        .route("/api/v1/node/restart", post(restart))
        .route("/api/v1/node/remove", post(remove))
        .route("/api/v1/node/logs", get(logs))
        .route(
            "/api/v1/node/passphrase",
            post(set_passphrase).delete(clear_passphrase),
        )
        .route("/api/v1/node/config/refresh", post(refresh_config))
        .route("/api/v1/node/location", get(location).post(set_location))
        .with_state(state)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, only ctrl-c stops the daemon");
            None
        }
    };
    let terminate = async {
        match sigterm.as_mut() {
            Some(sigterm) => {
                sigterm.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

/// Serve the API on `bind` until SIGINT or SIGTERM.
///
/// On shutdown an in-flight start is interrupted and its container stopped
/// before the server stops accepting requests.
pub async fn serve(bind: SocketAddr, state: SharedState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding API listener on {bind}"))?;
    info!(addr = %bind, "node API listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutting down, settling node container");
            shutdown_state.manager.shutdown().await;
        })
        .await
        .context("API server")?;
    info!("API server stopped");
    Ok(())
}
