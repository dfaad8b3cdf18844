//! Axum HTTP surface for the trade statistics harvester.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tradestat_core::{HarvestRequest, HsLevel};
use tradestat_harvest::{HarvestConfig, HarvestService};
use tradestat_storage::StoreError;

pub const CRATE_NAME: &str = "tradestat-web";

/// Non-standard status returned when a harvest ends because it was cancelled.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Clone)]
pub struct AppState {
    pub service: HarvestService,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(service: HarvestService, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            service,
            workspace_root: workspace_root.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeResponse {
    message: &'static str,
    file_path: String,
    operation_id: String,
}

#[derive(Debug, Serialize)]
struct MessageBody {
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scrape/{country}/{hs_code}/{hs_level}", post(scrape_handler))
        .route("/data/{country}/{hs_code}/{hs_level}", get(data_handler))
        .route("/cancel/{operation_id}", delete(cancel_handler))
        .route("/countries", get(countries_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("TRADESTAT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let service = HarvestService::from_config(HarvestConfig::from_env());
    let registry = Arc::clone(service.registry());
    let state = AppState::new(service, ".");

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "tradestat web listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
            registry.shutdown();
        })
        .await
        .context("serving http")?;
    Ok(())
}

/// Runs a harvest to completion. If the client goes away first the handler future is
/// dropped, which cancels the operation.
async fn scrape_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((country, hs_code, hs_level)): AxumPath<(String, String, String)>,
) -> Response {
    let request = HarvestRequest::new(country, hs_code, hs_level);
    let running = match state.service.start(request) {
        Ok(running) => running,
        Err(err) => {
            error!(error = %err, "could not register harvest");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Scraping failed");
        }
    };
    let operation_id = running.operation_id().to_string();

    match running.finish().await {
        Ok(saved) => Json(ScrapeResponse {
            message: "Scraping completed",
            file_path: saved.path.display().to_string(),
            operation_id,
        })
        .into_response(),
        Err(err) if err.is_cancelled() => {
            info!(%operation_id, "harvest cancelled");
            json_error(client_closed_request(), "Request cancelled")
        }
        Err(err) => {
            warn!(%operation_id, error = %error_chain(&err), "harvest failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Scraping failed")
        }
    }
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((country, hs_code, hs_level)): AxumPath<(String, String, String)>,
) -> Response {
    let level = HsLevel::new(hs_level);
    match state.service.store().consume(&country, &hs_code, &level).await {
        Ok(record) => Json(record).into_response(),
        Err(StoreError::NotFound { .. }) => json_error(StatusCode::NOT_FOUND, "Data not found"),
        Err(err @ StoreError::Corrupt { .. }) => {
            warn!(error = %error_chain(&err), "stored artifact is corrupt");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid JSON format")
        }
        Err(err) => {
            error!(error = %error_chain(&err), "reading stored artifact failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read data")
        }
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(operation_id): AxumPath<String>,
) -> Response {
    if state.service.registry().cancel(&operation_id) {
        Json(MessageBody {
            message: "Operation cancelled",
        })
        .into_response()
    } else {
        json_error(StatusCode::NOT_FOUND, "Operation not found")
    }
}

async fn countries_handler(State(state): State<Arc<AppState>>) -> Response {
    let path = state.workspace_root.join("countries.json");
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(_) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, "File not found"),
    };
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => Json(value).into_response(),
        Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "Invalid JSON format"),
    }
}

fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
}

fn json_error(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
