use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::signer::CertSigner;
use pkg_types::request::SigningRequest;

/// Shared application state injected into all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<CertSigner>,
    /// Directory where signed results are persisted and re-served from.
    pub csr_dir: PathBuf,
}

/// Server configuration passed from the binary's CLI.
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Optional second listener serving only the health check.
    pub health_addr: Option<SocketAddr>,
    pub csr_dir: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/certificatesigningrequests", post(post_csr))
        .route("/certificatesigningrequests/{name}", get(get_csr))
        .route("/readyz", get(health_check))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

pub async fn start_server(config: ServerConfig, signer: CertSigner) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.csr_dir)?;
    let state = AppState {
        signer: Arc::new(signer),
        csr_dir: PathBuf::from(&config.csr_dir),
    };

    if let Some(health_addr) = config.health_addr {
        let health = Router::new().route("/readyz", get(health_check));
        let listener = TcpListener::bind(health_addr).await?;
        info!("Health check listener on {}", health_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, health).await {
                error!("health listener failed: {}", e);
            }
        });
    }

    info!("Starting signer server on {}", config.addr);
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!("{} {} -> {}", method, path, response.status().as_u16());
    response
}

/// Accepts a serialized signing request, runs the signing decision, and
/// persists the result (signed or denied) keyed by request name.
async fn post_csr(
    State(state): State<AppState>,
    Json(mut request): Json<SigningRequest>,
) -> impl IntoResponse {
    if !valid_name(&request.name) {
        return (StatusCode::BAD_REQUEST, "Invalid request name").into_response();
    }

    let sign_result = state.signer.sign(&mut request);

    let body = match serde_json::to_vec(&request) {
        Ok(body) => body,
        Err(e) => {
            error!("Error serializing signed request: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    // persist the outcome so the agent can re-fetch it later
    let path = state.csr_dir.join(&request.name);
    if let Err(e) = tokio::fs::write(&path, &body).await {
        error!("Unable to write to {:?}: {}", path, e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist result").into_response();
    }

    if sign_result.is_err() {
        // the denial is recorded on disk; the submission itself is rejected
        return (StatusCode::BAD_REQUEST, Body::from(body)).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body),
    )
        .into_response()
}

/// Re-serves a previously persisted result by request name.
async fn get_csr(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    if !valid_name(&name) {
        return (StatusCode::BAD_REQUEST, "Invalid request name").into_response();
    }
    match tokio::fs::read(state.csr_dir.join(&name)).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            Body::from(body),
        )
            .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            format!("no stored request named {}", name),
        )
            .into_response(),
    }
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Request names become file names under the CSR directory; refuse anything
/// that could escape it.
fn valid_name(name: &str) -> bool {
    !name.is_empty() && FsPath::new(name).file_name().map(|f| f == name).unwrap_or(false)
}
