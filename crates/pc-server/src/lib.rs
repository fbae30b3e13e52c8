//! HTTP surface for the engine. Grounded on the teacher's `app_router`/`serve`
//! split (route table assembled in one function, auth and readiness gates
//! layered over it, `axum::serve` driven with graceful shutdown) but scoped
//! down to the run/document/eval verb table this engine exposes.

mod auth;
mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use pc_coordinator::RunCoordinator;
use tower_http::cors::{Any, CorsLayer};

pub use auth::CredentialTable;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RunCoordinator>,
    pub credentials: Arc<CredentialTable>,
}

impl AppState {
    pub fn new(coordinator: Arc<RunCoordinator>, credentials: CredentialTable) -> Self {
        Self {
            coordinator,
            credentials: Arc::new(credentials),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/runs", post(handlers::create_run).get(handlers::list_runs))
        .route(
            "/runs/{id}",
            get(handlers::get_run)
                .patch(handlers::update_run)
                .delete(handlers::delete_run),
        )
        .route("/runs/{id}/documents", post(handlers::attach_document).get(handlers::list_documents))
        .route("/runs/{id}/documents/batch", post(handlers::attach_documents_batch))
        .route("/runs/{id}/documents/{document_id}", delete(handlers::detach_document))
        .route("/runs/{id}/start", post(handlers::start_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/runs/{id}/evaluate/status", get(handlers::evaluate_status))
        .route("/runs/{id}/evaluate/results", get(handlers::evaluate_results))
        .route("/rate-limits/status", get(handlers::rate_limit_status))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_gate))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "pc-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
