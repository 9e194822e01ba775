use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use wps_store::StateStore;

use crate::handlers;
use crate::state::AppState;

/// Build the read-only API router.
///
/// The workspace lookups are nested under `api_prefix`; health probes stay
/// at the root. Nothing here mutates state; the router only ever reads
/// the store.
pub fn build_app(store: Arc<dyn StateStore>, api_prefix: &str) -> Router {
    let state = AppState { store };

    let workspaces = Router::new()
        .route("/workspaces/:permit_id/status", get(handlers::workspace_status))
        .route(
            "/workspaces/:permit_id/connection",
            get(handlers::workspace_connection),
        );

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .nest(api_prefix, workspaces)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
