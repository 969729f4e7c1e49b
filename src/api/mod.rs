//! HTTP surface of the dashboard.
//!
//! `GET /api/data` rebuilds the metrics document from the warehouse on every
//! call. `GET /` serves the page that polls it, behind the login gate when
//! one is configured.

pub mod error;
pub mod shell;

pub use error::ErrorResponse;

use crate::auth::{self, AuthGate, Session};
use crate::metrics::{MetricsCollector, MetricsError};
use crate::models::MetricsDocument;
use crate::warehouse::Warehouse;
use axum::extract::State;
use axum::middleware;
use axum::response::Html;
use axum::routing::get;
use axum::{Extension, Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Everything handlers share. Read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub warehouse: Arc<dyn Warehouse>,
    pub collector: Arc<MetricsCollector>,
    pub refresh_interval_seconds: u64,
    pub auth: Option<AuthGate>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let mut page = Router::new().route("/", get(index));
    if let Some(gate) = &state.auth {
        page = page.route_layer(middleware::from_fn_with_state(
            gate.clone(),
            auth::require_login,
        ));
    }

    let mut app = Router::new()
        .route("/api/data", get(api_data))
        .route("/healthz", get(healthz))
        .merge(page);

    if let Some(gate) = &state.auth {
        app = app.merge(auth::routes(gate.clone()));
    }

    app.with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn index(
    State(state): State<AppState>,
    session: Option<Extension<Session>>,
) -> Html<String> {
    let user = session
        .map(|Extension(s)| s.name)
        .unwrap_or_else(|| "Guest".to_string());
    Html(shell::render_dashboard(&user, state.refresh_interval_seconds))
}

async fn api_data(State(state): State<AppState>) -> Result<Json<MetricsDocument>, MetricsError> {
    let start = Instant::now();
    let document = state.collector.collect(state.warehouse.as_ref()).await?;

    info!(
        "Served dashboard data ({} thin films, {} datasets) in {:.2}s",
        document.thin_films_count,
        document.datasets_count,
        start.elapsed().as_secs_f64()
    );

    Ok(Json(document))
}
