use std::net::SocketAddr;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::snapshot::{Filter, SnapshotEntry, SnapshotHandle, DEFAULT_JLIM};

/// Shared state of the observation endpoint: the snapshot the supervisor
/// publishes after every tick. The dashboard never touches pool internals.
#[derive(Clone)]
pub struct DashboardState {
    pub snapshot: SnapshotHandle,
}

/// Query parameters of the collection endpoints.
///
/// `flt` is a `|`-separated list of `pname[*][:beg[..end]]` predicates,
/// AND-combined; `jlim` caps the number of returned entries.
#[derive(Debug, Default, Deserialize)]
pub struct ObserveParams {
    flt: Option<String>,
    jlim: Option<usize>,
}

/// The status routes over a published snapshot handle.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/failures", get(failures_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/tasks", get(tasks_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting status server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind status server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Status server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn failures_handler(
    State(state): State<DashboardState>,
    Query(params): Query<ObserveParams>,
) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    select(&snap.failures, &params)
}

async fn jobs_handler(
    State(state): State<DashboardState>,
    Query(params): Query<ObserveParams>,
) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    select(&snap.jobs, &params)
}

async fn tasks_handler(
    State(state): State<DashboardState>,
    Query(params): Query<ObserveParams>,
) -> impl IntoResponse {
    let snap = state.snapshot.read().await;
    select(&snap.tasks, &params)
}

fn select(
    entries: &[SnapshotEntry],
    params: &ObserveParams,
) -> Result<Json<Vec<SnapshotEntry>>, (StatusCode, String)> {
    let filter = match &params.flt {
        Some(expr) => Filter::parse(expr)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid filter: {e}")))?,
        None => Filter::default(),
    };
    let limit = params.jlim.unwrap_or(DEFAULT_JLIM);
    Ok(Json(
        filter.apply(entries, limit).into_iter().cloned().collect(),
    ))
}
