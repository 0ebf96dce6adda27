use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::cache::ReportOutcome;
use crate::error::ApiError;
use crate::report::AbsenceReport;
use crate::AppState;

pub const BUILD_VERSION: &str = env!("BUILD_VERSION");
pub const BUILD_DATE: &str = env!("BUILD_DATE");
pub const RUSTC_VERSION: &str = env!("RUSTC_VERSION");

pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Serialize)]
pub struct VersionInfo {
    pub git_hash: &'static str,
    pub build_date: &'static str,
    pub rustc_version: &'static str,
}

pub async fn version_info() -> Json<VersionInfo> {
    Json(VersionInfo {
        git_hash: BUILD_VERSION,
        build_date: BUILD_DATE,
        rustc_version: RUSTC_VERSION,
    })
}

/// The absence report, refreshed from the portal when stale.
pub async fn get_absences(
    State(state): State<AppState>,
) -> Result<Json<AbsenceReport>, ApiError> {
    let portal = Arc::clone(&state.portal);
    let credentials = Arc::clone(&state.credentials);

    let outcome = state
        .cache
        .get_or_refresh(move || async move { portal.fetch_report(&credentials).await })
        .await;

    match outcome {
        ReportOutcome::Ready(report) => Ok(Json(report)),
        ReportOutcome::Backoff => Err(ApiError::service_unavailable("temporary backoff")),
        ReportOutcome::Empty => Err(ApiError::service_unavailable("no data yet")),
    }
}
