pub mod api_constants;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limits;
pub mod portal;
pub mod report;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::cache::ReportCache;
use crate::config::Credentials;
use crate::portal::PortalClient;

#[derive(Clone)]
pub struct AppState {
    pub portal: Arc<PortalClient>,
    pub credentials: Arc<Credentials>,
    pub cache: Arc<ReportCache>,
}

/// Create a minimal test router without production middleware
pub fn create_test_router(state: AppState) -> Router {
    Router::new()
        .route(api_constants::HEALTH_ROUTE, get(handlers::health_check))
        .route(api_constants::VERSION_ROUTE, get(handlers::version_info))
        .route(api_constants::ABSENCES_ROUTE, get(handlers::get_absences))
        .with_state(state)
}
