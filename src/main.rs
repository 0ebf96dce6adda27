use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::error_handling::HandleErrorLayer;
use axum::extract::{ConnectInfo, Extension};
use axum::http::{header, HeaderValue, Request};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{BoxError, Router};
use tower::timeout::error::Elapsed;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Span};
use tracing_subscriber::EnvFilter;

use absentia::api_constants;
use absentia::cache::ReportCache;
use absentia::config::{self, Credentials, PortalEndpoints, RefreshSettings};
use absentia::error::ApiError;
use absentia::handlers::{self, BUILD_VERSION};
use absentia::limits::RequestRateLimiter;
use absentia::portal::PortalClient;
use absentia::AppState;

/// Maximum time any request can take before being terminated.
/// Applies to: all routes. A cold /absences request walks the portal login
/// plus four API calls, each with its own 10s upstream timeout, so this sits
/// above the worst-case chain rather than at interactive latency.
const GLOBAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum requests per IP address per minute.
/// Applies to: all requests from a single peer address.
/// Heavy user estimate: a dashboard polling /absences every few seconds plus
/// health checks stays well under 60/minute. 240 provides ample headroom.
const GLOBAL_RATE_LIMIT_PER_MINUTE: u64 = 240;

/// Window duration for per-IP rate limiting (used with GLOBAL_RATE_LIMIT_PER_MINUTE).
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("absentia=debug".parse()?))
        .init();

    info!("Starting absence service");

    let credentials = Credentials::from_env()?;
    let endpoints = PortalEndpoints::from_env();
    let refresh = RefreshSettings::from_env()?;

    let portal = PortalClient::new(endpoints)?;
    let cache = ReportCache::new(refresh.refresh_interval, refresh.error_backoff);

    let state = AppState {
        portal: Arc::new(portal),
        credentials: Arc::new(credentials),
        cache: Arc::new(cache),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::HeaderName::from_static("x-build-version")]);

    let build_version_header = SetResponseHeaderLayer::if_not_present(
        header::HeaderName::from_static("x-build-version"),
        HeaderValue::from_static(BUILD_VERSION),
    );

    let rate_limiter = RequestRateLimiter::new(GLOBAL_RATE_LIMIT_PER_MINUTE, RATE_LIMIT_WINDOW);

    let app = Router::new()
        .route(api_constants::HEALTH_ROUTE, get(handlers::health_check))
        .route(api_constants::VERSION_ROUTE, get(handlers::version_info))
        .route(api_constants::ABSENCES_ROUTE, get(handlers::get_absences))
        .layer(from_fn(enforce_rate_limit))
        .layer(build_version_header)
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_request_span)
                .on_request(on_request)
                .on_response(on_response),
        )
        .layer(from_fn(record_client_ip))
        .layer(Extension(rate_limiter))
        .layer(CatchPanicLayer::new())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_layer_error))
                .timeout(GLOBAL_REQUEST_TIMEOUT)
                .into_inner(),
        )
        .with_state(state);

    let port = config::parse_port()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn handle_layer_error(err: BoxError) -> ApiError {
    if err.is::<Elapsed>() {
        ApiError::service_unavailable("Request timed out")
    } else {
        ApiError::internal("Request failed")
    }
}

async fn enforce_rate_limit(
    Extension(limiter): Extension<RequestRateLimiter>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let client_key = peer_addr.ip().to_string();
    if limiter.try_acquire(&client_key) {
        next.run(req).await
    } else {
        ApiError::too_many_requests("Too many requests").into_response()
    }
}

async fn record_client_ip(
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    req.extensions_mut().insert(peer_addr.ip().to_string());
    next.run(req).await
}

fn extract_ip_for_logging<B>(req: &Request<B>) -> String {
    if let Some(ip) = req.extensions().get::<String>() {
        return ip.clone();
    }

    "unknown".to_string()
}

fn make_request_span<B>(req: &Request<B>) -> Span {
    let method = req.method();
    let path = req.uri().path();
    let query = req.uri().query();
    let full_path = if let Some(q) = query {
        format!("{path}?{q}")
    } else {
        path.to_string()
    };

    let client_ip = extract_ip_for_logging(req);

    tracing::info_span!(
        "http_request",
        method = %method,
        path = %full_path,
        ip = %client_ip
    )
}

fn on_request<B>(req: &Request<B>, _span: &Span) {
    let method = req.method();
    let path = req.uri().path();
    let query = req.uri().query();
    let full_path = if let Some(q) = query {
        format!("{path}?{q}")
    } else {
        path.to_string()
    };

    let client_ip = extract_ip_for_logging(req);
    info!("{} {} from {}", method, full_path, client_ip);
}

fn on_response<B>(response: &Response<B>, latency: Duration, _span: &Span) {
    let status = response.status();
    let latency_ms = latency.as_millis();
    info!("Response {} in {}ms", status, latency_ms);
}
