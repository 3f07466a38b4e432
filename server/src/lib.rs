pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod validation;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use stream_core::{load_example_scripts, ExampleScript, Generator, SessionConfig, SessionGate, VoiceRegistry};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorError, GovernorLayer,
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::metrics::AppMetrics;
use crate::validation::MAX_UPLOAD_BODY_BYTES;

#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn Generator>,
    pub voices: Arc<VoiceRegistry>,
    pub examples: Arc<Vec<ExampleScript>>,
    pub gate: SessionGate,
    pub metrics: AppMetrics,
    pub config: ServerConfig,
    pub session_config: SessionConfig,
    pub started_at: Instant,
}

impl AppState {
    /// Reads the example-script catalogue from `config.examples_dir`.
    pub fn new(generator: Arc<dyn Generator>, voices: VoiceRegistry, config: ServerConfig) -> Self {
        let examples = load_example_scripts(&config.examples_dir);
        Self {
            generator,
            voices: Arc::new(voices),
            examples: Arc::new(examples),
            gate: SessionGate::new(),
            metrics: AppMetrics::new(),
            session_config: config.session_config(),
            config,
            started_at: Instant::now(),
        }
    }
}

/// CORS configuration - environment-aware
fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    let Some(allowed_origins) = config.cors_allowed_origins.as_ref() else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return base.allow_origin(tower_http::cors::Any);
    };

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header.clone() {
        request.headers_mut().insert("x-request-id", value);
    }
    let mut response = next.run(request).await;
    if let Some(value) = header {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Rate-limit rejections use the same JSON body as every other error.
fn rate_limit_response(err: GovernorError) -> Response {
    match err {
        GovernorError::TooManyRequests { wait_time, headers } => {
            warn!("Rate limit exceeded, retry in {wait_time}s");
            let mut response = ApiError::RateLimitExceeded.into_response();
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
        other => ApiError::InternalError(other.to_string()).into_response(),
    }
}

/// Build the full router: routes at the root and under `/api`.
pub fn app(state: AppState) -> anyhow::Result<Router> {
    let config = &state.config;

    // GlobalKeyExtractor: all requests share one limit, which also works
    // behind proxies where the peer address is not the client.
    let per_minute = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / per_minute as u64).max(1))
            .burst_size(per_minute)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration: {per_minute}/min"))?,
    );
    info!("Rate limiting: {} requests per minute", per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf).error_handler(rate_limit_response))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(config))
        .into_inner();

    let public_api = Router::new()
        .route("/health", get(routes::health_check))
        .route("/healthz", get(routes::health_check))
        .route(
            "/voices",
            get(routes::list_voices)
                .post(routes::upload_voice)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES)),
        )
        .route("/examples", get(routes::list_examples))
        .route("/generate", post(routes::generate))
        .route("/generate/stream", get(routes::generate_stream))
        .route("/stop", post(routes::stop));

    // Metrics endpoint - consider adding authentication in production
    let metrics_api = Router::new().route("/metrics", get(routes::metrics_endpoint));

    let api = Router::new().merge(public_api).merge(metrics_api);

    Ok(Router::new()
        .merge(api.clone()) // root paths
        .nest("/api", api) // /api prefix
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}
