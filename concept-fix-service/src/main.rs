mod service;

use std::sync::Arc;

use axum::{
    http::{HeaderValue, Request},
    middleware::{Next, from_fn},
};
use concept_fix::OpenRouterGateway;
use tracing::{Instrument, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::service::AppState;

/// Initialize structured tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "concept_fix_service=debug,concept_fix=debug,tower_http=debug".into());

    match log_format.as_str() {
        "pretty" => {
            // Human-readable logging for development
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            // Structured JSON logging for production
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    next.run(request).instrument(span).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // The gateway validates the credential on every call; a missing key is
    // surfaced per request, so startup only warns.
    if std::env::var("OPENROUTER_API_KEY").is_err() {
        warn!("OPENROUTER_API_KEY not set; diagnosis requests will fail until it is provided");
    }

    let gateway = Arc::new(OpenRouterGateway::from_env());
    let state = AppState::new(gateway);

    let app = service::build_router(state).layer(from_fn(correlation_id_middleware));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server running on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
