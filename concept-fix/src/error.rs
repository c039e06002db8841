use thiserror::Error;

/// Failures the model gateway can surface. None of these are recovered from
/// locally; the session controller owns user-facing messaging.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("OPENROUTER_API_KEY is not set")]
    MissingApiKey,

    #[error("model returned no content")]
    EmptyResponse,

    #[error("model response did not match the declared schema: {0}")]
    MalformedResponse(String),

    #[error("model provider request failed: {0}")]
    Upstream(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
