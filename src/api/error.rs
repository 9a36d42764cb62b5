use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{provider} authentication failed: {details}")]
    AuthenticationFailed { provider: String, details: String },

    #[error("rate limited by {provider}: {details}")]
    RateLimited { provider: String, details: String },

    #[error("invalid request to {provider}: {details}")]
    InvalidRequest { provider: String, details: String },

    #[error("{provider} server error (HTTP {status}): {details}")]
    Server {
        provider: String,
        status: u16,
        details: String,
    },

    #[error("SSE parse error: {details}")]
    Sse { details: String },

    #[error("stream failed for model {model} at start: {details}")]
    Start { model: String, details: String },

    #[error("stream failed for model {model}: {details}")]
    Stream { model: String, details: String },

    #[error("stream for model {model} ended with stop_reason=error")]
    ErrorStop { model: String },

    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Faults raised before any stream event was delivered.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            ProviderError::Network(_)
                | ProviderError::AuthenticationFailed { .. }
                | ProviderError::RateLimited { .. }
                | ProviderError::InvalidRequest { .. }
                | ProviderError::Server { .. }
                | ProviderError::Start { .. }
        )
    }
}
