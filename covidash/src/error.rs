//! Error types.

#[derive(thiserror::Error, Debug)]
pub enum CovidashError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("No data found: {0}")]
    NotFound(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Unexpected result shape: {0}")]
    DataIntegrity(String),
    #[error("Wrapped polars error: {0}")]
    PolarsError(#[from] polars::error::PolarsError),
    #[error("Wrapped IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CovidashError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_))
    }

    /// Whether the failure was caused by the caller's input or a lookup with no data, as
    /// opposed to a backend fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }
}

impl From<reqwest::Error> for CovidashError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::DataIntegrity(format!("undecodable warehouse response: {err}"))
        } else {
            Self::ServiceUnavailable(format!("warehouse request failed: {err}"))
        }
    }
}

impl From<tokio::time::error::Elapsed> for CovidashError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::ServiceUnavailable("timed out waiting for the warehouse".into())
    }
}

pub type Result<T> = std::result::Result<T, CovidashError>;
