use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("provider `{scheme}` requires the `{var}` environment variable")]
    MissingCredential { scheme: String, var: String },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }
}
