use thiserror::Error;

use crate::cache::GenerationId;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Origin unreachable: {0}")]
    Unreachable(String),

    #[error("Request to {url} failed with status {status}: {body}")]
    BadStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unknown cache generation: {0}")]
    UnknownGeneration(GenerationId),

    #[error("Cache storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notification could not be shown: {0}")]
    Notification(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl WorkerError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &[u8]) -> String {
        let text = String::from_utf8_lossy(body);
        if text.len() <= MAX_ERROR_BODY_LENGTH {
            text.into_owned()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &text[..end], body.len())
        }
    }

    pub fn from_status(url: &str, status: u16, body: &[u8]) -> Self {
        WorkerError::BadStatus {
            url: url.to_string(),
            status,
            body: Self::truncate_body(body),
        }
    }
}
