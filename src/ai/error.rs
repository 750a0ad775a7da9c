use thiserror::Error;

/// Errors from the LLM driver, classified so the retry wrapper knows
/// which ones are worth another attempt.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("llm endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("llm request could not be built: {0}")]
    Request(String),
    #[error("model returned unparseable content: {excerpt}")]
    BadResponse { excerpt: String },
}

impl AiError {
    pub fn status(status: u16, body: &str) -> Self {
        AiError::Status {
            status,
            body: excerpt(body, 200),
        }
    }

    pub fn bad_response(content: &str) -> Self {
        AiError::BadResponse {
            excerpt: excerpt(content, 200),
        }
    }

    /// Retry only rate limiting, transient server failures, and
    /// connect/timeout transport errors. Everything else is a caller
    /// bug or a terminal response.
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::Status { status, .. } => matches!(status, 429 | 500 | 503),
            AiError::Transport(error) => {
                error.is_timeout() || error.is_connect() || error.is_request()
            }
            AiError::Request(_) | AiError::BadResponse { .. } => false,
        }
    }
}

/// Char-boundary-safe truncation for error excerpts.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}…")
}
