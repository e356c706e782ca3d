//! Typed errors at the library seams. The evaluator and CLI wrap these in `anyhow`.

use std::path::PathBuf;

use scriptcraft_types::Dimension;

/// Failures talking to the chat-completions endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("API key is not set (configure ARK_API_KEY)")]
    MissingApiKey,

    #[error("model endpoint is not set (configure MODEL_ENDPOINT)")]
    MissingModel,

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },
}

impl ClientError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::MissingApiKey | Self::MissingModel | Self::InvalidResponse { .. } => false,
        }
    }
}

impl ClientError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout { secs: timeout_secs }
        } else if err.is_decode() {
            Self::InvalidResponse {
                message: err.to_string(),
            }
        } else {
            Self::Network {
                message: err.to_string(),
            }
        }
    }
}

/// Model output that could not be turned into a dimension verdict.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("model response is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("model returned an empty JSON array")]
    EmptyArray,

    #[error("model returned a single number ({0}) instead of a JSON object")]
    BareNumber(f64),

    #[error("model returned a JSON {0} instead of an object")]
    NotAnObject(&'static str),

    #[error("model response has no numeric 'total_score'")]
    MissingScore,
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("prompt template for '{dimension}' has no {{script_content}} placeholder")]
    MissingPlaceholder { dimension: Dimension },

    #[error("failed to read prompt template {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to read script {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script '{name}' is empty")]
    Empty { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ClientError::Timeout { secs: 5 }.is_retryable());
        assert!(ClientError::Network { message: "reset".into() }.is_retryable());
        assert!(ClientError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(ClientError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(!ClientError::Http { status: 401, body: String::new() }.is_retryable());
        assert!(!ClientError::MissingApiKey.is_retryable());
    }
}
