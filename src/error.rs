//! Error types for the gateway.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid request: {message}")]
    ClientInput { message: String },

    #[error("Unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    #[error("Request body is empty")]
    EmptyBody,

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("Upstream error (status {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream circuit open, request not attempted")]
    CircuitOpen,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn client_input(msg: impl Into<String>) -> Self {
        Self::ClientInput {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn upstream(status: u16, msg: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// HTTP status surfaced to the caller. Upstream statuses are preserved
    /// where they carry meaning; everything transport-shaped becomes 502.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ClientInput { .. } | Self::UnsupportedFeature { .. } | Self::EmptyBody => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::Upstream { status, .. } if *status >= 400 => *status,
            Self::CircuitOpen => 503,
            Self::Config { .. } => 500,
            _ => 502,
        }
    }

    /// Message safe to return to the caller: no upstream bodies, no credentials,
    /// no transport-level detail. The full error stays in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::ClientInput { message } => message.clone(),
            Self::UnsupportedFeature { message } => format!("unsupported feature: {message}"),
            Self::EmptyBody => "request body is empty".to_string(),
            Self::PayloadTooLarge { limit } => format!("request body exceeds {limit} bytes"),
            Self::Translation { .. } => "upstream response could not be translated".to_string(),
            Self::Upstream { status, .. } => format!("upstream returned status {status}"),
            Self::CircuitOpen => "upstream temporarily unavailable".to_string(),
            _ => "internal proxy error".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
