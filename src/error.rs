//! Error types for the AutoExtract integration.
//!
//! `AutoExtractError` covers every failure that can surface from either call
//! path. The retry policy only ever absorbs the retryable class
//! (`QueryError`, `ServerError`, `Network`); everything else reaches the
//! caller unmodified.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use spider_util::error::SpiderError;

/// `type` reported by the API when the account has been disabled.
pub const ACCOUNT_DISABLED_ERROR_TYPE: &str =
    "http://errors.xod.scrapinghub.com/account-disabled.html";

static DOMAIN_OCCUPIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"domain (\S+) is occupied, please retry in ([0-9]+(?:\.[0-9]+)?) seconds")
        .expect("domain occupied pattern is valid")
});

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AutoExtractError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AutoExtractError {
    /// Missing or invalid configuration, raised before any call is made.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The API rejected the call as a whole. Never retried.
    #[error("Request error (status {status}): {message}")]
    RequestError {
        status: u16,
        error_type: Option<String>,
        message: String,
    },

    /// The API returned an error for a single query.
    #[error("QueryError: message='{message}', query={query}")]
    QueryError { query: Value, message: String },

    /// Throttling or server-side failure reported by the API over HTTP.
    #[error("Server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Connection failure or attempt timeout.
    #[error("Network error: {message}")]
    Network {
        message: String,
        is_timeout: bool,
        is_connect: bool,
    },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<AutoExtractError>,
    },

    /// Cache store I/O or decoding failure.
    #[error("Store error: {0}")]
    StoreError(String),

    /// The API answered with something that is not a list of results.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AutoExtractError {
    /// Whether the retry policy may issue another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AutoExtractError::QueryError { .. }
                | AutoExtractError::ServerError { .. }
                | AutoExtractError::Network { .. }
        )
    }

    pub fn is_account_disabled(&self) -> bool {
        match self {
            AutoExtractError::RequestError { error_type, .. } => {
                error_type.as_deref() == Some(ACCOUNT_DISABLED_ERROR_TYPE)
            }
            AutoExtractError::RetryExhausted { last_error, .. } => last_error.is_account_disabled(),
            _ => false,
        }
    }

    /// Seconds the API asked us to wait before retrying an occupied domain.
    pub fn retry_hint_secs(&self) -> Option<f64> {
        match self {
            AutoExtractError::QueryError { message, .. } => DOMAIN_OCCUPIED
                .captures(message)
                .and_then(|caps| caps.get(2))
                .and_then(|m| m.as_str().parse().ok()),
            _ => None,
        }
    }

    /// Short, low-cardinality description used in stats keys.
    pub fn summarize(&self) -> String {
        match self {
            AutoExtractError::QueryError { message, .. } => {
                if DOMAIN_OCCUPIED.is_match(message) {
                    "/query/domain occupied".to_string()
                } else {
                    format!("/query/{message}")
                }
            }
            AutoExtractError::RetryExhausted { last_error, .. } => last_error.summarize(),
            other => format!("/rest/{}", other.variant_name()),
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            AutoExtractError::ConfigurationError(_) => "ConfigurationError",
            AutoExtractError::RequestError { .. } => "RequestError",
            AutoExtractError::QueryError { .. } => "QueryError",
            AutoExtractError::ServerError { .. } => "ServerError",
            AutoExtractError::Network { .. } => "Network",
            AutoExtractError::RetryExhausted { .. } => "RetryExhausted",
            AutoExtractError::StoreError(_) => "StoreError",
            AutoExtractError::InvalidResponse(_) => "InvalidResponse",
            AutoExtractError::Cancelled => "Cancelled",
        }
    }
}

/// Errors leaving the middleware seam travel as `SpiderError`s. The message
/// keeps the full description, variant included.
impl From<AutoExtractError> for SpiderError {
    fn from(err: AutoExtractError) -> Self {
        match err {
            AutoExtractError::ConfigurationError(message) => {
                SpiderError::ConfigurationError(message)
            }
            AutoExtractError::StoreError(_) => SpiderError::IoError(err.to_string()),
            other => SpiderError::GeneralError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AutoExtractError {
    fn from(err: reqwest::Error) -> Self {
        AutoExtractError::Network {
            message: err.to_string(),
            is_timeout: err.is_timeout(),
            is_connect: err.is_connect(),
        }
    }
}

impl From<std::io::Error> for AutoExtractError {
    fn from(err: std::io::Error) -> Self {
        AutoExtractError::StoreError(err.to_string())
    }
}

impl From<bincode::Error> for AutoExtractError {
    fn from(err: bincode::Error) -> Self {
        AutoExtractError::StoreError(err.to_string())
    }
}

impl From<serde_json::Error> for AutoExtractError {
    fn from(err: serde_json::Error) -> Self {
        AutoExtractError::InvalidResponse(err.to_string())
    }
}

impl From<url::ParseError> for AutoExtractError {
    fn from(err: url::ParseError) -> Self {
        AutoExtractError::ConfigurationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_error_display() {
        let err = AutoExtractError::QueryError {
            query: json!({"foo": "bar"}),
            message: "sample error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            r#"QueryError: message='sample error', query={"foo":"bar"}"#
        );
    }

    #[test]
    fn summarize_removes_domain_variability() {
        let occupied = AutoExtractError::QueryError {
            query: json!({}),
            message: "domain xyz is occupied, please retry in 2.2 seconds".to_string(),
        };
        assert_eq!(occupied.summarize(), "/query/domain occupied");
        assert_eq!(occupied.retry_hint_secs(), Some(2.2));

        let other = AutoExtractError::QueryError {
            query: json!({}),
            message: "Another thing".to_string(),
        };
        assert_eq!(other.summarize(), "/query/Another thing");
        assert_eq!(other.retry_hint_secs(), None);

        assert_eq!(
            AutoExtractError::StoreError("disk".into()).summarize(),
            "/rest/StoreError"
        );
    }

    #[test]
    fn classification() {
        let request = AutoExtractError::RequestError {
            status: 401,
            error_type: Some(ACCOUNT_DISABLED_ERROR_TYPE.to_string()),
            message: "disabled".into(),
        };
        assert!(!request.is_retryable());
        assert!(request.is_account_disabled());

        let network = AutoExtractError::Network {
            message: "timed out".into(),
            is_timeout: true,
            is_connect: false,
        };
        assert!(network.is_retryable());
        assert!(!network.is_account_disabled());
        let throttled = AutoExtractError::ServerError {
            status: 429,
            message: String::new(),
        };
        assert!(throttled.is_retryable());
        assert!(!AutoExtractError::Cancelled.is_retryable());
    }

    #[test]
    fn converts_into_spider_errors() {
        let config: SpiderError = AutoExtractError::ConfigurationError("no key".into()).into();
        assert!(matches!(config, SpiderError::ConfigurationError(m) if m == "no key"));

        let store: SpiderError = AutoExtractError::StoreError("disk".into()).into();
        assert!(matches!(store, SpiderError::IoError(m) if m.contains("disk")));

        let request: SpiderError = AutoExtractError::RequestError {
            status: 401,
            error_type: None,
            message: "No authentication token provided".into(),
        }
        .into();
        assert!(matches!(request, SpiderError::GeneralError(m) if m.contains("status 401")));
    }
}
