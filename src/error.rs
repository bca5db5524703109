// src/error.rs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// JSON body returned for every error the proxy produces itself.
/// Upstream error responses are relayed verbatim and never pass through here.
#[derive(Serialize, Debug)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

/// Application-level errors for the rotating proxy.
///
/// Implements `IntoResponse` so handlers can bubble failures with `?` and
/// still produce the documented `{"error": ..., "hint": ...}` JSON shape.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParsing(#[from] serde_yaml::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Upstream HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Axum error: {0}")]
    Axum(#[from] axum::Error),

    #[error("HTTP builder error: {0}")]
    Http(#[from] http::Error),

    #[error("Unauthorized proxy access")]
    Unauthorized,

    #[error("Proxy rate limit exceeded")]
    GlobalRateLimited,

    #[error("Per-key rate limit exceeded")]
    KeyRateLimited,

    #[error("No eligible API keys")]
    NoEligibleKeys,

    #[error("Upstream request failed: {0}")]
    UpstreamTransport(String),

    #[error("State schema version {found} is newer than supported version {supported}")]
    StateSchemaTooNew { found: u32, supported: u32 },

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Remediation text for a fully unavailable key pool. Shown to the client
/// alongside the 503 so operators can act without reading proxy logs.
pub fn remediation_message() -> String {
    [
        "All keys are unavailable.",
        "Next steps:",
        "- Check the auth directory for valid API key entries",
        "- Verify quotas via /usages",
        "- Wait for cooldown if keys were rate-limited",
        "- Disable auto-rotation if prohibited by your provider",
    ]
    .join("\n")
}

impl AppError {
    fn to_status_and_body(&self) -> (StatusCode, ErrorBody) {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    error: "Unauthorized proxy access".to_string(),
                    hint: Some(
                        "Send Authorization: Bearer <token> or the X-KMI-Proxy-Token header."
                            .to_string(),
                    ),
                },
            ),
            Self::GlobalRateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    error: "Proxy rate limit exceeded".to_string(),
                    hint: None,
                },
            ),
            Self::KeyRateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody {
                    error: "Per-key rate limit exceeded".to_string(),
                    hint: None,
                },
            ),
            Self::NoEligibleKeys => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody {
                    error: remediation_message(),
                    hint: None,
                },
            ),
            Self::UpstreamTransport(detail) => {
                error!(error = %detail, "Upstream request failed after retries");
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorBody {
                        error: "Upstream request failed".to_string(),
                        hint: Some("Check connectivity or upstream status.".to_string()),
                    },
                )
            }
            Self::Config(msg) => {
                error!(error = %msg, "Configuration error surfaced to a request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Internal server configuration error".to_string(),
                        hint: None,
                    },
                )
            }
            other => {
                error!(error = %other, "Internal error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody {
                        error: "Internal server error".to_string(),
                        hint: None,
                    },
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = self.to_status_and_body();
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
