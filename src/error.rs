//! Error types for the CRM router
//!
//! Every backend failure is reclassified into [`AppError`] before it reaches
//! the integration manager. Transport error types never cross that boundary.

use std::fmt;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::tiers::Tier;

/// Terminal failure of one tier inside a failover cascade
#[derive(Debug, Clone, Serialize)]
pub struct TierFailure {
    pub tier: Tier,
    pub category: &'static str,
    pub message: String,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.message)
    }
}

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Backend error on {tier}{}: {detail}", status_suffix(.status))]
    Backend {
        tier: Tier,
        status: Option<u16>,
        detail: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Circuit breaker open for tier {tier}")]
    CircuitOpen { tier: Tier },

    #[error("All tiers failed: {}", format_failures(.failures))]
    FailoverExhausted { failures: Vec<TierFailure> },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Deadline exceeded before tier {tier} could be attempted")]
    DeadlineExceeded { tier: Tier },

    #[error("Token storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

fn format_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    /// Short category label used for metrics and failure summaries
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Authentication(_) => "authentication",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Backend { status: None, .. } => "transport",
            AppError::Backend { status: Some(s), .. } if *s >= 500 => "server_error",
            AppError::Backend { .. } => "client_error",
            AppError::Configuration(_) => "configuration",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::FailoverExhausted { .. } => "failover_exhausted",
            AppError::NotFound(_) => "not_found",
            AppError::DeadlineExceeded { .. } => "deadline_exceeded",
            AppError::Storage(_) => "storage",
            AppError::Internal(_) => "internal",
        }
    }

    /// Whether the same tier may be retried after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::RateLimited { .. } => true,
            AppError::Backend { status: None, .. } => true,
            AppError::Backend { status: Some(s), .. } => *s >= 500 || *s == 408,
            _ => false,
        }
    }

    /// Whether another tier may be tried after this error
    pub fn allows_failover(&self) -> bool {
        !matches!(
            self,
            AppError::Configuration(_) | AppError::NotFound(_)
        )
    }

    /// Whether this error reflects backend health (and so should trip the breaker)
    pub fn counts_as_backend_failure(&self) -> bool {
        !matches!(
            self,
            AppError::NotFound(_)
                | AppError::Configuration(_)
                | AppError::CircuitOpen { .. }
                | AppError::DeadlineExceeded { .. }
        )
    }

    pub(crate) fn backend(tier: Tier, status: Option<u16>, detail: impl Into<String>) -> Self {
        AppError::Backend {
            tier,
            status,
            detail: detail.into(),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Storage(format!("invalid stored record: {err}"))
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error details
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Structured details so operators can see which layer failed
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<TierFailure>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, details) = match &self {
            AppError::Authentication(_) => (StatusCode::UNAUTHORIZED, "AUTHENTICATION_ERROR", None),
            AppError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                Some(ErrorDetails {
                    tier: None,
                    retry_after_seconds: retry_after.map(|d| d.as_secs()),
                    failures: vec![],
                }),
            ),
            AppError::Backend { tier, .. } => (
                StatusCode::BAD_GATEWAY,
                "BACKEND_ERROR",
                Some(ErrorDetails {
                    tier: Some(*tier),
                    retry_after_seconds: None,
                    failures: vec![],
                }),
            ),
            AppError::Configuration(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CONFIGURATION_ERROR",
                None,
            ),
            AppError::CircuitOpen { tier } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CIRCUIT_OPEN",
                Some(ErrorDetails {
                    tier: Some(*tier),
                    retry_after_seconds: None,
                    failures: vec![],
                }),
            ),
            AppError::FailoverExhausted { failures } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "FAILOVER_EXHAUSTED",
                Some(ErrorDetails {
                    tier: None,
                    retry_after_seconds: None,
                    failures: failures.clone(),
                }),
            ),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            AppError::DeadlineExceeded { tier } => (
                StatusCode::GATEWAY_TIMEOUT,
                "DEADLINE_EXCEEDED",
                Some(ErrorDetails {
                    tier: Some(*tier),
                    retry_after_seconds: None,
                    failures: vec![],
                }),
            ),
            AppError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", None),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None),
        };

        // Internal causes stay in the logs
        let message = match &self {
            AppError::Storage(_) => "Token storage error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;
