use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Error taxonomy for the routing and booking engine.
///
/// Stage-level failures (`ToolFailure`, `Timeout`) are translated into
/// user-facing text at the pipeline boundary and never escape the router as
/// raw errors. `ContractViolation` means the pipeline was driven out of
/// order; fatal for the request, but the session stays at its last valid
/// stage.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("classification failed: {0}")]
    Classification(String),

    #[error("invalid argument for {operation}: {detail}")]
    InvalidArgument {
        operation: &'static str,
        detail: String,
    },

    #[error("{operation} failed: {reason}")]
    ToolFailure {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("pipeline contract violation: {0}")]
    ContractViolation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Timeouts follow the same stage-transition policy as tool failures but
    /// are kept distinguishable for logging.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            AgentError::ToolFailure { .. } | AgentError::Timeout { .. }
        )
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        // Anything that reaches the HTTP layer unhandled is unrecoverable:
        // one generic body, full detail in the log.
        tracing::error!(error = %self, "unhandled agent error");
        let body = serde_json::json!({ "error": "internal error" });
        (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response()
    }
}
