use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fusion_core::error::CoreError;
use fusion_engine::EngineError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`EngineError`] and [`CoreError`] and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// An error from the dream manager.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A domain-level error from `fusion_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

/// Status, machine-readable code, message, and optional per-problem details.
type Classified = (StatusCode, &'static str, String, Option<Vec<String>>);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            AppError::Engine(engine) => classify_engine_error(engine),
            AppError::Core(core) => classify_core_error(core),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg, None),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let mut body = json!({
            "error": message,
            "code": code,
        });
        if let Some(details) = details {
            body["details"] = json!(details);
        }

        (status, axum::Json(body)).into_response()
    }
}

fn classify_engine_error(err: EngineError) -> Classified {
    match err {
        EngineError::Validation(problems) => (
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            problems.join("; "),
            Some(problems),
        ),
        EngineError::InvalidSettings(problems) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "INVALID_SETTINGS",
            problems.join("; "),
            Some(problems),
        ),
        EngineError::DreamNotFound(id) => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Dream with id {id} not found"),
            None,
        ),
        EngineError::Core(core) => classify_core_error(core),
        other => {
            tracing::error!(error = %other, "Engine error");
            internal()
        }
    }
}

fn classify_core_error(err: CoreError) -> Classified {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
            None,
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg, None),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            internal()
        }
    }
}

fn internal() -> Classified {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
        None,
    )
}
