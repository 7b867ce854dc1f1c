use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Failures inside the synchronization core.
///
/// None of these ever reach the caller of a mutation: deferred actions and
/// broadcasts log and drop them.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The requested room or user does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The snapshot provider could not be reached while recomputing a view.
    #[error("snapshot store unavailable: {0}")]
    Store(String),

    /// The broadcaster could not hand a message to the transport.
    #[error("delivery failed on {topic}: {reason}")]
    Delivery { topic: String, reason: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SyncError {
    pub fn room_not_found(room_id: &str) -> Self {
        Self::NotFound(format!("room {room_id}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Structured API error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND".to_string(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "UNAVAILABLE".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(what) => Self::not_found(format!("{what} not found")),
            SyncError::Store(_) => {
                tracing::warn!(%err, "snapshot store error");
                Self::unavailable("Room data is temporarily unavailable")
            }
            other => {
                tracing::error!(err = %other, "sync error");
                Self::internal("An internal error occurred")
            }
        }
    }
}
