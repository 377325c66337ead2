// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::meeting::MeetingStatus;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("User is already in the meeting")]
    AlreadyMember,

    #[error("Illegal meeting transition: cannot {action} while {status:?}")]
    IllegalTransition {
        action: &'static str,
        status: MeetingStatus,
    },

    #[error("Meeting code collision")]
    DuplicateCode,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::Unauthorized(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyMember | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::IllegalTransition { .. } | AppError::DuplicateCode => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated(_) => "AUTH_001",
            AppError::Unauthorized(_) => "AUTH_002",
            AppError::NotFound(_) => "NF_001",
            AppError::AlreadyMember => "MEMBER_001",
            AppError::IllegalTransition { .. } => "MEETING_001",
            AppError::DuplicateCode => "MEETING_002",
            AppError::InvalidInput(_) => "VAL_001",
            AppError::Internal(_) => "INT_001",
            AppError::Store(_) => "STORE_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Unauthenticated(_) => "Authentication failed".to_string(),
            AppError::Unauthorized(_) => "You do not have permission".to_string(),
            AppError::NotFound(_) => "Resource not found".to_string(),
            AppError::AlreadyMember => "User is already in the meeting".to_string(),
            AppError::IllegalTransition { .. } => {
                "Meeting is not in a state that allows this action".to_string()
            },
            AppError::DuplicateCode => "Meeting code already in use".to_string(),
            AppError::InvalidInput(_) => "Invalid input provided".to_string(),
            AppError::Internal(_) | AppError::Store(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// True for domain errors, false for infrastructure failures. The
    /// relay answers domain errors inline; infrastructure failures are
    /// logged and reported as an uncategorized error.
    pub fn is_domain(&self) -> bool {
        !matches!(self, AppError::Internal(_) | AppError::Store(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Failed to send message".to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        // Every cryptographic or parse failure surfaces as the same
        // Unauthenticated error; the cause stays in the log only.
        AppError::Unauthenticated(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_app_error_display() {
        let auth_error = AppError::Unauthenticated("bad signature".to_string());
        assert_eq!(auth_error.to_string(), "Unauthenticated: bad signature");

        let transition = AppError::IllegalTransition {
            action: "end",
            status: MeetingStatus::Scheduled,
        };
        assert!(transition.to_string().contains("end"));
        assert!(transition.to_string().contains("Scheduled"));
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::Unauthenticated("x".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Unauthorized("x".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::NotFound("meeting".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::AlreadyMember.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::IllegalTransition {
                action: "start",
                status: MeetingStatus::Ended,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Internal("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_app_error_error_codes() {
        assert_eq!(
            AppError::Unauthenticated("x".to_string()).error_code(),
            "AUTH_001"
        );
        assert_eq!(AppError::AlreadyMember.error_code(), "MEMBER_001");
        assert_eq!(
            AppError::NotFound("x".to_string()).error_code(),
            "NF_001"
        );
        assert_eq!(AppError::Store("down".to_string()).error_code(), "STORE_001");
    }

    #[test]
    fn test_domain_vs_infrastructure() {
        assert!(AppError::AlreadyMember.is_domain());
        assert!(AppError::NotFound("x".to_string()).is_domain());
        assert!(!AppError::Store("connection refused".to_string()).is_domain());
        assert!(!AppError::Internal("x".to_string()).is_domain());
    }

    #[test]
    fn test_app_error_into_response() {
        let error = AppError::NotFound("Meeting not found".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response_headers = response.headers();
        assert!(response_headers
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/json"));
    }

    #[test]
    fn test_jwt_error_maps_to_unauthenticated() {
        let jwt_err = jsonwebtoken::decode::<serde_json::Value>(
            "not-a-token",
            &jsonwebtoken::DecodingKey::from_secret(b"k"),
            &jsonwebtoken::Validation::default(),
        )
        .unwrap_err();
        let app_err: AppError = jwt_err.into();
        assert!(matches!(app_err, AppError::Unauthenticated(_)));
    }
}
