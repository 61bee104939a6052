//! HTTP-facing error type.
//!
//! Internal code paths return typed errors; this module is the single
//! place where they become wire responses. Production responses carry
//! only `{error_code, message}` (plus `details` for validation errors).
//! Debug payloads appear only when the process was started in a
//! development profile.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{header::RETRY_AFTER, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::catalog::{self, ErrorCategory};
use crate::context;

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

/// Select verbose error responses. Called once at startup from config.
pub fn set_debug_mode(enabled: bool) {
    DEBUG_MODE.store(enabled, Ordering::Relaxed);
}

fn debug_mode() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// One field-level validation failure, serialized under `details`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            kind: kind.into(),
        }
    }
}

/// An error ready to cross the HTTP boundary.
///
/// Constructed from a catalog code; the message defaults to the catalog's
/// user-safe text and may be overridden where the catalog text is too
/// generic (the override must still be production-safe).
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    message: Option<String>,
    details: Vec<FieldError>,
    /// Internal context, logged but never serialized to clients.
    internal: Option<String>,
}

impl ApiError {
    pub fn new(code: &'static str) -> Self {
        Self {
            code,
            message: None,
            details: Vec::new(),
            internal: None,
        }
    }

    /// Override the client-visible message. Must be production-safe.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach internal context for the server log.
    pub fn with_internal(mut self, detail: impl Into<String>) -> Self {
        self.internal = Some(detail.into());
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.details = details;
        self
    }

    // Shorthand constructors for the common taxonomy entries.

    pub fn unauthorized() -> Self {
        Self::new("AUTH_001")
    }

    pub fn forbidden() -> Self {
        Self::new("AUTHZ_001")
    }

    pub fn not_found() -> Self {
        Self::new("NF_001")
    }

    pub fn conflict() -> Self {
        Self::new("CONF_001")
    }

    pub fn validation(details: Vec<FieldError>) -> Self {
        Self::new("VAL_001").with_details(details)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new("SRV_001").with_internal(detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new("SRV_002").with_internal(detail)
    }

    pub fn not_implemented() -> Self {
        Self::new("NI_001")
    }

    pub fn status(&self) -> StatusCode {
        catalog::definition(self.code).http_status
    }

    pub fn category(&self) -> ErrorCategory {
        catalog::definition(self.code).category
    }

    pub fn message(&self) -> &str {
        match &self.message {
            Some(m) => m,
            None => catalog::definition(self.code).plain,
        }
    }

    pub fn details(&self) -> &[FieldError] {
        &self.details
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message())?;
        if let Some(internal) = &self.internal {
            write!(f, " ({internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ApiError::not_found(),
            sqlx::Error::PoolTimedOut => ApiError::unavailable("database pool timed out"),
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    ApiError::conflict().with_internal(db.to_string())
                } else if db.message().contains("database is locked")
                    || db.message().contains("busy")
                {
                    ApiError::unavailable(db.to_string())
                } else {
                    ApiError::internal(db.to_string())
                }
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error_code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let def = catalog::definition(self.code);
        let status = def.http_status;
        let actor = context::current_actor();

        if status.is_server_error() {
            tracing::error!(
                error_code = self.code,
                request_id = %actor.request_id,
                user_id = ?actor.user_id,
                internal = ?self.internal,
                "request failed: {}", self.message()
            );
        } else if def.category == ErrorCategory::Validation {
            tracing::info!(
                error_code = self.code,
                request_id = %actor.request_id,
                details = ?self.details,
                "validation failed"
            );
        } else {
            tracing::warn!(
                error_code = self.code,
                request_id = %actor.request_id,
                user_id = ?actor.user_id,
                "request rejected: {}", self.message()
            );
        }

        let details = if self.details.is_empty() {
            None
        } else {
            serde_json::to_value(&self.details).ok()
        };

        let debug = if debug_mode() {
            Some(serde_json::json!({
                "category": def.category.as_str(),
                "title": def.title,
                "internal": self.internal,
                "request_id": actor.request_id,
            }))
        } else {
            None
        };

        let body = ErrorBody {
            error_code: self.code,
            message: self.message(),
            details,
            debug,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = def.retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_found_serializes_code_and_message_only() {
        set_debug_mode(false);
        let resp = ApiError::not_found().into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error_code"], "NF_001");
        assert!(json.get("debug").is_none());
        assert!(json.get("details").is_none());
    }

    #[tokio::test]
    async fn validation_error_carries_field_details() {
        set_debug_mode(false);
        let err = ApiError::validation(vec![FieldError::new("title", "must not be empty", "length")]);
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["details"][0]["field"], "title");
        assert_eq!(json["details"][0]["type"], "length");
    }

    #[tokio::test]
    async fn unavailable_sets_retry_after() {
        let resp = ApiError::unavailable("pool timeout").into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get(RETRY_AFTER).unwrap(), "2");
    }

    #[tokio::test]
    async fn internal_detail_never_reaches_the_client_in_production() {
        set_debug_mode(false);
        let resp = ApiError::internal("secret detail").into_response();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("secret detail"));
    }

    #[test]
    fn message_override_wins() {
        let err = ApiError::forbidden().with_message("Only the author can update messages");
        assert_eq!(err.message(), "Only the author can update messages");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }
}
