//! Device session management for the current user.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use ctp_core::ApiError;

use crate::extract::CurrentUser;
use crate::state::AppState;

/// `GET /sessions`: the caller's active devices.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .sessions
        .list_active_for_user(user.principal().user_id)
        .await?;
    Ok(Json(sessions))
}

/// `DELETE /sessions/{sid}`: revoke one of the caller's devices.
pub async fn revoke(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(sid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let revoked = state
        .sessions
        .revoke(user.principal().user_id, &sid, "User initiated")
        .await?;
    if !revoked {
        return Err(ApiError::not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
pub struct RevokeAllParams {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub except_current: bool,
}

/// `DELETE /sessions?all=true&except_current=true`.
pub async fn revoke_all(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<RevokeAllParams>,
) -> Result<impl IntoResponse, ApiError> {
    if !params.all {
        return Err(ApiError::validation(vec![ctp_core::FieldError::new(
            "all",
            "set all=true to revoke every session",
            "missing",
        )]));
    }
    let except = if params.except_current {
        user.0.session_sid.as_deref()
    } else {
        None
    };
    let count = state
        .sessions
        .revoke_all_for_user(
            user.principal().user_id,
            "User requested logout from all devices",
            except,
        )
        .await?;
    Ok(Json(serde_json::json!({ "revoked": count })))
}
