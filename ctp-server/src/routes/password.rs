//! Password lifecycle: set, change, admin set/reset, status.
//!
//! Strength validation happens here, at set-time, never at login.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use ctp_auth::password::{is_argon2_hash, validate_password_strength};
use ctp_auth::provider::{find_user_by_id, find_user_by_username};
use ctp_auth::{Principal, User};
use ctp_core::{ApiError, FieldError};

use crate::extract::CurrentUser;
use crate::state::AppState;

fn policy_error(err: ctp_auth::PasswordPolicyError) -> ApiError {
    ApiError::new("VAL_002").with_details(vec![FieldError::new(
        "password",
        err.message,
        err.code,
    )])
}

fn validate_for(user: &User, password: &str) -> Result<(), ApiError> {
    validate_password_strength(
        password,
        Some(&user.username),
        user.email.as_deref(),
        &[],
    )
    .map_err(policy_error)
}

async fn store_hash(
    state: &AppState,
    user_id: Uuid,
    password: &str,
) -> Result<(), ApiError> {
    let hash = state.passwords.hash(password).await;
    sqlx::query(
        "UPDATE users SET password_hash = ?, password_reset_required = 0, \
         version = version + 1, updated_at = ?, updated_by = ? WHERE id = ?",
    )
    .bind(&hash)
    .bind(Utc::now())
    .bind(ctp_core::context::current_actor().user_id)
    .bind(user_id)
    .execute(&state.pool)
    .await?;
    Ok(())
}

fn require_user_manager(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_admin || principal.has_claim("user", "update") {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub password: String,
}

/// `POST /password/set`: initial set, only while no usable credential
/// exists or a reset is pending.
pub async fn set_own(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<SetPasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = find_user_by_id(&state.pool, user.principal().user_id)
        .await?
        .ok_or_else(ApiError::unauthorized)?;

    let settable = record.password_reset_required
        || record
            .password_hash
            .as_deref()
            .map(|h| !is_argon2_hash(h))
            .unwrap_or(true);
    if !settable {
        return Err(ApiError::forbidden()
            .with_message("Password already set; use the change endpoint"));
    }

    validate_for(&record, &payload.password)?;
    store_hash(&state, record.id, &payload.password).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// `POST /password/change`: verify the old credential, then replace it
/// and revoke every other device.
pub async fn change_own(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = find_user_by_id(&state.pool, user.principal().user_id)
        .await?
        .ok_or_else(ApiError::unauthorized)?;

    let stored = record.password_hash.as_deref().unwrap_or_default();
    if !state.passwords.verify(&payload.current_password, stored).await {
        return Err(ApiError::unauthorized());
    }

    validate_for(&record, &payload.new_password)?;
    store_hash(&state, record.id, &payload.new_password).await?;
    state
        .sessions
        .revoke_all_for_user(record.id, "Password changed", user.0.session_sid.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AdminSetRequest {
    pub username: String,
    pub password: String,
}

/// `POST /password/admin/set`.
pub async fn admin_set(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<AdminSetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_user_manager(user.principal())?;
    let record = find_user_by_username(&state.pool, &payload.username)
        .await?
        .ok_or_else(ApiError::not_found)?;
    validate_for(&record, &payload.password)?;
    store_hash(&state, record.id, &payload.password).await?;
    state
        .sessions
        .revoke_all_for_user(record.id, "Password set by administrator", None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AdminResetRequest {
    pub username: String,
}

/// `POST /password/admin/reset`: force a reset on next login.
pub async fn admin_reset(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<AdminResetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_user_manager(user.principal())?;
    let record = find_user_by_username(&state.pool, &payload.username)
        .await?
        .ok_or_else(ApiError::not_found)?;
    sqlx::query(
        "UPDATE users SET password_reset_required = 1, version = version + 1, \
         updated_at = ?, updated_by = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(ctp_core::context::current_actor().user_id)
    .bind(record.id)
    .execute(&state.pool)
    .await?;
    state
        .sessions
        .revoke_all_for_user(record.id, "Password reset by administrator", None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn status_body(record: &User) -> serde_json::Value {
    let hash = record.password_hash.as_deref();
    json!({
        "username": record.username,
        "has_password": hash.is_some(),
        "is_argon2": hash.map(is_argon2_hash).unwrap_or(false),
        "password_reset_required": record.password_reset_required,
    })
}

/// `GET /password/status`: the caller's own credential state.
pub async fn own_status(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let record = find_user_by_id(&state.pool, user.principal().user_id)
        .await?
        .ok_or_else(ApiError::unauthorized)?;
    Ok(Json(status_body(&record)))
}

/// `GET /password/status/{username}` (user managers only).
pub async fn status_for(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_user_manager(user.principal())?;
    let record = find_user_by_username(&state.pool, &username)
        .await?
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(status_body(&record)))
}
