//! Login, refresh, logout, and provider discovery.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use ctp_auth::Credentials;
use ctp_core::ApiError;

use crate::extract::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
    pub token_type: &'static str,
    pub expires_at: Option<DateTime<Utc>>,
}

/// `POST /auth/login`.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let auth = state
        .auth
        .authenticate(&Credentials::Basic {
            username: payload.username,
            password: payload.password,
        })
        .await?;

    let sid = Uuid::new_v4().to_string();
    let (session, tokens) = state
        .sessions
        .create(auth.principal.user_id, &sid, None, None)
        .await?;

    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        session_id: session.sid,
        token_type: "bearer",
        expires_at: session.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `POST /auth/refresh`: rotate the pair; a replayed token answers 401.
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let (session, tokens) = state.sessions.refresh(&payload.refresh_token, None).await?;
    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        session_id: session.sid,
        token_type: "bearer",
        expires_at: session.expires_at,
    }))
}

/// `POST /auth/logout`: end the current device session.
pub async fn logout(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(sid) = &user.0.session_sid {
        state
            .sessions
            .end(user.principal().user_id, sid, Some("logout"))
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /auth/providers`.
pub async fn providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "local": true,
        "sso": state.sso_providers,
    }))
}
