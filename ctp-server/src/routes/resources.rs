//! Uniform CRUD surface: one dynamic route pair serves every descriptor
//! in the registry. Specialized surfaces (auth, sessions, messages,
//! tasks, ws) are mounted statically and take precedence.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::Value;
use uuid::Uuid;

use ctp_core::{ApiError, PageParams};
use ctp_data::{crud, descriptor, EntityDescriptor};

use crate::extract::CurrentUser;
use crate::hooks;
use crate::state::AppState;

/// Served-from-cache marker, emitted only in development mode.
const CACHE_HEADER: &str = "x-cache";

fn resolve(resource: &str) -> Result<&'static EntityDescriptor, ApiError> {
    descriptor::find(resource).ok_or_else(ApiError::not_found)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse().map_err(|_| ApiError::not_found())
}

pub async fn create(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = resolve(&resource)?;
    let guard = hooks::pre_write_guard(descriptor);
    let hook = hooks::post_create_hook(descriptor, &state);
    let body = crud::create(
        &state.crud(),
        descriptor,
        user.principal(),
        payload,
        guard.as_ref(),
        hook.as_ref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(body)))
}

pub async fn get(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = resolve(&resource)?;
    let id = parse_id(&id)?;
    let (body, from_cache) = crud::get(&state.crud(), descriptor, user.principal(), id).await?;

    let mut headers = HeaderMap::new();
    if state.debug_mode {
        let marker = if from_cache { "hit" } else { "miss" };
        headers.insert(
            HeaderName::from_static(CACHE_HEADER),
            HeaderValue::from_static(marker),
        );
    }
    Ok((headers, Json(body)))
}

pub async fn list(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    user: CurrentUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = resolve(&resource)?;
    let page = PageParams {
        skip: params.get("skip").and_then(|v| v.parse().ok()),
        limit: params.get("limit").and_then(|v| v.parse().ok()),
    };
    let (rows, total) = crud::list(&state.crud(), descriptor, user.principal(), page, &params).await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&total.to_string()) {
        headers.insert(HeaderName::from_static("x-total-count"), value);
    }
    Ok((headers, Json(rows)))
}

pub async fn update(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    user: CurrentUser,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = resolve(&resource)?;
    let id = parse_id(&id)?;
    let guard = hooks::pre_write_guard(descriptor);
    let body = crud::update(
        &state.crud(),
        descriptor,
        user.principal(),
        id,
        payload,
        guard.as_ref(),
    )
    .await?;
    Ok(Json(body))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = resolve(&resource)?;
    let id = parse_id(&id)?;
    crud::delete(&state.crud(), descriptor, user.principal(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}
