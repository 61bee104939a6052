//! Task surface over the workflow gateway and the tracker.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use ctp_core::ApiError;
use ctp_tasks::engine::{TaskState, TaskSubmission};
use ctp_tasks::tracker::TaskTags;

use crate::extract::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct TaskListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub status: Option<String>,
}

/// `GET /tasks`: tracker-filtered listing, newest first.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<TaskListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(TaskState::parse(raw).ok_or_else(|| {
            ApiError::validation(vec![ctp_core::FieldError::new(
                "status",
                "unknown task state",
                "enum",
            )])
        })?),
        None => None,
    };

    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);

    // Over-fetch when filtering by state; the tracker does not know the
    // engine-side status.
    let entries = state
        .tracker
        .list_accessible(user.principal(), usize::MAX, 0)
        .await;

    let mut items = Vec::new();
    for entry in entries {
        let info = state.tracker.engine().status(&entry.workflow_id).await?;
        if let Some(wanted) = status {
            if info.as_ref().map(|i| i.state) != Some(wanted) {
                continue;
            }
        }
        items.push(json!({ "entry": entry, "info": info }));
    }
    let total = items.len();
    let page: Vec<_> = items.into_iter().skip(offset).take(limit).collect();
    Ok(Json(json!({ "tasks": page, "total": total })))
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub submission: TaskSubmission,
    pub user_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub description: Option<String>,
}

/// `POST /tasks/submit` (admin only).
pub async fn submit(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !user.principal().is_admin {
        return Err(ApiError::forbidden());
    }
    let workflow_id = state
        .tracker
        .submit_and_track(
            payload.submission,
            user.principal().user_id,
            TaskTags {
                user_id: payload.user_id,
                course_id: payload.course_id,
                organization_id: payload.organization_id,
                entity_type: payload.entity_type,
                entity_id: payload.entity_id,
                description: payload.description,
            },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "workflow_id": workflow_id }))))
}

async fn require_access(
    state: &AppState,
    user: &CurrentUser,
    workflow_id: &str,
) -> Result<(), ApiError> {
    if state.tracker.can_access(workflow_id, user.principal()).await {
        Ok(())
    } else {
        Err(ApiError::not_found())
    }
}

/// `GET /tasks/{id}`: tracker entry plus engine status.
pub async fn get(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_access(&state, &user, &id).await?;
    let entry = state.tracker.get_entry(&id).await.ok_or_else(ApiError::not_found)?;
    let info = state.tracker.engine().status(&id).await?;
    Ok(Json(json!({ "entry": entry, "info": info })))
}

/// `GET /tasks/{id}/status`.
pub async fn status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_access(&state, &user, &id).await?;
    let info = state
        .tracker
        .engine()
        .status(&id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(info))
}

/// `GET /tasks/{id}/result`.
pub async fn result(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_access(&state, &user, &id).await?;
    let result = state
        .tracker
        .engine()
        .result(&id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(result))
}

/// `DELETE /tasks/{id}/cancel`. The tracker entry stays for audit until
/// its TTL.
pub async fn cancel(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_access(&state, &user, &id).await?;
    let cancelled = state.tracker.engine().cancel(&id).await?;
    Ok(Json(json!({ "cancelled": cancelled })))
}
