//! Message surface: CRUD plus read receipts and the audit trail.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use ctp_core::{ApiError, PageParams};
use ctp_data::message::{MessageCreate, MessageQuery, MessageUpdate};

use crate::extract::CurrentUser;
use crate::state::AppState;

/// Query-string shape; `tags` arrives comma separated because repeated
/// keys do not survive the flat deserializer.
#[derive(Debug, Deserialize, Default)]
pub struct MessageListParams {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub parent_id: Option<Uuid>,
    pub author_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub course_member_id: Option<Uuid>,
    pub submission_group_id: Option<Uuid>,
    pub course_group_id: Option<Uuid>,
    pub course_content_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub scope: Option<String>,
    pub unread: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub tags: Option<String>,
    #[serde(default)]
    pub tags_match_all: bool,
    pub tag_scope: Option<String>,
}

impl MessageListParams {
    fn page(&self) -> PageParams {
        PageParams {
            skip: self.skip,
            limit: self.limit,
        }
    }

    fn query(self) -> MessageQuery {
        MessageQuery {
            parent_id: self.parent_id,
            author_id: self.author_id,
            user_id: self.user_id,
            course_member_id: self.course_member_id,
            submission_group_id: self.submission_group_id,
            course_group_id: self.course_group_id,
            course_content_id: self.course_content_id,
            course_id: self.course_id,
            scope: self.scope,
            unread: self.unread,
            created_after: self.created_after,
            created_before: self.created_before,
            tags: self
                .tags
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            tags_match_all: self.tags_match_all,
            tag_scope: self.tag_scope,
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<MessageCreate>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.messages.create(user.principal(), payload).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.messages.get(user.principal(), id).await?;
    Ok(Json(message))
}

pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(params): Query<MessageListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = params.page();
    let query = params.query();
    let (items, total) = state.messages.list(user.principal(), &query, page).await?;

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&total.to_string()) {
        headers.insert(HeaderName::from_static("x-total-count"), value);
    }
    Ok((headers, Json(items)))
}

pub async fn update(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<MessageUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.messages.update(user.principal(), id, payload).await?;
    Ok(Json(message))
}

pub async fn delete(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .messages
        .soft_delete(user.principal(), id, "user_request")
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.messages.mark_read(user.principal(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_unread(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.messages.mark_unread(user.principal(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn audit(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state.messages.audit_history(user.principal(), id).await?;
    Ok(Json(entries))
}
