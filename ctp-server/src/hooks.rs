//! Per-resource dispatcher hooks: extra write guards and post-create
//! side effects.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use ctp_auth::{CourseRole, Principal};
use ctp_core::{context, ApiError};
use ctp_data::{EntityDescriptor, PostCreateHook, PreWriteGuard};
use ctp_tasks::engine::TaskSubmission;
use ctp_tasks::tracker::TaskTags;

use crate::state::AppState;

fn payload_uuid(payload: &Value, field: &str) -> Option<Uuid> {
    payload.get(field).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

/// Role-assignment rule: an actor hands out at most their own level, and
/// only to members currently below them.
async fn check_role_assignment(
    pool: &sqlx::SqlitePool,
    principal: &Principal,
    entity_id: Option<Uuid>,
    payload: &Value,
) -> Result<(), ApiError> {
    let Some(raw_role) = payload.get("course_role_id").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(target_role) = CourseRole::parse(raw_role) else {
        return Err(ApiError::validation(vec![ctp_core::FieldError::new(
            "course_role_id",
            "unknown course role",
            "enum",
        )]));
    };

    let (course, current) = match entity_id {
        Some(id) => {
            let row: Option<(Uuid, String)> =
                sqlx::query_as("SELECT course_id, course_role_id FROM course_members WHERE id = ?")
                    .bind(id)
                    .fetch_optional(pool)
                    .await?;
            let (course, current) = row.ok_or_else(ApiError::not_found)?;
            (course, CourseRole::parse(&current))
        }
        None => {
            let course = payload_uuid(payload, "course_id").ok_or_else(|| {
                ApiError::validation(vec![ctp_core::FieldError::new(
                    "course_id",
                    "field is required",
                    "missing",
                )])
            })?;
            (course, None)
        }
    };

    if principal.can_assign_role(course, target_role, current) {
        Ok(())
    } else {
        Err(ApiError::forbidden()
            .with_message("You cannot assign a role at or above your own level"))
    }
}

/// Group-size invariant: at most `max_group_size` members, and a member
/// joins at most one group per assignment.
async fn check_group_membership(
    pool: &sqlx::SqlitePool,
    _principal: &Principal,
    entity_id: Option<Uuid>,
    payload: &Value,
) -> Result<(), ApiError> {
    if entity_id.is_some() {
        return Ok(());
    }
    let Some(group) = payload_uuid(payload, "submission_group_id") else {
        return Ok(());
    };
    let Some(member) = payload_uuid(payload, "course_member_id") else {
        return Ok(());
    };

    let group_row: Option<(Uuid, i64)> = sqlx::query_as(
        "SELECT course_content_id, max_group_size FROM submission_groups WHERE id = ?",
    )
    .bind(group)
    .fetch_optional(pool)
    .await?;
    let (content, max_group_size) = group_row.ok_or_else(ApiError::not_found)?;

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM submission_group_members WHERE submission_group_id = ?",
    )
    .bind(group)
    .fetch_one(pool)
    .await?;
    if count >= max_group_size {
        return Err(ApiError::conflict().with_message("Submission group is full"));
    }

    let (elsewhere,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM submission_group_members sgm \
         JOIN submission_groups sg ON sg.id = sgm.submission_group_id \
         WHERE sgm.course_member_id = ? AND sg.course_content_id = ?",
    )
    .bind(member)
    .bind(content)
    .fetch_one(pool)
    .await?;
    if elsewhere > 0 {
        return Err(ApiError::conflict()
            .with_message("Member already belongs to a group for this assignment"));
    }

    Ok(())
}

type GuardFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ApiError>> + Send + 'a>>;

fn role_assignment_guard<'a>(
    pool: &'a sqlx::SqlitePool,
    principal: &'a Principal,
    entity_id: Option<Uuid>,
    payload: &'a Value,
) -> GuardFuture<'a> {
    Box::pin(check_role_assignment(pool, principal, entity_id, payload))
}

fn group_membership_guard<'a>(
    pool: &'a sqlx::SqlitePool,
    principal: &'a Principal,
    entity_id: Option<Uuid>,
    payload: &'a Value,
) -> GuardFuture<'a> {
    Box::pin(check_group_membership(pool, principal, entity_id, payload))
}

/// Resolve the guard for a resource, if any.
pub fn pre_write_guard(descriptor: &EntityDescriptor) -> Option<PreWriteGuard> {
    match descriptor.resource {
        "course-members" => Some(Arc::new(role_assignment_guard)),
        "submission-group-members" => Some(Arc::new(group_membership_guard)),
        _ => None,
    }
}

/// Post-create side effects. Submitted artifacts kick off a testing
/// workflow tagged so the uploader and their lecturers can watch it.
pub fn post_create_hook(descriptor: &EntityDescriptor, state: &AppState) -> Option<PostCreateHook> {
    if descriptor.resource != "submissions" {
        return None;
    }
    let state = state.clone();
    Some(Arc::new(move |body: Value| {
        let state = state.clone();
        Box::pin(async move {
            if body.get("submit").and_then(|v| v.as_bool()) != Some(true) {
                return Ok(());
            }
            let Some(artifact_id) = body.get("id").and_then(|v| v.as_str()) else {
                return Ok(());
            };
            let group = body
                .get("submission_group_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());

            let course: Option<Uuid> = match group {
                Some(group) => {
                    sqlx::query_scalar(
                        "SELECT cc.course_id FROM submission_groups sg \
                         JOIN course_contents cc ON cc.id = sg.course_content_id WHERE sg.id = ?",
                    )
                    .bind(group)
                    .fetch_optional(&state.pool)
                    .await?
                }
                None => None,
            };

            let actor = context::current_actor().user_id.unwrap_or_default();
            let workflow_id = state
                .tracker
                .submit_and_track(
                    TaskSubmission {
                        task_name: "submission-testing".to_string(),
                        parameters: serde_json::json!({ "artifact_id": artifact_id }),
                        queue: "testing".to_string(),
                        workflow_id: None,
                    },
                    actor,
                    TaskTags {
                        course_id: course,
                        entity_type: Some("submission_artifact".to_string()),
                        entity_id: Some(artifact_id.to_string()),
                        description: Some("Automated tests for submitted artifact".to_string()),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = workflow_id {
                warn!(artifact_id, error = %e, "failed to enqueue testing workflow");
            }
            Ok(())
        })
    }))
}
