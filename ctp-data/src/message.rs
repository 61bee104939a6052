//! Message core: target-polymorphic discussion entities.
//!
//! A message addresses exactly one target; its scope is derived from
//! which target column is set. Write rules are scope-specific, deletion
//! is a soft tombstone with an audit trail, and reads are tracked per
//! viewer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use ctp_auth::{CourseRole, Principal};
use ctp_core::{context, ApiError, FieldError, PageParams};
use ctp_events::{Envelope, SharedBroker};

// ── Scope model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageScope {
    User,
    CourseMember,
    SubmissionGroup,
    CourseGroup,
    CourseContent,
    Course,
}

impl MessageScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageScope::User => "user",
            MessageScope::CourseMember => "course_member",
            MessageScope::SubmissionGroup => "submission_group",
            MessageScope::CourseGroup => "course_group",
            MessageScope::CourseContent => "course_content",
            MessageScope::Course => "course",
        }
    }
}

/// The single target of a message, as a tagged variant. Storage keeps
/// separate nullable columns for indexability; this type centralizes the
/// "exactly one set" invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTarget {
    pub scope: MessageScope,
    pub id: Uuid,
}

impl MessageTarget {
    /// WebSocket channel this target broadcasts on.
    pub fn channel(&self) -> String {
        format!("{}:{}", self.scope.as_str(), self.id)
    }
}

// ── Row and DTOs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow)]
pub struct MessageRecord {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub archived_at: Option<DateTime<Utc>>,
    pub author_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub level: i64,
    pub title: String,
    pub content: String,
    pub user_id: Option<Uuid>,
    pub course_member_id: Option<Uuid>,
    pub submission_group_id: Option<Uuid>,
    pub course_group_id: Option<Uuid>,
    pub course_content_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub properties: Json<serde_json::Value>,
}

impl MessageRecord {
    pub fn is_deleted(&self) -> bool {
        self.archived_at.is_some()
    }

    /// The single set target. `None` only for corrupt rows.
    pub fn target(&self) -> Option<MessageTarget> {
        let candidates = [
            (MessageScope::User, self.user_id),
            (MessageScope::CourseMember, self.course_member_id),
            (MessageScope::SubmissionGroup, self.submission_group_id),
            (MessageScope::CourseGroup, self.course_group_id),
            (MessageScope::CourseContent, self.course_content_id),
            (MessageScope::Course, self.course_id),
        ];
        let mut found = None;
        for (scope, id) in candidates {
            if let Some(id) = id {
                if found.is_some() {
                    return None;
                }
                found = Some(MessageTarget { scope, id });
            }
        }
        found
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MessageCreate {
    pub title: String,
    pub content: String,
    pub parent_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub course_member_id: Option<Uuid>,
    pub submission_group_id: Option<Uuid>,
    pub course_group_id: Option<Uuid>,
    pub course_content_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MessageUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
}

/// Viewer-facing projection: the row plus derived scope and read state.
#[derive(Debug, Clone, Serialize)]
pub struct MessageGet {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub author_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub level: i64,
    pub title: String,
    pub content: String,
    pub user_id: Option<Uuid>,
    pub course_member_id: Option<Uuid>,
    pub submission_group_id: Option<Uuid>,
    pub course_group_id: Option<Uuid>,
    pub course_content_id: Option<Uuid>,
    pub course_id: Option<Uuid>,
    pub properties: serde_json::Value,
    pub scope: Option<MessageScope>,
    pub is_read: bool,
}

impl MessageGet {
    fn project(record: MessageRecord, is_read: bool) -> Self {
        let scope = record.target().map(|t| t.scope);
        Self {
            id: record.id,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            archived_at: record.archived_at,
            author_id: record.author_id,
            parent_id: record.parent_id,
            level: record.level,
            title: record.title,
            content: record.content,
            user_id: record.user_id,
            course_member_id: record.course_member_id,
            submission_group_id: record.submission_group_id,
            course_group_id: record.course_group_id,
            course_content_id: record.course_content_id,
            course_id: record.course_id,
            properties: record.properties.0,
            scope,
            is_read,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MessageQuery {
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
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_match_all: bool,
    pub tag_scope: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MessageAuditEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub message_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: String,
    pub old_title: Option<String>,
    pub old_content: Option<String>,
    pub new_title: Option<String>,
    pub new_content: Option<String>,
}

// ── Title tags ───────────────────────────────────────────────────────────

/// Extract `#scope::value` tokens from a title. Tokens use the
/// `[A-Za-z0-9_-]` alphabet on both sides.
pub fn extract_tags(title: &str) -> Vec<(String, String)> {
    fn is_tag_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    }

    let mut tags = Vec::new();
    let mut rest = title;
    while let Some(pos) = rest.find('#') {
        rest = &rest[pos + 1..];
        let scope_end = rest.find(|c| !is_tag_char(c)).unwrap_or(rest.len());
        let scope = &rest[..scope_end];
        let after = &rest[scope_end..];
        if scope.is_empty() || !after.starts_with("::") {
            continue;
        }
        let value_part = &after[2..];
        let value_end = value_part.find(|c| !is_tag_char(c)).unwrap_or(value_part.len());
        let value = &value_part[..value_end];
        if !value.is_empty() {
            tags.push((scope.to_string(), value.to_string()));
        }
        rest = &value_part[value_end..];
    }
    tags
}

fn tag_like_pattern(tag: &str) -> String {
    format!("%#{tag}%")
}

fn tag_scope_like_pattern(scope: &str) -> String {
    format!("%#{scope}::%")
}

// ── Store ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
    broker: SharedBroker,
}

/// `IN (…)` clause over uuids; empty sets match nothing.
fn in_clause(ids: &[Uuid], binds: &mut Vec<Uuid>) -> String {
    if ids.is_empty() {
        return "IN (NULL)".to_string();
    }
    binds.extend_from_slice(ids);
    let marks = std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(", ");
    format!("IN ({marks})")
}

impl MessageStore {
    pub fn new(pool: SqlitePool, broker: SharedBroker) -> Self {
        Self { pool, broker }
    }

    /// Visibility predicate for one viewer; ANDed into every read.
    ///
    /// Returns `(sql, uuid_binds)`; callers append it after their own
    /// conditions. Admin short-circuits to no predicate.
    fn visibility_sql(principal: &Principal) -> (String, Vec<Uuid>) {
        if principal.is_admin {
            return ("1 = 1".to_string(), Vec::new());
        }
        let uid = principal.user_id;
        let member_courses: Vec<Uuid> =
            principal.courses_with_min_role(CourseRole::Student).into_iter().collect();
        let tutor_courses: Vec<Uuid> =
            principal.courses_with_min_role(CourseRole::Tutor).into_iter().collect();

        // Bind order mirrors the textual order of the placeholders below.
        let mut binds = vec![uid, uid];
        let member_in_a = in_clause(&member_courses, &mut binds);
        let member_in_b = in_clause(&member_courses, &mut binds);
        binds.push(uid);
        let tutor_groups = in_clause(&tutor_courses, &mut binds);
        binds.push(uid);
        let tutor_subs = in_clause(&tutor_courses, &mut binds);
        binds.push(uid);
        let tutor_members = in_clause(&tutor_courses, &mut binds);

        let sql = format!(
            "(author_id = ? OR user_id = ? \
             OR course_id {member_in_a} \
             OR course_content_id IN (SELECT id FROM course_contents WHERE course_id {member_in_b}) \
             OR course_group_id IN (SELECT course_group_id FROM course_members \
               WHERE user_id = ? AND course_group_id IS NOT NULL) \
             OR course_group_id IN (SELECT id FROM course_groups WHERE course_id {tutor_groups}) \
             OR submission_group_id IN (SELECT sgm.submission_group_id \
               FROM submission_group_members sgm \
               JOIN course_members cm ON cm.id = sgm.course_member_id WHERE cm.user_id = ?) \
             OR submission_group_id IN (SELECT sg.id FROM submission_groups sg \
               JOIN course_contents cc ON cc.id = sg.course_content_id \
               WHERE cc.course_id {tutor_subs}) \
             OR course_member_id IN (SELECT id FROM course_members WHERE user_id = ?) \
             OR course_member_id IN (SELECT id FROM course_members WHERE course_id {tutor_members}))"
        );

        (sql, binds)
    }

    async fn fetch_visible(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<MessageRecord, ApiError> {
        let (visibility, binds) = Self::visibility_sql(principal);
        let sql = format!("SELECT * FROM messages WHERE id = ? AND {visibility}");
        let mut query = sqlx::query_as::<_, MessageRecord>(&sql).bind(id);
        for bind in binds {
            query = query.bind(bind);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(ApiError::not_found)
    }

    // ── Target resolution & write rules ──────────────────────────────────

    /// Resolve the effective target: inherit from the parent when
    /// replying, default to the author's own user scope otherwise.
    async fn resolve_target(
        &self,
        principal: &Principal,
        payload: &MessageCreate,
    ) -> Result<(MessageTarget, i64, bool), ApiError> {
        let explicit = [
            payload.user_id.map(|id| MessageTarget { scope: MessageScope::User, id }),
            payload
                .course_member_id
                .map(|id| MessageTarget { scope: MessageScope::CourseMember, id }),
            payload
                .submission_group_id
                .map(|id| MessageTarget { scope: MessageScope::SubmissionGroup, id }),
            payload
                .course_group_id
                .map(|id| MessageTarget { scope: MessageScope::CourseGroup, id }),
            payload
                .course_content_id
                .map(|id| MessageTarget { scope: MessageScope::CourseContent, id }),
            payload.course_id.map(|id| MessageTarget { scope: MessageScope::Course, id }),
        ];
        let set: Vec<MessageTarget> = explicit.into_iter().flatten().collect();
        if set.len() > 1 {
            return Err(ApiError::validation(vec![FieldError::new(
                "target",
                "exactly one target field may be set",
                "invariant",
            )]));
        }

        if let Some(parent_id) = payload.parent_id {
            let parent = self.fetch_visible(principal, parent_id).await?;
            let parent_target = parent.target().ok_or_else(|| {
                ApiError::internal(format!("message {parent_id} has no valid target"))
            })?;
            if let Some(explicit) = set.first() {
                if *explicit != parent_target {
                    return Err(ApiError::validation(vec![FieldError::new(
                        "target",
                        "reply target must match the parent's target",
                        "invariant",
                    )]));
                }
            }
            return Ok((parent_target, parent.level + 1, false));
        }

        match set.into_iter().next() {
            Some(target) => Ok((target, 0, true)),
            // Zero targets: a note to self.
            None => Ok((
                MessageTarget {
                    scope: MessageScope::User,
                    id: principal.user_id,
                },
                0,
                false,
            )),
        }
    }

    /// Scope-specific create rules. Explicit targets only; inherited and
    /// defaulted targets were already authorized through the parent or
    /// are the author themselves.
    async fn check_write_rule(
        &self,
        principal: &Principal,
        target: &MessageTarget,
    ) -> Result<(), ApiError> {
        if principal.is_admin {
            return Ok(());
        }
        match target.scope {
            MessageScope::User | MessageScope::CourseMember => {
                Err(ApiError::not_implemented()
                    .with_message("Direct messages are not implemented"))
            }
            MessageScope::CourseGroup => Err(ApiError::forbidden()
                .with_message("Course group messages are read-only")),
            MessageScope::SubmissionGroup => {
                let is_member: Option<(i64,)> = sqlx::query_as(
                    "SELECT 1 FROM submission_group_members sgm \
                     JOIN course_members cm ON cm.id = sgm.course_member_id \
                     WHERE sgm.submission_group_id = ? AND cm.user_id = ?",
                )
                .bind(target.id)
                .bind(principal.user_id)
                .fetch_optional(&self.pool)
                .await?;
                if is_member.is_some() {
                    return Ok(());
                }
                let course: Option<Uuid> = sqlx::query_scalar(
                    "SELECT cc.course_id FROM submission_groups sg \
                     JOIN course_contents cc ON cc.id = sg.course_content_id WHERE sg.id = ?",
                )
                .bind(target.id)
                .fetch_optional(&self.pool)
                .await?;
                match course.and_then(|c| principal.get_highest_course_role(c)) {
                    Some(role) if role > CourseRole::Student => Ok(()),
                    _ => Err(ApiError::forbidden()),
                }
            }
            MessageScope::CourseContent => {
                let course: Option<Uuid> =
                    sqlx::query_scalar("SELECT course_id FROM course_contents WHERE id = ?")
                        .bind(target.id)
                        .fetch_optional(&self.pool)
                        .await?;
                match course.and_then(|c| principal.get_highest_course_role(c)) {
                    Some(role) if role >= CourseRole::Lecturer => Ok(()),
                    _ => Err(ApiError::forbidden()),
                }
            }
            MessageScope::Course => match principal.get_highest_course_role(target.id) {
                Some(role) if role >= CourseRole::Lecturer => Ok(()),
                _ => Err(ApiError::forbidden()),
            },
        }
    }

    // ── Operations ───────────────────────────────────────────────────────

    pub async fn create(
        &self,
        principal: &Principal,
        payload: MessageCreate,
    ) -> Result<MessageGet, ApiError> {
        if payload.title.trim().is_empty() || payload.content.is_empty() {
            let mut errors = Vec::new();
            if payload.title.trim().is_empty() {
                errors.push(FieldError::new("title", "must not be empty", "length"));
            }
            if payload.content.is_empty() {
                errors.push(FieldError::new("content", "must not be empty", "length"));
            }
            return Err(ApiError::validation(errors));
        }

        let (target, level, explicit) = self.resolve_target(principal, &payload).await?;
        if explicit {
            self.check_write_rule(principal, &target).await?;
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let actor = context::current_actor().user_id;
        sqlx::query(
            "INSERT INTO messages (id, version, created_at, updated_at, created_by, updated_by, \
             author_id, parent_id, level, title, content, user_id, course_member_id, \
             submission_group_id, course_group_id, course_content_id, course_id, properties) \
             VALUES (?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '{}')",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(actor)
        .bind(actor)
        .bind(principal.user_id)
        .bind(payload.parent_id)
        .bind(level)
        .bind(&payload.title)
        .bind(&payload.content)
        .bind((target.scope == MessageScope::User).then_some(target.id))
        .bind((target.scope == MessageScope::CourseMember).then_some(target.id))
        .bind((target.scope == MessageScope::SubmissionGroup).then_some(target.id))
        .bind((target.scope == MessageScope::CourseGroup).then_some(target.id))
        .bind((target.scope == MessageScope::CourseContent).then_some(target.id))
        .bind((target.scope == MessageScope::Course).then_some(target.id))
        .execute(&self.pool)
        .await?;

        self.audit(id, principal.user_id, "created", None, None, Some(&payload.title), Some(&payload.content))
            .await?;

        let record = self.fetch_visible(principal, id).await?;
        let projected = MessageGet::project(record, false);

        self.broker
            .publish(
                &target.channel(),
                Envelope::new(
                    "message:new",
                    target.channel(),
                    json!({ "message": projected, "message_id": id }),
                ),
            )
            .await;

        debug!(message_id = %id, scope = target.scope.as_str(), "message created");
        Ok(projected)
    }

    pub async fn get(&self, principal: &Principal, id: Uuid) -> Result<MessageGet, ApiError> {
        let record = self.fetch_visible(principal, id).await?;
        let is_read = self.is_read(id, principal.user_id).await?;
        Ok(MessageGet::project(record, is_read))
    }

    pub async fn list(
        &self,
        principal: &Principal,
        query: &MessageQuery,
        page: PageParams,
    ) -> Result<(Vec<MessageGet>, i64), ApiError> {
        let (visibility, vis_binds) = Self::visibility_sql(principal);

        let mut conditions = vec![visibility];
        enum Bind {
            Id(Uuid),
            Ts(DateTime<Utc>),
            Text(String),
        }
        let mut binds: Vec<Bind> = vis_binds.into_iter().map(Bind::Id).collect();

        let mut eq = |column: &str, value: Option<Uuid>, conditions: &mut Vec<String>, binds: &mut Vec<Bind>| {
            if let Some(value) = value {
                conditions.push(format!("{column} = ?"));
                binds.push(Bind::Id(value));
            }
        };
        eq("parent_id", query.parent_id, &mut conditions, &mut binds);
        eq("author_id", query.author_id, &mut conditions, &mut binds);
        eq("user_id", query.user_id, &mut conditions, &mut binds);
        eq("course_member_id", query.course_member_id, &mut conditions, &mut binds);
        eq("submission_group_id", query.submission_group_id, &mut conditions, &mut binds);
        eq("course_group_id", query.course_group_id, &mut conditions, &mut binds);
        eq("course_content_id", query.course_content_id, &mut conditions, &mut binds);
        eq("course_id", query.course_id, &mut conditions, &mut binds);

        if let Some(scope) = &query.scope {
            let clause = match scope.as_str() {
                "global" => Some(
                    "user_id IS NULL AND course_member_id IS NULL AND submission_group_id IS NULL \
                     AND course_group_id IS NULL AND course_content_id IS NULL AND course_id IS NULL"
                        .to_string(),
                ),
                "user" => Some("user_id IS NOT NULL".to_string()),
                "course_member" => Some("course_member_id IS NOT NULL".to_string()),
                "submission_group" => Some("submission_group_id IS NOT NULL".to_string()),
                "course_group" => Some("course_group_id IS NOT NULL".to_string()),
                "course_content" => Some("course_content_id IS NOT NULL".to_string()),
                "course" => Some("course_id IS NOT NULL".to_string()),
                // Hierarchy scopes without target columns match nothing.
                "organization" | "course_family" => Some("1 = 0".to_string()),
                _ => {
                    return Err(ApiError::validation(vec![FieldError::new(
                        "scope",
                        "unknown scope",
                        "enum",
                    )]))
                }
            };
            if let Some(clause) = clause {
                conditions.push(clause);
            }
        }

        if let Some(after) = query.created_after {
            conditions.push("created_at >= ?".to_string());
            binds.push(Bind::Ts(after));
        }
        if let Some(before) = query.created_before {
            conditions.push("created_at <= ?".to_string());
            binds.push(Bind::Ts(before));
        }

        if let Some(unread) = query.unread {
            let exists = "EXISTS (SELECT 1 FROM message_reads mr \
                          WHERE mr.message_id = messages.id AND mr.reader_user_id = ?)";
            if unread {
                conditions.push(format!("NOT {exists}"));
            } else {
                conditions.push(exists.to_string());
            }
            binds.push(Bind::Id(principal.user_id));
        }

        if !query.tags.is_empty() {
            let joiner = if query.tags_match_all { " AND " } else { " OR " };
            let parts: Vec<String> = query.tags.iter().map(|_| "title LIKE ?".to_string()).collect();
            conditions.push(format!("({})", parts.join(joiner)));
            for tag in &query.tags {
                binds.push(Bind::Text(tag_like_pattern(tag)));
            }
        }
        if let Some(tag_scope) = &query.tag_scope {
            conditions.push("title LIKE ?".to_string());
            binds.push(Bind::Text(tag_scope_like_pattern(tag_scope)));
        }

        let where_clause = conditions.join(" AND ");
        let count_sql = format!("SELECT COUNT(*) FROM messages WHERE {where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for bind in &binds {
            count_query = match bind {
                Bind::Id(v) => count_query.bind(*v),
                Bind::Ts(v) => count_query.bind(*v),
                Bind::Text(v) => count_query.bind(v.clone()),
            };
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let sql = format!(
            "SELECT * FROM messages WHERE {where_clause} ORDER BY created_at DESC LIMIT ? OFFSET ?"
        );
        let mut list_query = sqlx::query_as::<_, MessageRecord>(&sql);
        for bind in &binds {
            list_query = match bind {
                Bind::Id(v) => list_query.bind(*v),
                Bind::Ts(v) => list_query.bind(*v),
                Bind::Text(v) => list_query.bind(v.clone()),
            };
        }
        let records = list_query
            .bind(page.limit())
            .bind(page.skip())
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let is_read = self.is_read(record.id, principal.user_id).await?;
            items.push(MessageGet::project(record, is_read));
        }
        Ok((items, total))
    }

    /// Author-only update with a field-scoped audit entry.
    pub async fn update(
        &self,
        principal: &Principal,
        id: Uuid,
        payload: MessageUpdate,
    ) -> Result<MessageGet, ApiError> {
        let record = self.fetch_visible(principal, id).await?;
        if record.author_id != principal.user_id {
            return Err(ApiError::forbidden()
                .with_message("Only the author can update messages"));
        }
        if record.is_deleted() {
            return Err(ApiError::forbidden()
                .with_message("Cannot update deleted messages"));
        }

        let title_changed = payload.title.as_deref().map(|t| t != record.title).unwrap_or(false);
        let content_changed = payload
            .content
            .as_deref()
            .map(|c| c != record.content)
            .unwrap_or(false);

        if title_changed || content_changed {
            let new_title = payload.title.clone().unwrap_or_else(|| record.title.clone());
            let new_content = payload.content.clone().unwrap_or_else(|| record.content.clone());
            sqlx::query(
                "UPDATE messages SET title = ?, content = ?, version = version + 1, \
                 updated_at = ?, updated_by = ? WHERE id = ?",
            )
            .bind(&new_title)
            .bind(&new_content)
            .bind(Utc::now())
            .bind(principal.user_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

            self.audit(
                id,
                principal.user_id,
                "updated",
                title_changed.then(|| record.title.clone()).as_deref(),
                content_changed.then(|| record.content.clone()).as_deref(),
                title_changed.then_some(new_title.as_str()),
                content_changed.then_some(new_content.as_str()),
            )
            .await?;
        }

        let updated = self.get(principal, id).await?;
        if let Some(target) = record.target() {
            self.broker
                .publish(
                    &target.channel(),
                    Envelope::new(
                        "message:update",
                        target.channel(),
                        json!({ "message": updated, "message_id": id }),
                    ),
                )
                .await;
        }
        Ok(updated)
    }

    /// Soft delete: tombstone the content, keep the thread shape, audit
    /// the originals. Author or admin only; idempotent.
    pub async fn soft_delete(
        &self,
        principal: &Principal,
        id: Uuid,
        reason: &str,
    ) -> Result<MessageGet, ApiError> {
        let record = self.fetch_visible(principal, id).await?;
        let is_author = record.author_id == principal.user_id;
        if !is_author && !principal.is_admin {
            return Err(ApiError::forbidden()
                .with_message("Only the author or admin can delete messages"));
        }
        if record.is_deleted() {
            return self.get(principal, id).await;
        }

        let deleted_by = if is_author { "author" } else { "admin" };
        let now = Utc::now();
        let tombstone_title = format!("[Message deleted by {deleted_by}]");
        let tombstone_content = format!("[This message was deleted by the {deleted_by}]");
        let mut properties = record.properties.0.clone();
        if let Some(object) = properties.as_object_mut() {
            object.insert("deletion_reason".into(), json!(reason));
            object.insert("deleted_by".into(), json!(deleted_by));
            object.insert("deleted_at".into(), json!(now));
        }

        sqlx::query(
            "UPDATE messages SET archived_at = ?, title = ?, content = ?, properties = ?, \
             version = version + 1, updated_at = ?, updated_by = ? WHERE id = ?",
        )
        .bind(now)
        .bind(&tombstone_title)
        .bind(&tombstone_content)
        .bind(properties.to_string())
        .bind(now)
        .bind(principal.user_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.audit(
            id,
            principal.user_id,
            "deleted",
            Some(&record.title),
            Some(&record.content),
            Some(&tombstone_title),
            Some(&tombstone_content),
        )
        .await?;

        if let Some(target) = record.target() {
            self.broker
                .publish(
                    &target.channel(),
                    Envelope::new(
                        "message:delete",
                        target.channel(),
                        json!({ "message_id": id }),
                    ),
                )
                .await;
        }

        debug!(message_id = %id, deleted_by, "message soft-deleted");
        self.get(principal, id).await
    }

    // ── Read receipts ────────────────────────────────────────────────────

    async fn is_read(&self, message_id: Uuid, user_id: Uuid) -> Result<bool, ApiError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM message_reads WHERE message_id = ? AND reader_user_id = ?",
        )
        .bind(message_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Idempotent: marking twice leaves exactly one row.
    pub async fn mark_read(&self, principal: &Principal, id: Uuid) -> Result<(), ApiError> {
        self.fetch_visible(principal, id).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO message_reads (id, created_at, message_id, reader_user_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .bind(id)
        .bind(principal.user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes exactly the caller's read row, if present.
    pub async fn mark_unread(&self, principal: &Principal, id: Uuid) -> Result<(), ApiError> {
        self.fetch_visible(principal, id).await?;
        sqlx::query("DELETE FROM message_reads WHERE message_id = ? AND reader_user_id = ?")
            .bind(id)
            .bind(principal.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Audit history, newest first. Author or admin only.
    pub async fn audit_history(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> Result<Vec<MessageAuditEntry>, ApiError> {
        let record = self.fetch_visible(principal, id).await?;
        if record.author_id != principal.user_id && !principal.is_admin {
            return Err(ApiError::forbidden()
                .with_message("Only the message author or admin can view audit history"));
        }
        let entries = sqlx::query_as::<_, MessageAuditEntry>(
            "SELECT * FROM message_audit_logs WHERE message_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        action: &str,
        old_title: Option<&str>,
        old_content: Option<&str>,
        new_title: Option<&str>,
        new_content: Option<&str>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO message_audit_logs (id, created_at, message_id, user_id, action, \
             old_title, old_content, new_title, new_content) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .bind(message_id)
        .bind(user_id)
        .bind(action)
        .bind(old_title)
        .bind(old_content)
        .bind(new_title)
        .bind(new_content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
