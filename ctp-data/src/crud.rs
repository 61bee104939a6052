//! Generic CRUD dispatcher.
//!
//! One procedure per verb, parameterized by an [`EntityDescriptor`]. The
//! dispatcher enforces permissions through the engine's query scope,
//! validates payload shapes against the column specs, reads through the
//! tagged cache, invalidates on write, and emits mutation events on the
//! bus. Absent and forbidden both answer 404 so existence never leaks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use ctp_auth::{PermissionEngine, Principal, QueryScope};
use ctp_cache::TaggedCache;
use ctp_core::{context, ApiError, FieldError, PageParams};
use ctp_events::{Envelope, SharedBroker};

use crate::descriptor::{ColKind, ColumnSpec, CourseLink, EntityDescriptor, Writable};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs after a successful insert, before the response; may spawn
/// workflows. Failures log and never roll the create back.
pub type PostCreateHook =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), ApiError>> + Send + Sync>;

/// Extra write authorization beyond the generic course-role rule
/// (e.g. the role-assignment level check on course members).
pub type PreWriteGuard = Arc<
    dyn for<'a> Fn(&'a SqlitePool, &'a Principal, Option<Uuid>, &'a Value) -> BoxFuture<'a, Result<(), ApiError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct CrudContext {
    pub pool: SqlitePool,
    pub cache: TaggedCache,
    pub policy: PermissionEngine,
    pub broker: SharedBroker,
}

// ── Value binding ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Uuid(Uuid),
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Ts(DateTime<Utc>),
    Null,
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn push_bind(query: SqliteQuery<'_>, value: BindValue) -> SqliteQuery<'_> {
    match value {
        BindValue::Uuid(v) => query.bind(v),
        BindValue::Text(v) => query.bind(v),
        BindValue::Int(v) => query.bind(v),
        BindValue::Float(v) => query.bind(v),
        BindValue::Bool(v) => query.bind(v),
        BindValue::Ts(v) => query.bind(v),
        BindValue::Null => query.bind(None::<String>),
    }
}

/// Convert one payload field to a typed bind, or a field error.
fn convert(column: &ColumnSpec, value: &Value) -> Result<BindValue, FieldError> {
    if value.is_null() {
        return Ok(BindValue::Null);
    }
    let mismatch = |expected: &str| FieldError::new(column.name, format!("expected {expected}"), "type");
    match column.kind {
        ColKind::Uuid => value
            .as_str()
            .and_then(|s| s.parse::<Uuid>().ok())
            .map(BindValue::Uuid)
            .ok_or_else(|| mismatch("uuid string")),
        ColKind::Text => value
            .as_str()
            .map(|s| BindValue::Text(s.to_string()))
            .ok_or_else(|| mismatch("string")),
        ColKind::Int => value.as_i64().map(BindValue::Int).ok_or_else(|| mismatch("integer")),
        ColKind::Float => value.as_f64().map(BindValue::Float).ok_or_else(|| mismatch("number")),
        ColKind::Bool => value.as_bool().map(BindValue::Bool).ok_or_else(|| mismatch("boolean")),
        ColKind::Json => Ok(BindValue::Text(value.to_string())),
        ColKind::Timestamp => value
            .as_str()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .map(BindValue::Ts)
            .ok_or_else(|| mismatch("RFC 3339 timestamp")),
    }
}

/// Parse a query-string filter value according to the column kind.
fn convert_filter(column: &ColumnSpec, raw: &str) -> Result<BindValue, FieldError> {
    let as_json = match column.kind {
        ColKind::Text | ColKind::Uuid | ColKind::Timestamp | ColKind::Json => Value::String(raw.to_string()),
        ColKind::Int => raw.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        ColKind::Float => raw.parse::<f64>().map(Value::from).unwrap_or(Value::Null),
        ColKind::Bool => match raw {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::Null,
        },
    };
    if as_json.is_null() {
        return Err(FieldError::new(column.name, "unparsable filter value", "type"));
    }
    convert(column, &as_json)
}

// ── Row serialization ────────────────────────────────────────────────────

fn column_to_json(row: &SqliteRow, column: &ColumnSpec) -> Value {
    match column.kind {
        ColKind::Uuid => row
            .try_get::<Option<Uuid>, _>(column.name)
            .ok()
            .flatten()
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        ColKind::Text => row
            .try_get::<Option<String>, _>(column.name)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColKind::Int => row
            .try_get::<Option<i64>, _>(column.name)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        ColKind::Float => row
            .try_get::<Option<f64>, _>(column.name)
            .ok()
            .flatten()
            .map(Value::from)
            .unwrap_or(Value::Null),
        ColKind::Bool => row
            .try_get::<Option<bool>, _>(column.name)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        ColKind::Json => row
            .try_get::<Option<String>, _>(column.name)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null),
        ColKind::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(column.name)
            .ok()
            .flatten()
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
    }
}

fn row_to_json(descriptor: &EntityDescriptor, row: &SqliteRow) -> Value {
    let mut body = Map::new();
    body.insert("id".into(), json!(row.try_get::<Uuid, _>("id").ok()));
    body.insert("version".into(), json!(row.try_get::<i64, _>("version").ok()));
    body.insert(
        "created_at".into(),
        json!(row.try_get::<DateTime<Utc>, _>("created_at").ok()),
    );
    body.insert(
        "updated_at".into(),
        json!(row.try_get::<DateTime<Utc>, _>("updated_at").ok()),
    );
    body.insert(
        "created_by".into(),
        json!(row.try_get::<Option<Uuid>, _>("created_by").ok().flatten()),
    );
    body.insert(
        "updated_by".into(),
        json!(row.try_get::<Option<Uuid>, _>("updated_by").ok().flatten()),
    );
    if descriptor.soft_delete {
        body.insert(
            "archived_at".into(),
            json!(row.try_get::<Option<DateTime<Utc>>, _>("archived_at").ok().flatten()),
        );
    }
    for column in descriptor.columns {
        if column.hidden {
            continue;
        }
        body.insert(column.name.into(), column_to_json(row, column));
    }
    Value::Object(body)
}

// ── Scope predicates ─────────────────────────────────────────────────────

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

/// SQL fragment restricting rows to the given course ids, per the
/// descriptor's reachability rule. `binds` receives the parameters in
/// order.
fn scope_sql(
    descriptor: &EntityDescriptor,
    principal: &Principal,
    course_ids: &[Uuid],
    binds: &mut Vec<BindValue>,
) -> String {
    let ids = placeholders(course_ids.len());
    let push_ids = |binds: &mut Vec<BindValue>| {
        for id in course_ids {
            binds.push(BindValue::Uuid(*id));
        }
    };
    match descriptor.course_link {
        CourseLink::OwnId => {
            push_ids(binds);
            format!("id IN ({ids})")
        }
        CourseLink::Direct(col) => {
            push_ids(binds);
            format!("{col} IN ({ids})")
        }
        CourseLink::ViaContent(col) => {
            push_ids(binds);
            format!("{col} IN (SELECT id FROM course_contents WHERE course_id IN ({ids}))")
        }
        CourseLink::ViaMember(col) => {
            push_ids(binds);
            format!("{col} IN (SELECT id FROM course_members WHERE course_id IN ({ids}))")
        }
        CourseLink::ViaGroup(col) => {
            push_ids(binds);
            format!(
                "{col} IN (SELECT sg.id FROM submission_groups sg \
                 JOIN course_contents cc ON cc.id = sg.course_content_id \
                 WHERE cc.course_id IN ({ids}))"
            )
        }
        CourseLink::ViaArtifact(col) => {
            push_ids(binds);
            format!(
                "{col} IN (SELECT sa.id FROM submission_artifacts sa \
                 JOIN submission_groups sg ON sg.id = sa.submission_group_id \
                 JOIN course_contents cc ON cc.id = sg.course_content_id \
                 WHERE cc.course_id IN ({ids}))"
            )
        }
        CourseLink::OwnedByCourses(col) => {
            push_ids(binds);
            format!("id IN (SELECT {col} FROM courses WHERE id IN ({ids}))")
        }
        CourseLink::UserVisibility => {
            binds.push(BindValue::Uuid(principal.user_id));
            if course_ids.is_empty() {
                "id = ?".to_string()
            } else {
                push_ids(binds);
                format!(
                    "(id = ? OR id IN (SELECT user_id FROM course_members WHERE course_id IN ({ids})))"
                )
            }
        }
        CourseLink::Unscoped => "1 = 0".to_string(),
    }
}

/// Resolve the course that authorizes a write against an existing or
/// incoming row, per the descriptor's reachability rule.
async fn resolve_write_course(
    pool: &SqlitePool,
    descriptor: &EntityDescriptor,
    entity_id: Option<Uuid>,
    payload_course_value: Option<Uuid>,
) -> Result<Option<Uuid>, ApiError> {
    let course = match descriptor.course_link {
        CourseLink::OwnId => entity_id,
        CourseLink::Direct(_) => payload_course_value,
        CourseLink::ViaContent(_) => match payload_course_value {
            Some(content_id) => sqlx::query_scalar::<_, Uuid>(
                "SELECT course_id FROM course_contents WHERE id = ?",
            )
            .bind(content_id)
            .fetch_optional(pool)
            .await?,
            None => None,
        },
        CourseLink::ViaMember(_) => match payload_course_value {
            Some(member_id) => sqlx::query_scalar::<_, Uuid>(
                "SELECT course_id FROM course_members WHERE id = ?",
            )
            .bind(member_id)
            .fetch_optional(pool)
            .await?,
            None => None,
        },
        CourseLink::ViaGroup(_) => match payload_course_value {
            Some(group_id) => sqlx::query_scalar::<_, Uuid>(
                "SELECT cc.course_id FROM submission_groups sg \
                 JOIN course_contents cc ON cc.id = sg.course_content_id WHERE sg.id = ?",
            )
            .bind(group_id)
            .fetch_optional(pool)
            .await?,
            None => None,
        },
        CourseLink::ViaArtifact(_) => match payload_course_value {
            Some(artifact_id) => sqlx::query_scalar::<_, Uuid>(
                "SELECT cc.course_id FROM submission_artifacts sa \
                 JOIN submission_groups sg ON sg.id = sa.submission_group_id \
                 JOIN course_contents cc ON cc.id = sg.course_content_id WHERE sa.id = ?",
            )
            .bind(artifact_id)
            .fetch_optional(pool)
            .await?,
            None => None,
        },
        CourseLink::OwnedByCourses(_) | CourseLink::UserVisibility | CourseLink::Unscoped => None,
    };
    Ok(course)
}

/// The column whose payload value anchors course resolution on writes.
fn link_column(descriptor: &EntityDescriptor) -> Option<&'static str> {
    match descriptor.course_link {
        CourseLink::Direct(col)
        | CourseLink::ViaContent(col)
        | CourseLink::ViaMember(col)
        | CourseLink::ViaGroup(col)
        | CourseLink::ViaArtifact(col) => Some(col),
        _ => None,
    }
}

async fn authorize_write(
    ctx: &CrudContext,
    descriptor: &EntityDescriptor,
    principal: &Principal,
    action: &str,
    entity_id: Option<Uuid>,
    payload: &Value,
    existing: Option<&Value>,
) -> Result<(), ApiError> {
    if principal.is_admin || principal.has_claim(descriptor.resource, action) {
        return Ok(());
    }
    // Creates have no entity to hide, so denial is a plain 403; acting on
    // an existing entity answers 404 to avoid leaking its existence.
    let denied = || {
        if action == "create" {
            ApiError::forbidden()
        } else {
            ApiError::not_found()
        }
    };

    // Users may always update their own profile row.
    if descriptor.course_link == CourseLink::UserVisibility {
        if action == "update" && entity_id == Some(principal.user_id) {
            return Ok(());
        }
        return Err(denied());
    }

    let payload_course = link_column(descriptor).and_then(|col| {
        payload
            .get(col)
            .or_else(|| existing.and_then(|e| e.get(col)))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
    });

    let course = resolve_write_course(&ctx.pool, descriptor, entity_id, payload_course).await?;
    let Some(course) = course else {
        // No course vantage: the entity is only writable with claims.
        return Err(denied());
    };

    let required = descriptor.min_role_for(action);
    match principal.get_highest_course_role(course) {
        Some(role) if role >= required => Ok(()),
        _ => Err(denied()),
    }
}

// ── Validation ───────────────────────────────────────────────────────────

fn validate_payload(
    descriptor: &EntityDescriptor,
    payload: &Value,
    creating: bool,
) -> Result<Vec<(&'static str, BindValue)>, ApiError> {
    let Some(object) = payload.as_object() else {
        return Err(ApiError::validation(vec![FieldError::new(
            "body",
            "expected a JSON object",
            "type",
        )]));
    };

    let mut values = Vec::new();
    let mut errors = Vec::new();

    for column in descriptor.columns {
        let accepted = match column.writable {
            Writable::Never => false,
            Writable::CreateOnly => creating,
            Writable::Always => true,
        };
        match object.get(column.name) {
            Some(value) if accepted => match convert(column, value) {
                Ok(BindValue::Null) if creating && column.required => {
                    errors.push(FieldError::new(column.name, "field is required", "missing"));
                }
                Ok(bind) => values.push((column.name, bind)),
                Err(err) => errors.push(err),
            },
            Some(_) => {
                errors.push(FieldError::new(column.name, "field is immutable", "immutable"));
            }
            None if creating && column.required => {
                errors.push(FieldError::new(column.name, "field is required", "missing"));
            }
            None => {}
        }
    }

    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }
    Ok(values)
}

// ── Cache helpers ────────────────────────────────────────────────────────

fn entity_cache_key(descriptor: &EntityDescriptor, id: Uuid) -> String {
    format!("{}:{id}", descriptor.resource)
}

fn entity_tags(descriptor: &EntityDescriptor, id: Uuid) -> Vec<String> {
    vec![
        format!("{}:{id}", descriptor.resource),
        format!("{}:list", descriptor.resource),
    ]
}

/// Resolve the course a fetched row belongs to, for cache authorization.
async fn row_course(
    pool: &SqlitePool,
    descriptor: &EntityDescriptor,
    body: &Value,
) -> Result<Option<Uuid>, ApiError> {
    let id = body.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok());
    let link_value = link_column(descriptor)
        .and_then(|col| body.get(col))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Uuid>().ok());
    resolve_write_course(pool, descriptor, id, link_value).await
}

// ── Verbs ────────────────────────────────────────────────────────────────

/// POST `/{resource}`.
pub async fn create(
    ctx: &CrudContext,
    descriptor: &EntityDescriptor,
    principal: &Principal,
    payload: Value,
    guard: Option<&PreWriteGuard>,
    hook: Option<&PostCreateHook>,
) -> Result<Value, ApiError> {
    let values = validate_payload(descriptor, &payload, true)?;
    authorize_write(ctx, descriptor, principal, "create", None, &payload, None).await?;
    if let Some(guard) = guard {
        guard(&ctx.pool, principal, None, &payload).await?;
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    let actor = context::current_actor().user_id;

    let mut columns = vec!["id", "version", "created_at", "updated_at", "created_by", "updated_by"];
    let mut binds = vec![
        BindValue::Uuid(id),
        BindValue::Int(1),
        BindValue::Ts(now),
        BindValue::Ts(now),
        actor.map(BindValue::Uuid).unwrap_or(BindValue::Null),
        actor.map(BindValue::Uuid).unwrap_or(BindValue::Null),
    ];
    for (name, bind) in values {
        columns.push(name);
        binds.push(bind);
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        descriptor.table,
        columns.join(", "),
        placeholders(columns.len()),
    );
    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = push_bind(query, bind);
    }
    query.execute(&ctx.pool).await?;

    let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", descriptor.table))
        .bind(id)
        .fetch_one(&ctx.pool)
        .await?;
    let body = row_to_json(descriptor, &row);

    ctx.cache.invalidate_tag(&format!("{}:list", descriptor.resource)).await;

    if let Some(hook) = hook {
        if let Err(e) = hook(body.clone()).await {
            warn!(resource = descriptor.resource, %id, error = %e, "post-create hook failed");
        }
    }

    ctx.broker
        .publish(
            &format!("{}:{id}", descriptor.resource),
            Envelope::new(
                format!("{}:created", descriptor.resource),
                format!("{}:{id}", descriptor.resource),
                body.clone(),
            ),
        )
        .await;

    debug!(resource = descriptor.resource, %id, "entity created");
    Ok(body)
}

/// GET `/{resource}/{id}`. Returns the body and whether it was served
/// from cache.
pub async fn get(
    ctx: &CrudContext,
    descriptor: &EntityDescriptor,
    principal: &Principal,
    id: Uuid,
) -> Result<(Value, bool), ApiError> {
    let key = entity_cache_key(descriptor, id);

    if let Some(cached) = ctx.cache.get(&key).await {
        if let Ok(entry) = serde_json::from_str::<Value>(&cached) {
            let course = entry
                .get("course_id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Uuid>().ok());
            let body = entry.get("body").cloned().unwrap_or(Value::Null);
            let archived = descriptor.soft_delete
                && body
                    .get("archived_at")
                    .map(|v| !v.is_null())
                    .unwrap_or(false);
            let authorized = if principal.is_admin {
                true
            } else {
                match descriptor.course_link {
                    CourseLink::UserVisibility => id == principal.user_id,
                    CourseLink::Unscoped | CourseLink::OwnedByCourses(_) => {
                        principal.has_claim(descriptor.resource, "get")
                    }
                    _ => match course {
                        Some(course) => {
                            principal
                                .get_highest_course_role(course)
                                .map(|r| r >= descriptor.min_role_for("get"))
                                .unwrap_or(false)
                        }
                        None => false,
                    },
                }
            };
            if authorized && !archived && !body.is_null() {
                return Ok((body, true));
            }
            // Fall through to the database for the authoritative answer.
        }
    }

    let scope = ctx.policy.filter(principal, descriptor.min_role_for("get")).await;
    let mut binds = vec![BindValue::Uuid(id)];
    let mut sql = format!("SELECT * FROM {} WHERE id = ?", descriptor.table);
    // Soft-deleted rows answer 404 like absent ones.
    if descriptor.soft_delete {
        sql.push_str(" AND archived_at IS NULL");
    }

    let unrestricted = matches!(scope, QueryScope::Unrestricted)
        || principal.has_claim(descriptor.resource, "get")
        || principal.has_claim(descriptor.resource, "list");
    if !unrestricted {
        let course_ids: Vec<Uuid> = match &scope {
            QueryScope::CourseIds(ids) => ids.iter().copied().collect(),
            _ => Vec::new(),
        };
        if course_ids.is_empty()
            && !matches!(descriptor.course_link, CourseLink::UserVisibility)
        {
            return Err(ApiError::not_found());
        }
        let predicate = scope_sql(descriptor, principal, &course_ids, &mut binds);
        sql.push_str(&format!(" AND {predicate}"));
    }

    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = push_bind(query, bind);
    }
    let row = query
        .fetch_optional(&ctx.pool)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let body = row_to_json(descriptor, &row);

    let course = row_course(&ctx.pool, descriptor, &body).await?;
    let entry = json!({ "course_id": course, "body": body });
    ctx.cache
        .set(&key, entry.to_string(), descriptor.cache_ttl, &entity_tags(descriptor, id))
        .await;

    Ok((body, false))
}

/// GET `/{resource}`: permission predicate ∧ caller filters, paged.
pub async fn list(
    ctx: &CrudContext,
    descriptor: &EntityDescriptor,
    principal: &Principal,
    page: PageParams,
    filters: &HashMap<String, String>,
) -> Result<(Vec<Value>, i64), ApiError> {
    let mut predicates = Vec::new();
    let mut binds = Vec::new();

    if descriptor.soft_delete {
        predicates.push("archived_at IS NULL".to_string());
    }

    let scope = ctx.policy.filter(principal, descriptor.min_role_for("list")).await;
    let claimed = principal.has_claim(descriptor.resource, "list");
    match (&scope, claimed) {
        (QueryScope::Unrestricted, _) | (_, true) => {}
        (QueryScope::Forbidden, false) => {
            // Users still see themselves with no course vantage at all.
            if descriptor.course_link == CourseLink::UserVisibility {
                predicates.push("id = ?".to_string());
                binds.push(BindValue::Uuid(principal.user_id));
            } else {
                return Err(ApiError::forbidden());
            }
        }
        (QueryScope::CourseIds(ids), false) => {
            let course_ids: Vec<Uuid> = ids.iter().copied().collect();
            predicates.push(scope_sql(descriptor, principal, &course_ids, &mut binds));
        }
    }

    // Caller filters compose by AND; they can only narrow the scope.
    let mut errors = Vec::new();
    for (name, raw) in filters {
        let Some(column) = descriptor.column(name) else {
            continue;
        };
        if !column.filterable {
            continue;
        }
        match convert_filter(column, raw) {
            Ok(bind) => {
                predicates.push(format!("{} = ?", column.name));
                binds.push(bind);
            }
            Err(err) => errors.push(err),
        }
    }
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM {}{}", descriptor.table, where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for bind in binds.clone() {
        count_query = match bind {
            BindValue::Uuid(v) => count_query.bind(v),
            BindValue::Text(v) => count_query.bind(v),
            BindValue::Int(v) => count_query.bind(v),
            BindValue::Float(v) => count_query.bind(v),
            BindValue::Bool(v) => count_query.bind(v),
            BindValue::Ts(v) => count_query.bind(v),
            BindValue::Null => count_query.bind(None::<String>),
        };
    }
    let total = count_query.fetch_one(&ctx.pool).await?;

    let sql = format!(
        "SELECT * FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
        descriptor.table, where_clause, descriptor.default_order,
    );
    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = push_bind(query, bind);
    }
    query = query.bind(page.limit()).bind(page.skip());
    let rows = query.fetch_all(&ctx.pool).await?;

    let bodies = rows.iter().map(|row| row_to_json(descriptor, row)).collect();
    Ok((bodies, total))
}

/// PATCH `/{resource}/{id}`.
pub async fn update(
    ctx: &CrudContext,
    descriptor: &EntityDescriptor,
    principal: &Principal,
    id: Uuid,
    payload: Value,
    guard: Option<&PreWriteGuard>,
) -> Result<Value, ApiError> {
    // Visibility first: an entity the caller cannot see, including a
    // soft-deleted one, stays a 404.
    let (existing, _) = get(ctx, descriptor, principal, id).await?;

    let values = validate_payload(descriptor, &payload, false)?;
    authorize_write(ctx, descriptor, principal, "update", Some(id), &payload, Some(&existing)).await?;
    if let Some(guard) = guard {
        guard(&ctx.pool, principal, Some(id), &payload).await?;
    }

    if values.is_empty() {
        return Ok(existing);
    }

    let actor = context::current_actor().user_id;
    let mut sets = vec![
        "version = version + 1".to_string(),
        "updated_at = ?".to_string(),
        "updated_by = ?".to_string(),
    ];
    let mut binds = vec![
        BindValue::Ts(Utc::now()),
        actor.map(BindValue::Uuid).unwrap_or(BindValue::Null),
    ];
    for (name, bind) in values {
        sets.push(format!("{name} = ?"));
        binds.push(bind);
    }
    binds.push(BindValue::Uuid(id));

    let sql = format!("UPDATE {} SET {} WHERE id = ?", descriptor.table, sets.join(", "));
    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = push_bind(query, bind);
    }
    query.execute(&ctx.pool).await?;

    ctx.cache.invalidate_tags(&entity_tags(descriptor, id)).await;

    let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = ?", descriptor.table))
        .bind(id)
        .fetch_one(&ctx.pool)
        .await?;
    let body = row_to_json(descriptor, &row);

    ctx.broker
        .publish(
            &format!("{}:{id}", descriptor.resource),
            Envelope::new(
                format!("{}:updated", descriptor.resource),
                format!("{}:{id}", descriptor.resource),
                body.clone(),
            ),
        )
        .await;

    debug!(resource = descriptor.resource, %id, "entity updated");
    Ok(body)
}

/// DELETE `/{resource}/{id}`: soft where supported, hard otherwise.
pub async fn delete(
    ctx: &CrudContext,
    descriptor: &EntityDescriptor,
    principal: &Principal,
    id: Uuid,
) -> Result<(), ApiError> {
    let (existing, _) = get(ctx, descriptor, principal, id).await?;
    authorize_write(ctx, descriptor, principal, "delete", Some(id), &Value::Null, Some(&existing))
        .await?;

    if descriptor.soft_delete {
        sqlx::query(&format!(
            "UPDATE {} SET archived_at = ?, version = version + 1, updated_at = ?, updated_by = ? \
             WHERE id = ? AND archived_at IS NULL",
            descriptor.table
        ))
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(context::current_actor().user_id)
        .bind(id)
        .execute(&ctx.pool)
        .await?;
    } else {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", descriptor.table))
            .bind(id)
            .execute(&ctx.pool)
            .await?;
    }

    ctx.cache.invalidate_tags(&entity_tags(descriptor, id)).await;

    ctx.broker
        .publish(
            &format!("{}:{id}", descriptor.resource),
            Envelope::new(
                format!("{}:deleted", descriptor.resource),
                format!("{}:{id}", descriptor.resource),
                json!({ "id": id }),
            ),
        )
        .await;

    debug!(resource = descriptor.resource, %id, "entity deleted");
    Ok(())
}
