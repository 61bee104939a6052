//! Shared fixtures: schema-bootstrapped database plus hierarchy seeding.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use ctp_auth::{PermissionEngine, Principal};
use ctp_cache::{InMemoryKv, TaggedCache};
use ctp_data::crud::CrudContext;
use ctp_data::schema;
use ctp_events::InMemoryBroker;

pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    schema::bootstrap(&pool).await.expect("schema");
    schema::seed_roles(&pool).await.expect("roles");
    pool
}

pub fn crud_ctx(pool: SqlitePool) -> CrudContext {
    CrudContext {
        pool,
        cache: TaggedCache::new(Arc::new(InMemoryKv::new())),
        policy: PermissionEngine::new(Arc::new(InMemoryKv::new())),
        broker: Arc::new(InMemoryBroker::new()),
    }
}

pub async fn insert_user(pool: &SqlitePool, username: &str) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO users (id, version, created_at, updated_at, username) VALUES (?, 1, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(username)
    .execute(pool)
    .await
    .expect("insert user");
    id
}

/// One organization + family + course, returning `(org, family, course)`.
pub async fn seed_course(pool: &SqlitePool, slug: &str) -> (Uuid, Uuid, Uuid) {
    let now = Utc::now();
    let org = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO organizations (id, version, created_at, updated_at, title, slug) \
         VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(org)
    .bind(now)
    .bind(now)
    .bind(format!("{slug} org"))
    .bind(format!("{slug}-org"))
    .execute(pool)
    .await
    .expect("insert org");

    let family = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO course_families (id, version, created_at, updated_at, title, slug, organization_id) \
         VALUES (?, 1, ?, ?, ?, ?, ?)",
    )
    .bind(family)
    .bind(now)
    .bind(now)
    .bind(format!("{slug} family"))
    .bind(format!("{slug}-family"))
    .bind(org)
    .execute(pool)
    .await
    .expect("insert family");

    let course = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO courses (id, version, created_at, updated_at, title, slug, course_family_id, organization_id) \
         VALUES (?, 1, ?, ?, ?, ?, ?, ?)",
    )
    .bind(course)
    .bind(now)
    .bind(now)
    .bind(format!("{slug} course"))
    .bind(slug)
    .bind(family)
    .bind(org)
    .execute(pool)
    .await
    .expect("insert course");

    (org, family, course)
}

/// Enroll a user; returns the course member id.
pub async fn enroll(pool: &SqlitePool, user: Uuid, course: Uuid, role: &str) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO course_members (id, version, created_at, updated_at, user_id, course_id, course_role_id) \
         VALUES (?, 1, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(user)
    .bind(course)
    .bind(role)
    .execute(pool)
    .await
    .expect("enroll");
    id
}

pub async fn seed_content(pool: &SqlitePool, course: Uuid, path: &str) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO course_contents (id, version, created_at, updated_at, title, course_id, path) \
         VALUES (?, 1, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(format!("content {path}"))
    .bind(course)
    .bind(path)
    .execute(pool)
    .await
    .expect("insert content");
    id
}

pub async fn seed_submission_group(pool: &SqlitePool, content: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO submission_groups (id, version, created_at, updated_at, course_content_id) \
         VALUES (?, 1, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(content)
    .execute(pool)
    .await
    .expect("insert submission group");
    id
}

pub async fn add_group_member(pool: &SqlitePool, group: Uuid, course_member: Uuid) {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO submission_group_members (id, version, created_at, updated_at, \
         submission_group_id, course_member_id) VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(now)
    .bind(now)
    .bind(group)
    .bind(course_member)
    .execute(pool)
    .await
    .expect("insert group member");
}

pub async fn seed_course_group(pool: &SqlitePool, course: Uuid, title: &str) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO course_groups (id, version, created_at, updated_at, title, course_id) \
         VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(title)
    .bind(course)
    .execute(pool)
    .await
    .expect("insert course group");
    id
}

/// Principal loaded the way the auth layer would build it.
pub async fn principal_for(pool: &SqlitePool, user: Uuid) -> Principal {
    let mut principal = Principal::new(user);
    let memberships: Vec<(Uuid, String)> =
        sqlx::query_as("SELECT course_id, course_role_id FROM course_members WHERE user_id = ?")
            .bind(user)
            .fetch_all(pool)
            .await
            .expect("memberships");
    for (course, role) in memberships {
        if let Some(role) = ctp_auth::CourseRole::parse(&role) {
            principal = principal.with_course_role(course, role);
        }
    }
    principal
}
