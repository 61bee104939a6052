//! Shared fixtures: in-memory database with the auth-side schema.

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

pub const AUTH_SCHEMA: &str = r#"
CREATE TABLE users (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    username TEXT NOT NULL UNIQUE,
    email TEXT,
    given_name TEXT,
    family_name TEXT,
    password_hash TEXT,
    is_service INTEGER NOT NULL DEFAULT 0,
    password_reset_required INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE accounts (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    provider TEXT NOT NULL,
    provider_account_id TEXT NOT NULL,
    user_id BLOB NOT NULL REFERENCES users(id),
    UNIQUE (provider, provider_account_id)
);
CREATE TABLE api_tokens (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    user_id BLOB NOT NULL REFERENCES users(id),
    name TEXT,
    token_hash TEXT NOT NULL UNIQUE,
    token_prefix TEXT NOT NULL,
    scopes TEXT NOT NULL DEFAULT '[]',
    expires_at TEXT,
    revoked_at TEXT,
    last_used_at TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_api_tokens_prefix ON api_tokens(token_prefix);
CREATE TABLE sessions (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    user_id BLOB NOT NULL REFERENCES users(id),
    sid TEXT NOT NULL,
    session_id TEXT NOT NULL,
    refresh_token_hash TEXT,
    ip_address TEXT,
    last_ip TEXT,
    user_agent TEXT,
    last_seen_at TEXT NOT NULL,
    expires_at TEXT,
    refresh_expires_at TEXT,
    refresh_counter INTEGER NOT NULL DEFAULT 0,
    revoked_at TEXT,
    ended_at TEXT,
    revocation_reason TEXT
);
CREATE TABLE user_roles (
    user_id BLOB NOT NULL REFERENCES users(id),
    role_id TEXT NOT NULL,
    PRIMARY KEY (user_id, role_id)
);
CREATE TABLE role_claims (
    role_id TEXT NOT NULL,
    resource TEXT NOT NULL,
    action TEXT NOT NULL,
    allowed INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (role_id, resource, action)
);
CREATE TABLE course_members (
    id BLOB PRIMARY KEY,
    user_id BLOB NOT NULL REFERENCES users(id),
    course_id BLOB NOT NULL,
    course_role_id TEXT NOT NULL
);
"#;

pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    for statement in AUTH_SCHEMA.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(&pool).await.expect("schema statement");
        }
    }
    pool
}

pub async fn insert_user(pool: &SqlitePool, username: &str, password_hash: Option<&str>) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO users (id, version, created_at, updated_at, username, password_hash) \
         VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(username)
    .bind(password_hash)
    .execute(pool)
    .await
    .expect("insert user");
    id
}

pub async fn grant_role(pool: &SqlitePool, user_id: Uuid, role_id: &str) {
    sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES (?, ?)")
        .bind(user_id)
        .bind(role_id)
        .execute(pool)
        .await
        .expect("grant role");
}

pub async fn enroll(pool: &SqlitePool, user_id: Uuid, course_id: Uuid, role: &str) {
    sqlx::query(
        "INSERT INTO course_members (id, user_id, course_id, course_role_id) VALUES (?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(course_id)
    .bind(role)
    .execute(pool)
    .await
    .expect("enroll member");
}
