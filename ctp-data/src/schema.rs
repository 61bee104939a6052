//! Canonical schema and bootstrap.
//!
//! Every business table carries the audit columns (`version`,
//! `created_at`, `updated_at`, `created_by`, `updated_by`) and, where the
//! entity soft-deletes, `archived_at`. Ids are UUID blobs, timestamps are
//! RFC 3339 text, JSON columns are text.

use sqlx::SqlitePool;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
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

CREATE TABLE IF NOT EXISTS accounts (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    provider TEXT NOT NULL,
    provider_account_id TEXT NOT NULL,
    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    UNIQUE (provider, provider_account_id)
);

CREATE TABLE IF NOT EXISTS services (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    user_id BLOB NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
    slug TEXT NOT NULL UNIQUE,
    service_type TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    last_seen_at TEXT
);

CREATE TABLE IF NOT EXISTS api_tokens (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT,
    token_hash TEXT NOT NULL UNIQUE,
    token_prefix TEXT NOT NULL,
    scopes TEXT NOT NULL DEFAULT '[]',
    expires_at TEXT,
    revoked_at TEXT,
    last_used_at TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_api_tokens_prefix ON api_tokens(token_prefix);

CREATE TABLE IF NOT EXISTS sessions (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
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
CREATE INDEX IF NOT EXISTS idx_sessions_session_id ON sessions(session_id);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

CREATE TABLE IF NOT EXISTS roles (
    id TEXT PRIMARY KEY,
    title TEXT,
    description TEXT,
    builtin INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_roles (
    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, role_id)
);

CREATE TABLE IF NOT EXISTS role_claims (
    role_id TEXT NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    resource TEXT NOT NULL,
    action TEXT NOT NULL,
    allowed INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (role_id, resource, action)
);

CREATE TABLE IF NOT EXISTS organizations (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    title TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS course_families (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    title TEXT NOT NULL,
    slug TEXT NOT NULL,
    organization_id BLOB NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
    properties TEXT NOT NULL DEFAULT '{}',
    UNIQUE (organization_id, slug)
);

CREATE TABLE IF NOT EXISTS courses (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    title TEXT NOT NULL,
    slug TEXT NOT NULL,
    course_family_id BLOB NOT NULL REFERENCES course_families(id) ON DELETE CASCADE,
    organization_id BLOB NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
    properties TEXT NOT NULL DEFAULT '{}',
    UNIQUE (course_family_id, slug)
);
CREATE INDEX IF NOT EXISTS idx_courses_org ON courses(organization_id);

CREATE TABLE IF NOT EXISTS course_contents (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    title TEXT NOT NULL,
    course_id BLOB NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'assignment',
    content_type TEXT,
    max_group_size INTEGER NOT NULL DEFAULT 1,
    properties TEXT NOT NULL DEFAULT '{}',
    UNIQUE (course_id, path)
);

CREATE TABLE IF NOT EXISTS course_groups (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    title TEXT NOT NULL,
    course_id BLOB NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS course_members (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    course_id BLOB NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
    course_role_id TEXT NOT NULL,
    course_group_id BLOB REFERENCES course_groups(id) ON DELETE SET NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    UNIQUE (user_id, course_id)
);
CREATE INDEX IF NOT EXISTS idx_course_members_course ON course_members(course_id);

CREATE TABLE IF NOT EXISTS submission_groups (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    course_content_id BLOB NOT NULL REFERENCES course_contents(id) ON DELETE CASCADE,
    max_group_size INTEGER NOT NULL DEFAULT 1,
    max_submissions INTEGER,
    max_test_runs INTEGER,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS submission_group_members (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    submission_group_id BLOB NOT NULL REFERENCES submission_groups(id) ON DELETE CASCADE,
    course_member_id BLOB NOT NULL REFERENCES course_members(id) ON DELETE CASCADE,
    UNIQUE (submission_group_id, course_member_id)
);

CREATE TABLE IF NOT EXISTS submission_artifacts (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    submission_group_id BLOB NOT NULL REFERENCES submission_groups(id) ON DELETE CASCADE,
    bucket TEXT NOT NULL,
    object_key TEXT NOT NULL,
    submit INTEGER NOT NULL DEFAULT 0,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS results (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    submission_artifact_id BLOB REFERENCES submission_artifacts(id) ON DELETE CASCADE,
    submission_group_id BLOB NOT NULL REFERENCES submission_groups(id) ON DELETE CASCADE,
    course_member_id BLOB REFERENCES course_members(id) ON DELETE SET NULL,
    execution_backend TEXT,
    status INTEGER NOT NULL DEFAULT 0,
    score REAL,
    result_json TEXT NOT NULL DEFAULT '{}',
    version_identifier TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_results_group ON results(submission_group_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_results_version_identifier
    ON results(submission_group_id, version_identifier) WHERE status != 3;

CREATE TABLE IF NOT EXISTS submission_grades (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    submission_artifact_id BLOB NOT NULL REFERENCES submission_artifacts(id) ON DELETE CASCADE,
    graded_by_course_member_id BLOB REFERENCES course_members(id) ON DELETE SET NULL,
    grade REAL,
    status INTEGER NOT NULL DEFAULT 0,
    review TEXT,
    properties TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS messages (
    id BLOB PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by BLOB,
    updated_by BLOB,
    archived_at TEXT,
    author_id BLOB NOT NULL REFERENCES users(id),
    parent_id BLOB REFERENCES messages(id) ON DELETE CASCADE,
    level INTEGER NOT NULL DEFAULT 0,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    user_id BLOB REFERENCES users(id) ON DELETE CASCADE,
    course_member_id BLOB REFERENCES course_members(id) ON DELETE CASCADE,
    submission_group_id BLOB REFERENCES submission_groups(id) ON DELETE CASCADE,
    course_group_id BLOB REFERENCES course_groups(id) ON DELETE CASCADE,
    course_content_id BLOB REFERENCES course_contents(id) ON DELETE CASCADE,
    course_id BLOB REFERENCES courses(id) ON DELETE CASCADE,
    properties TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(parent_id);
CREATE INDEX IF NOT EXISTS idx_messages_submission_group ON messages(submission_group_id);

CREATE TABLE IF NOT EXISTS message_reads (
    id BLOB PRIMARY KEY,
    created_at TEXT NOT NULL,
    message_id BLOB NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    reader_user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    UNIQUE (message_id, reader_user_id)
);

CREATE TABLE IF NOT EXISTS message_audit_logs (
    id BLOB PRIMARY KEY,
    created_at TEXT NOT NULL,
    message_id BLOB NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    user_id BLOB REFERENCES users(id),
    action TEXT NOT NULL,
    old_title TEXT,
    old_content TEXT,
    new_title TEXT,
    new_content TEXT
);
CREATE INDEX IF NOT EXISTS idx_message_audit_message ON message_audit_logs(message_id);
"#;

/// Create every table. Idempotent; used at startup and by tests.
pub async fn bootstrap(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA.split(';') {
        let statement = statement.trim();
        if !statement.is_empty() {
            sqlx::query(statement).execute(pool).await?;
        }
    }
    Ok(())
}

/// Seed the role catalog with the system roles.
pub async fn seed_roles(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for (id, title) in [
        ("_admin", "System administrator"),
        ("_user_manager", "User manager"),
    ] {
        sqlx::query("INSERT OR IGNORE INTO roles (id, title, builtin) VALUES (?, ?, 1)")
            .bind(id)
            .bind(title)
            .execute(pool)
            .await?;
    }
    // The user manager may administer users and their credentials.
    for action in ["list", "get", "create", "update"] {
        sqlx::query(
            "INSERT OR IGNORE INTO role_claims (role_id, resource, action, allowed) \
             VALUES ('_user_manager', 'user', ?, 1)",
        )
        .bind(action)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        bootstrap(&pool).await.unwrap();
        bootstrap(&pool).await.unwrap();
        seed_roles(&pool).await.unwrap();
        seed_roles(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM roles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
