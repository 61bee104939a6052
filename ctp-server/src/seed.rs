//! Startup seeding: bootstrap admin and worker service accounts.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use ctp_auth::token::prepare_predefined_token;
use ctp_auth::PasswordService;
use ctp_core::AppConfig;

/// Create the bootstrap admin unless the username already exists.
pub async fn ensure_admin(
    pool: &SqlitePool,
    passwords: &PasswordService,
    username: &str,
    password: &str,
) -> Result<(), sqlx::Error> {
    let existing: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    let hash = passwords.hash(password).await;
    sqlx::query(
        "INSERT INTO users (id, version, created_at, updated_at, username, password_hash) \
         VALUES (?, 1, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(now)
    .bind(now)
    .bind(username)
    .bind(&hash)
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES (?, '_admin')")
        .bind(id)
        .execute(pool)
        .await?;
    info!(username, "bootstrap admin created");
    Ok(())
}

/// Seed worker service accounts from the configured `slug=token` list.
/// Only token digests are stored; a malformed token is skipped.
pub async fn seed_worker_services(pool: &SqlitePool, config: &AppConfig) -> Result<(), sqlx::Error> {
    for (slug, token) in &config.worker_tokens {
        let material = match prepare_predefined_token(token) {
            Ok(material) => material,
            Err(e) => {
                warn!(slug, error = %e, "skipping worker token");
                continue;
            }
        };

        let username = format!("svc-{slug}");
        let now = Utc::now();
        let user_id: Uuid = match sqlx::query_as::<_, (Uuid,)>(
            "SELECT id FROM users WHERE username = ?",
        )
        .bind(&username)
        .fetch_optional(pool)
        .await?
        {
            Some((id,)) => id,
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO users (id, version, created_at, updated_at, username, is_service) \
                     VALUES (?, 1, ?, ?, ?, 1)",
                )
                .bind(id)
                .bind(now)
                .bind(now)
                .bind(&username)
                .execute(pool)
                .await?;
                sqlx::query(
                    "INSERT INTO services (id, version, created_at, updated_at, user_id, slug, service_type) \
                     VALUES (?, 1, ?, ?, ?, ?, 'worker')",
                )
                .bind(Uuid::new_v4())
                .bind(now)
                .bind(now)
                .bind(id)
                .bind(slug)
                .execute(pool)
                .await?;
                id
            }
        };

        sqlx::query(
            "INSERT OR IGNORE INTO api_tokens (id, version, created_at, updated_at, user_id, \
             name, token_hash, token_prefix, scopes, usage_count) \
             VALUES (?, 1, ?, ?, ?, ?, ?, ?, '[]', 0)",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(format!("worker:{slug}"))
        .bind(&material.hash)
        .bind(&material.prefix)
        .execute(pool)
        .await?;
        info!(slug, prefix = %material.prefix, "worker service seeded");
    }
    Ok(())
}
