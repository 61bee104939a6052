//! Session store: create, look up, refresh-rotate, revoke, clean up.
//!
//! Only token digests touch the database. Refresh rotation is a single
//! conditional UPDATE keyed on the old refresh digest, so a replayed
//! refresh token loses the race deterministically.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use ctp_cache::TaggedCache;
use ctp_core::ApiError;

use crate::model::SessionRecord;
use crate::token::{generate_session_token, hash_session_token};

const SESSION_COLUMNS: &str = "id, version, created_at, updated_at, user_id, sid, session_id, \
     refresh_token_hash, ip_address, last_ip, user_agent, last_seen_at, expires_at, \
     refresh_expires_at, refresh_counter, revoked_at, ended_at, revocation_reason";

/// Tokens returned to the client exactly once per create/refresh.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
    cache: TaggedCache,
    session_ttl: Duration,
    refresh_ttl: Duration,
}

/// Cache tags a session row participates in.
fn entity_tags(session: &SessionRecord) -> Vec<String> {
    vec![
        format!("session:{}", session.id),
        format!("session_sid:{}", session.sid),
        format!("user_sessions:{}", session.user_id),
        "session:list".to_string(),
    ]
}

impl SessionStore {
    pub fn new(
        pool: SqlitePool,
        cache: TaggedCache,
        session_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            session_ttl,
            refresh_ttl,
        }
    }

    /// Create a session for `user_id` and return the cleartext tokens.
    pub async fn create(
        &self,
        user_id: Uuid,
        sid: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(SessionRecord, IssuedTokens), ApiError> {
        let access_token = generate_session_token();
        let refresh_token = generate_session_token();
        let now = Utc::now();
        let id = Uuid::new_v4();
        let expires_at = now + chrono::Duration::from_std(self.session_ttl).unwrap_or_default();
        let refresh_expires_at =
            now + chrono::Duration::from_std(self.refresh_ttl).unwrap_or_default();

        sqlx::query(
            "INSERT INTO sessions (id, version, created_at, updated_at, user_id, sid, session_id, \
             refresh_token_hash, ip_address, last_ip, user_agent, last_seen_at, expires_at, \
             refresh_expires_at, refresh_counter) \
             VALUES (?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id)
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(sid)
        .bind(hash_session_token(&access_token))
        .bind(hash_session_token(&refresh_token))
        .bind(ip)
        .bind(ip)
        .bind(user_agent)
        .bind(now)
        .bind(expires_at)
        .bind(refresh_expires_at)
        .execute(&self.pool)
        .await?;

        let session = self.get(id).await?.ok_or_else(ApiError::not_found)?;
        self.invalidate(&session).await;
        info!(user_id = %user_id, sid, "session created");

        Ok((
            session,
            IssuedTokens {
                access_token,
                refresh_token,
            },
        ))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SessionRecord>, ApiError> {
        let session = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Resolve an access token to its active session.
    pub async fn find_active_by_access_token(
        &self,
        token: &str,
    ) -> Result<Option<SessionRecord>, ApiError> {
        self.find_active_by_access_hash(&hash_session_token(token)).await
    }

    pub async fn find_active_by_access_hash(
        &self,
        hash: &str,
    ) -> Result<Option<SessionRecord>, ApiError> {
        let session = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ? \
             AND revoked_at IS NULL AND ended_at IS NULL \
             AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    pub async fn find_active_by_refresh_hash(
        &self,
        hash: &str,
    ) -> Result<Option<SessionRecord>, ApiError> {
        let session = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE refresh_token_hash = ? \
             AND revoked_at IS NULL AND ended_at IS NULL \
             AND (refresh_expires_at IS NULL OR refresh_expires_at > ?)"
        ))
        .bind(hash)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Rotate both tokens. The UPDATE is keyed on the presented refresh
    /// digest, so each refresh token works at most once.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        new_ip: Option<&str>,
    ) -> Result<(SessionRecord, IssuedTokens), ApiError> {
        let old_hash = hash_session_token(refresh_token);
        let session = self
            .find_active_by_refresh_hash(&old_hash)
            .await?
            .ok_or_else(|| ApiError::new("AUTH_003"))?;

        let access_token = generate_session_token();
        let new_refresh_token = generate_session_token();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(self.session_ttl).unwrap_or_default();

        let result = sqlx::query(
            "UPDATE sessions SET session_id = ?, refresh_token_hash = ?, \
             refresh_counter = refresh_counter + 1, version = version + 1, \
             last_seen_at = ?, last_ip = COALESCE(?, last_ip), expires_at = ?, updated_at = ? \
             WHERE id = ? AND refresh_token_hash = ?",
        )
        .bind(hash_session_token(&access_token))
        .bind(hash_session_token(&new_refresh_token))
        .bind(now)
        .bind(new_ip)
        .bind(expires_at)
        .bind(now)
        .bind(session.id)
        .bind(&old_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            // Lost a race against a concurrent refresh with the same token.
            return Err(ApiError::new("AUTH_003"));
        }

        let session = self.get(session.id).await?.ok_or_else(ApiError::not_found)?;
        self.invalidate(&session).await;

        Ok((
            session,
            IssuedTokens {
                access_token,
                refresh_token: new_refresh_token,
            },
        ))
    }

    /// Active sessions of one user, most recently seen first.
    pub async fn list_active_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<SessionRecord>, ApiError> {
        let sessions = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? \
             AND revoked_at IS NULL AND ended_at IS NULL \
             AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY last_seen_at DESC"
        ))
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Graceful logout for one device.
    pub async fn end(&self, user_id: Uuid, sid: &str, reason: Option<&str>) -> Result<bool, ApiError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET ended_at = ?, revocation_reason = COALESCE(?, revocation_reason), \
             version = version + 1, updated_at = ? \
             WHERE user_id = ? AND sid = ? AND ended_at IS NULL AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(reason)
        .bind(now)
        .bind(user_id)
        .bind(sid)
        .execute(&self.pool)
        .await?;
        self.invalidate_user(user_id, sid).await;
        Ok(result.rows_affected() > 0)
    }

    /// Security revocation for one device.
    pub async fn revoke(&self, user_id: Uuid, sid: &str, reason: &str) -> Result<bool, ApiError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET revoked_at = ?, ended_at = ?, revocation_reason = ?, \
             version = version + 1, updated_at = ? \
             WHERE user_id = ? AND sid = ? AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(reason)
        .bind(now)
        .bind(user_id)
        .bind(sid)
        .execute(&self.pool)
        .await?;
        self.invalidate_user(user_id, sid).await;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke every active session of a user, optionally sparing one
    /// device (the caller's own).
    pub async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: &str,
        except_sid: Option<&str>,
    ) -> Result<u64, ApiError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE sessions SET revoked_at = ?, ended_at = ?, revocation_reason = ?, \
             version = version + 1, updated_at = ? \
             WHERE user_id = ? AND revoked_at IS NULL AND ended_at IS NULL \
             AND (? IS NULL OR sid != ?)",
        )
        .bind(now)
        .bind(now)
        .bind(reason)
        .bind(now)
        .bind(user_id)
        .bind(except_sid)
        .bind(except_sid)
        .execute(&self.pool)
        .await?;
        self.cache
            .invalidate_tags(&[format!("user_sessions:{user_id}"), "session:list".to_string()])
            .await;
        Ok(result.rows_affected())
    }

    /// Purge terminal sessions older than `older_than_days`.
    pub async fn cleanup_expired(&self, older_than_days: i64) -> Result<u64, ApiError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let result = sqlx::query(
            "DELETE FROM sessions WHERE \
             (ended_at IS NOT NULL AND ended_at < ?) OR \
             (revoked_at IS NOT NULL AND revoked_at < ?)",
        )
        .bind(cutoff)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        info!(purged = result.rows_affected(), "expired sessions cleaned up");
        Ok(result.rows_affected())
    }

    /// Stamp activity on an authenticated request.
    pub async fn touch(&self, id: Uuid, ip: Option<&str>) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE sessions SET last_seen_at = ?, last_ip = COALESCE(?, last_ip) WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(ip)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate(&self, session: &SessionRecord) {
        self.cache.invalidate_tags(&entity_tags(session)).await;
    }

    async fn invalidate_user(&self, user_id: Uuid, sid: &str) {
        self.cache
            .invalidate_tags(&[
                format!("session_sid:{sid}"),
                format!("user_sessions:{user_id}"),
                "session:list".to_string(),
            ])
            .await;
    }
}

/// Helper shared with tests and cleanup jobs.
pub fn is_session_active(session: &SessionRecord, now: DateTime<Utc>) -> bool {
    session.is_active(now)
}
