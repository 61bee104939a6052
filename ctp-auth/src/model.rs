//! Auth-domain entities.
//!
//! Row types map 1:1 onto the SQL tables; secrets (password and token
//! digests) never serialize into API payloads.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub archived_at: Option<DateTime<Utc>>,
    pub username: String,
    pub email: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub is_service: bool,
    pub password_reset_required: bool,
}

impl User {
    /// Display name used in presence and typing broadcasts.
    pub fn display_name(&self) -> String {
        match (&self.given_name, &self.family_name) {
            (Some(given), Some(family)) => format!("{given} {family}"),
            (Some(given), None) => given.clone(),
            (None, Some(family)) => family.clone(),
            (None, None) => self.username.clone(),
        }
    }
}

/// External identity link `(provider, provider_account_id) → user`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub provider: String,
    pub provider_account_id: String,
    pub user_id: Uuid,
}

/// Service-account descriptor attached to a `is_service` user.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Service {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub user_id: Uuid,
    pub slug: String,
    pub service_type: String,
    pub config: Json<serde_json::Value>,
    pub enabled: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiToken {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Uuid>,
    pub updated_by: Option<Uuid>,
    pub user_id: Uuid,
    pub name: Option<String>,
    /// Hex-encoded SHA-256 of the full token; unique.
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// First 12 characters of the cleartext, safe to display.
    pub token_prefix: String,
    pub scopes: Json<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
}

impl ApiToken {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: Uuid,
    /// Per-device identifier, stable across refreshes.
    pub sid: String,
    /// Hex-encoded SHA-256 of the access token.
    #[serde(skip_serializing)]
    pub session_id: String,
    #[serde(skip_serializing)]
    pub refresh_token_hash: Option<String>,
    pub ip_address: Option<String>,
    pub last_ip: Option<String>,
    pub user_agent: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub refresh_counter: i64,
    pub revoked_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

impl SessionRecord {
    /// A session authenticates iff it was neither revoked nor ended and
    /// has not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none()
            && self.ended_at.is_none()
            && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}
