//! Pluggable authentication providers.
//!
//! The registry is an explicit list constructed at startup and tried in
//! order. Each provider either produces a principal, declares itself not
//! applicable (next provider runs), or fails the request outright.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use ctp_core::ApiError;

use crate::model::User;
use crate::password::PasswordService;
use crate::principal::{CourseRole, Principal};
use crate::session::SessionStore;
use crate::token::{hash_api_token, validate_token_format, TOKEN_PREFIX};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub(crate) const USER_COLUMNS: &str = "id, version, created_at, updated_at, created_by, \
     updated_by, archived_at, username, email, given_name, family_name, password_hash, \
     is_service, password_reset_required";

/// Credentials extracted from the transport layer.
#[derive(Debug, Clone)]
pub enum Credentials {
    Basic { username: String, password: String },
    Bearer(String),
}

/// Principal plus transport facts the caller may need (current device).
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    /// Set when the credential was a session token.
    pub session_sid: Option<String>,
}

pub enum AuthOutcome {
    Authenticated(Authenticated),
    /// Credential shape is not for this provider; try the next one.
    NotApplicable,
    Failed(ApiError),
}

pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn authenticate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, AuthOutcome>;
}

/// Ordered provider list; first conclusive answer wins.
pub struct AuthRegistry {
    providers: Vec<Box<dyn AuthProvider>>,
}

impl AuthRegistry {
    pub fn new(providers: Vec<Box<dyn AuthProvider>>) -> Self {
        Self { providers }
    }

    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Authenticated, ApiError> {
        for provider in &self.providers {
            match provider.authenticate(credentials).await {
                AuthOutcome::Authenticated(auth) => {
                    debug!(provider = provider.name(), user_id = %auth.principal.user_id, "authenticated");
                    return Ok(auth);
                }
                AuthOutcome::NotApplicable => continue,
                AuthOutcome::Failed(err) => {
                    warn!(provider = provider.name(), "authentication failed");
                    return Err(err);
                }
            }
        }
        Err(ApiError::unauthorized())
    }
}

// ── Principal loading ────────────────────────────────────────────────────

/// Build the authorization subject for a user: admin flag and general
/// claims from system roles, course roles from memberships.
pub async fn load_principal(pool: &SqlitePool, user: &User) -> Result<Principal, ApiError> {
    let mut principal = Principal::new(user.id);
    principal.is_service = user.is_service;

    let role_ids: Vec<(String,)> =
        sqlx::query_as("SELECT role_id FROM user_roles WHERE user_id = ?")
            .bind(user.id)
            .fetch_all(pool)
            .await?;
    for (role_id,) in &role_ids {
        if role_id == "_admin" {
            principal.is_admin = true;
        }
    }

    let claims: Vec<(String, String)> = sqlx::query_as(
        "SELECT rc.resource, rc.action FROM role_claims rc \
         JOIN user_roles ur ON ur.role_id = rc.role_id \
         WHERE ur.user_id = ? AND rc.allowed = 1",
    )
    .bind(user.id)
    .fetch_all(pool)
    .await?;
    for (resource, action) in claims {
        principal.general_claims.insert((resource, action));
    }

    let memberships: Vec<(Uuid, String)> =
        sqlx::query_as("SELECT course_id, course_role_id FROM course_members WHERE user_id = ?")
            .bind(user.id)
            .fetch_all(pool)
            .await?;
    for (course_id, role_id) in memberships {
        if let Some(role) = CourseRole::parse(&role_id) {
            principal = principal.with_course_role(course_id, role);
        }
    }

    Ok(principal)
}

pub async fn find_user_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ? AND archived_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

pub async fn find_user_by_username(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = ? AND archived_at IS NULL"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await?;
    Ok(user)
}

// ── Local password provider ──────────────────────────────────────────────

pub struct PasswordProvider {
    pool: SqlitePool,
    passwords: PasswordService,
}

impl PasswordProvider {
    pub fn new(pool: SqlitePool, passwords: PasswordService) -> Self {
        Self { pool, passwords }
    }
}

impl AuthProvider for PasswordProvider {
    fn name(&self) -> &'static str {
        "password"
    }

    fn authenticate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, AuthOutcome> {
        Box::pin(async move {
            let Credentials::Basic { username, password } = credentials else {
                return AuthOutcome::NotApplicable;
            };

            let user = match find_user_by_username(&self.pool, username).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    // Burn the same hashing cost for unknown users so the
                    // timing of a 401 does not reveal whether the username
                    // exists.
                    let _ = self
                        .passwords
                        .verify(password, "$argon2id$v=19$m=65536,t=3,p=4$AAAAAAAAAAAAAAAAAAAAAA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")
                        .await;
                    return AuthOutcome::Failed(ApiError::unauthorized());
                }
                Err(err) => return AuthOutcome::Failed(err),
            };

            let Some(stored) = user.password_hash.clone() else {
                return AuthOutcome::Failed(ApiError::unauthorized());
            };

            if !crate::password::is_argon2_hash(&stored) {
                // Legacy-encrypted credential: never verifiable, reset only.
                return AuthOutcome::Failed(ApiError::new("AUTH_004"));
            }

            if !self.passwords.verify(password, &stored).await {
                return AuthOutcome::Failed(ApiError::unauthorized());
            }

            if self.passwords.needs_rehash(&stored) {
                let upgraded = self.passwords.hash(password).await;
                let result = sqlx::query(
                    "UPDATE users SET password_hash = ?, version = version + 1, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(&upgraded)
                .bind(Utc::now())
                .bind(user.id)
                .execute(&self.pool)
                .await;
                if let Err(e) = result {
                    warn!(user_id = %user.id, error = %e, "transparent rehash failed");
                }
            }

            match load_principal(&self.pool, &user).await {
                Ok(principal) => AuthOutcome::Authenticated(Authenticated {
                    principal,
                    session_sid: None,
                }),
                Err(err) => AuthOutcome::Failed(err),
            }
        })
    }
}

// ── API token provider ───────────────────────────────────────────────────

pub struct ApiTokenProvider {
    pool: SqlitePool,
}

impl ApiTokenProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl AuthProvider for ApiTokenProvider {
    fn name(&self) -> &'static str {
        "api_token"
    }

    fn authenticate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, AuthOutcome> {
        Box::pin(async move {
            let Credentials::Bearer(token) = credentials else {
                return AuthOutcome::NotApplicable;
            };
            if !token.starts_with(TOKEN_PREFIX) {
                return AuthOutcome::NotApplicable;
            }
            if !validate_token_format(token) {
                return AuthOutcome::Failed(ApiError::unauthorized());
            }

            let hash = hash_api_token(token);
            let now = Utc::now();
            let row: Option<(Uuid, Uuid, Option<chrono::DateTime<Utc>>)> = match sqlx::query_as(
                "SELECT id, user_id, expires_at FROM api_tokens \
                 WHERE token_hash = ? AND revoked_at IS NULL",
            )
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await
            {
                Ok(row) => row,
                Err(err) => return AuthOutcome::Failed(err.into()),
            };

            let Some((token_id, user_id, expires_at)) = row else {
                return AuthOutcome::Failed(ApiError::unauthorized());
            };
            if expires_at.map(|e| e <= now).unwrap_or(false) {
                return AuthOutcome::Failed(ApiError::new("AUTH_002"));
            }

            let bump = sqlx::query(
                "UPDATE api_tokens SET last_used_at = ?, usage_count = usage_count + 1 \
                 WHERE id = ?",
            )
            .bind(now)
            .bind(token_id)
            .execute(&self.pool)
            .await;
            if let Err(e) = bump {
                warn!(error = %e, "failed to stamp api token usage");
            }

            let user = match find_user_by_id(&self.pool, user_id).await {
                Ok(Some(user)) => user,
                Ok(None) => return AuthOutcome::Failed(ApiError::unauthorized()),
                Err(err) => return AuthOutcome::Failed(err),
            };

            match load_principal(&self.pool, &user).await {
                Ok(principal) => AuthOutcome::Authenticated(Authenticated {
                    principal,
                    session_sid: None,
                }),
                Err(err) => AuthOutcome::Failed(err),
            }
        })
    }
}

// ── Session token provider ───────────────────────────────────────────────

pub struct SessionProvider {
    pool: SqlitePool,
    sessions: SessionStore,
}

impl SessionProvider {
    pub fn new(pool: SqlitePool, sessions: SessionStore) -> Self {
        Self { pool, sessions }
    }
}

impl AuthProvider for SessionProvider {
    fn name(&self) -> &'static str {
        "session"
    }

    fn authenticate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, AuthOutcome> {
        Box::pin(async move {
            let Credentials::Bearer(token) = credentials else {
                return AuthOutcome::NotApplicable;
            };
            if token.starts_with(TOKEN_PREFIX) {
                return AuthOutcome::NotApplicable;
            }

            let session = match self.sessions.find_active_by_access_token(token).await {
                Ok(Some(session)) => session,
                Ok(None) => return AuthOutcome::Failed(ApiError::unauthorized()),
                Err(err) => return AuthOutcome::Failed(err),
            };

            if let Err(e) = self.sessions.touch(session.id, None).await {
                warn!(error = %e, "failed to stamp session activity");
            }

            let user = match find_user_by_id(&self.pool, session.user_id).await {
                Ok(Some(user)) => user,
                Ok(None) => return AuthOutcome::Failed(ApiError::unauthorized()),
                Err(err) => return AuthOutcome::Failed(err),
            };

            match load_principal(&self.pool, &user).await {
                Ok(principal) => AuthOutcome::Authenticated(Authenticated {
                    principal,
                    session_sid: Some(session.sid),
                }),
                Err(err) => AuthOutcome::Failed(err),
            }
        })
    }
}

// ── SSO adapter ──────────────────────────────────────────────────────────

/// External identity resolved by an SSO backend.
#[derive(Debug, Clone)]
pub struct ExternalIdentity {
    pub provider: String,
    pub provider_account_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Verifies an opaque external token against a federation backend.
pub trait SsoVerifier: Send + Sync {
    fn provider_name(&self) -> &str;
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Option<ExternalIdentity>>;
}

/// Maps verified external identities onto local accounts, creating the
/// user + account link on first sight.
pub struct SsoProvider {
    pool: SqlitePool,
    verifier: Arc<dyn SsoVerifier>,
}

impl SsoProvider {
    pub fn new(pool: SqlitePool, verifier: Arc<dyn SsoVerifier>) -> Self {
        Self { pool, verifier }
    }

    async fn resolve_user(&self, identity: &ExternalIdentity) -> Result<User, ApiError> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM accounts WHERE provider = ? AND provider_account_id = ?",
        )
        .bind(&identity.provider)
        .bind(&identity.provider_account_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((user_id,)) = existing {
            return find_user_by_id(&self.pool, user_id)
                .await?
                .ok_or_else(ApiError::unauthorized);
        }

        // First sight: create the local user and the account link.
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let username = format!("{}:{}", identity.provider, identity.provider_account_id);
        sqlx::query(
            "INSERT INTO users (id, version, created_at, updated_at, username, email, \
             given_name, is_service, password_reset_required) \
             VALUES (?, 1, ?, ?, ?, ?, ?, 0, 0)",
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .bind(&username)
        .bind(&identity.email)
        .bind(&identity.display_name)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO accounts (id, version, created_at, updated_at, provider, \
             provider_account_id, user_id) VALUES (?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(now)
        .bind(&identity.provider)
        .bind(&identity.provider_account_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        find_user_by_id(&self.pool, user_id)
            .await?
            .ok_or_else(ApiError::unauthorized)
    }
}

impl AuthProvider for SsoProvider {
    fn name(&self) -> &'static str {
        "sso"
    }

    fn authenticate<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, AuthOutcome> {
        Box::pin(async move {
            let Credentials::Bearer(token) = credentials else {
                return AuthOutcome::NotApplicable;
            };
            let Some(identity) = self.verifier.verify(token).await else {
                return AuthOutcome::NotApplicable;
            };

            let user = match self.resolve_user(&identity).await {
                Ok(user) => user,
                Err(err) => return AuthOutcome::Failed(err),
            };

            match load_principal(&self.pool, &user).await {
                Ok(principal) => AuthOutcome::Authenticated(Authenticated {
                    principal,
                    session_sid: None,
                }),
                Err(err) => AuthOutcome::Failed(err),
            }
        })
    }
}
