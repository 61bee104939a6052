//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use ctp_auth::{AuthRegistry, PasswordService, PermissionEngine, SessionStore};
use ctp_cache::{SharedKv, TaggedCache};
use ctp_core::AppConfig;
use ctp_data::{ChannelAuthorizer, CrudContext, MessageStore};
use ctp_events::{SharedBroker, TypingTracker};
use ctp_tasks::{TaskTracker, TutorTestStore};

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub kv: SharedKv,
    pub cache: TaggedCache,
    pub policy: PermissionEngine,
    pub broker: SharedBroker,
    pub passwords: PasswordService,
    pub sessions: SessionStore,
    pub auth: Arc<AuthRegistry>,
    pub messages: MessageStore,
    pub channels: ChannelAuthorizer,
    pub typing: TypingTracker,
    pub tracker: TaskTracker,
    pub tutor_tests: TutorTestStore,
    /// Names of configured SSO providers, for `GET /auth/providers`.
    pub sso_providers: Vec<String>,
    pub debug_mode: bool,
}

impl AppState {
    pub fn crud(&self) -> CrudContext {
        CrudContext {
            pool: self.pool.clone(),
            cache: self.cache.clone(),
            policy: self.policy.clone(),
            broker: self.broker.clone(),
        }
    }
}

/// Everything needed to assemble a state by hand (tests swap pieces).
pub struct StateBuilder {
    pub pool: SqlitePool,
    pub kv: SharedKv,
    pub broker: SharedBroker,
    pub config: AppConfig,
}

impl StateBuilder {
    pub fn build(self, tracker: TaskTracker) -> AppState {
        let cache = TaggedCache::new(self.kv.clone());
        let policy = PermissionEngine::new(self.kv.clone());
        let passwords = PasswordService::new(self.config.hashing);
        let sessions = SessionStore::new(
            self.pool.clone(),
            cache.clone(),
            self.config.session_ttl,
            self.config.refresh_ttl,
        );
        let auth = Arc::new(AuthRegistry::new(vec![
            Box::new(ctp_auth::provider::PasswordProvider::new(
                self.pool.clone(),
                passwords,
            )),
            Box::new(ctp_auth::provider::ApiTokenProvider::new(self.pool.clone())),
            Box::new(ctp_auth::provider::SessionProvider::new(
                self.pool.clone(),
                sessions.clone(),
            )),
        ]));
        let messages = MessageStore::new(self.pool.clone(), self.broker.clone());
        let channels = ChannelAuthorizer::new(self.pool.clone());
        let typing = TypingTracker::new(self.kv.clone());
        let tutor_tests = TutorTestStore::new(self.kv.clone());

        AppState {
            pool: self.pool,
            kv: self.kv,
            cache,
            policy,
            broker: self.broker,
            passwords,
            sessions,
            auth,
            messages,
            channels,
            typing,
            tracker,
            tutor_tests,
            sso_providers: Vec::new(),
            debug_mode: self.config.debug_mode,
        }
    }
}

/// Default TTL for coarse read caching at the HTTP layer.
pub const HTTP_CACHE_TTL: Duration = Duration::from_secs(300);
