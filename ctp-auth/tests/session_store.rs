mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ctp_auth::session::SessionStore;
use ctp_auth::token::hash_session_token;
use ctp_cache::{InMemoryKv, TaggedCache};

use common::{insert_user, test_pool};

async fn store() -> (SessionStore, sqlx::SqlitePool) {
    let pool = test_pool().await;
    let cache = TaggedCache::new(Arc::new(InMemoryKv::new()));
    let store = SessionStore::new(
        pool.clone(),
        cache,
        Duration::from_secs(3600),
        Duration::from_secs(86400),
    );
    (store, pool)
}

#[tokio::test]
async fn create_returns_tokens_and_stores_only_digests() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;

    let (session, tokens) = store.create(user, "device-1", Some("10.0.0.1"), None).await.unwrap();
    assert_eq!(session.user_id, user);
    assert_eq!(session.sid, "device-1");
    assert_eq!(session.session_id, hash_session_token(&tokens.access_token));
    assert_eq!(
        session.refresh_token_hash.as_deref(),
        Some(hash_session_token(&tokens.refresh_token).as_str())
    );
    assert!(session.is_active(Utc::now()));
}

#[tokio::test]
async fn access_token_resolves_only_while_active() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;
    let (_, tokens) = store.create(user, "device-1", None, None).await.unwrap();

    let found = store.find_active_by_access_token(&tokens.access_token).await.unwrap();
    assert!(found.is_some());

    store.revoke(user, "device-1", "compromised").await.unwrap();
    let gone = store.find_active_by_access_token(&tokens.access_token).await.unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;
    let (created, tokens) = store.create(user, "device-1", None, None).await.unwrap();

    let (rotated, new_tokens) = store.refresh(&tokens.refresh_token, Some("10.0.0.2")).await.unwrap();
    assert_eq!(rotated.refresh_counter, created.refresh_counter + 1);
    assert_eq!(rotated.last_ip.as_deref(), Some("10.0.0.2"));
    assert_ne!(new_tokens.access_token, tokens.access_token);
    assert_ne!(new_tokens.refresh_token, tokens.refresh_token);

    // The old access token is dead, the new one resolves.
    assert!(store.find_active_by_access_token(&tokens.access_token).await.unwrap().is_none());
    assert!(store.find_active_by_access_token(&new_tokens.access_token).await.unwrap().is_some());

    // Second use of the same refresh token is rejected.
    let err = store.refresh(&tokens.refresh_token, None).await.unwrap_err();
    assert_eq!(err.code, "AUTH_003");
}

#[tokio::test]
async fn end_marks_the_device_session_inactive() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;
    let (_, tokens) = store.create(user, "device-1", None, None).await.unwrap();

    assert!(store.end(user, "device-1", Some("logout")).await.unwrap());
    assert!(store.find_active_by_access_token(&tokens.access_token).await.unwrap().is_none());
    // Ending again is a no-op.
    assert!(!store.end(user, "device-1", None).await.unwrap());
}

#[tokio::test]
async fn revoke_all_spares_the_current_device() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;
    let (_, t1) = store.create(user, "laptop", None, None).await.unwrap();
    let (_, t2) = store.create(user, "phone", None, None).await.unwrap();
    let (_, t3) = store.create(user, "tablet", None, None).await.unwrap();

    let revoked = store.revoke_all_for_user(user, "logout everywhere", Some("laptop")).await.unwrap();
    assert_eq!(revoked, 2);
    assert!(store.find_active_by_access_token(&t1.access_token).await.unwrap().is_some());
    assert!(store.find_active_by_access_token(&t2.access_token).await.unwrap().is_none());
    assert!(store.find_active_by_access_token(&t3.access_token).await.unwrap().is_none());
}

#[tokio::test]
async fn list_active_excludes_terminated_sessions() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;
    store.create(user, "laptop", None, None).await.unwrap();
    store.create(user, "phone", None, None).await.unwrap();
    store.end(user, "phone", None).await.unwrap();

    let active = store.list_active_for_user(user).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].sid, "laptop");
}

#[tokio::test]
async fn cleanup_purges_only_old_terminal_sessions() {
    let (store, pool) = store().await;
    let user = insert_user(&pool, "alice", None).await;
    store.create(user, "laptop", None, None).await.unwrap();
    store.create(user, "phone", None, None).await.unwrap();
    store.end(user, "phone", None).await.unwrap();

    // Nothing is old enough yet.
    assert_eq!(store.cleanup_expired(30).await.unwrap(), 0);

    // Backdate the ended session and purge.
    sqlx::query("UPDATE sessions SET ended_at = ? WHERE sid = 'phone'")
        .bind(Utc::now() - chrono::Duration::days(40))
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(store.cleanup_expired(30).await.unwrap(), 1);

    // The live session survives.
    assert_eq!(store.list_active_for_user(user).await.unwrap().len(), 1);
}
