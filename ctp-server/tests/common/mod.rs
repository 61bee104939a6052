//! Test app assembly and request helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tower::ServiceExt;
use uuid::Uuid;

use ctp_auth::password::hash_password;
use ctp_cache::InMemoryKv;
use ctp_core::config::HashingParams;
use ctp_core::AppConfig;
use ctp_events::InMemoryBroker;
use ctp_server::{routes, seed, StateBuilder};
use ctp_tasks::engine::LocalWorkflowEngine;
use ctp_tasks::{SharedEngine, TaskTracker};

pub fn cheap_hashing() -> HashingParams {
    HashingParams {
        time_cost: 1,
        memory_kib: 8,
        parallelism: 1,
    }
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        redis_url: None,
        bind_addr: "127.0.0.1:0".into(),
        session_secret: "test-secret".into(),
        hashing: cheap_hashing(),
        debug_mode: true,
        session_ttl: Duration::from_secs(3600),
        refresh_ttl: Duration::from_secs(86400),
        worker_tokens: Vec::new(),
        initial_admin: None,
    }
}

pub struct TestApp {
    pub app: Router,
    pub pool: SqlitePool,
}

pub async fn spawn_app() -> TestApp {
    ctp_core::error::set_debug_mode(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("sqlite");
    ctp_data::schema::bootstrap(&pool).await.expect("schema");
    ctp_data::schema::seed_roles(&pool).await.expect("roles");

    let kv = Arc::new(InMemoryKv::new());
    let broker = Arc::new(InMemoryBroker::new());
    let engine: SharedEngine = Arc::new(
        LocalWorkflowEngine::builder()
            .handler("submission-testing", |params| async move { Ok(params) })
            .handler("course-provisioning", |params| async move { Ok(params) })
            .build(),
    );
    let tracker = TaskTracker::new(kv.clone(), engine);

    let state = StateBuilder {
        pool: pool.clone(),
        kv,
        broker,
        config: test_config(),
    }
    .build(tracker);

    let app = routes::router(state.clone());
    TestApp { app, pool }
}

impl TestApp {
    pub async fn seed_admin(&self, username: &str, password: &str) {
        let passwords = ctp_auth::PasswordService::new(cheap_hashing());
        seed::ensure_admin(&self.pool, &passwords, username, password)
            .await
            .expect("seed admin");
    }

    pub async fn insert_user_with_password(&self, username: &str, password: &str) -> Uuid {
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
        .bind(hash_password(password, cheap_hashing()))
        .execute(&self.pool)
        .await
        .expect("insert user");
        id
    }

    pub async fn seed_course(&self, slug: &str) -> Uuid {
        let now = Utc::now();
        let org = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO organizations (id, version, created_at, updated_at, title, slug) \
             VALUES (?, 1, ?, ?, ?, ?)",
        )
        .bind(org)
        .bind(now)
        .bind(now)
        .bind("org")
        .bind(format!("{slug}-org"))
        .execute(&self.pool)
        .await
        .expect("org");
        let family = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO course_families (id, version, created_at, updated_at, title, slug, organization_id) \
             VALUES (?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(family)
        .bind(now)
        .bind(now)
        .bind("family")
        .bind(format!("{slug}-family"))
        .bind(org)
        .execute(&self.pool)
        .await
        .expect("family");
        let course = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO courses (id, version, created_at, updated_at, title, slug, course_family_id, organization_id) \
             VALUES (?, 1, ?, ?, ?, ?, ?, ?)",
        )
        .bind(course)
        .bind(now)
        .bind(now)
        .bind("course")
        .bind(slug)
        .bind(family)
        .bind(org)
        .execute(&self.pool)
        .await
        .expect("course");
        course
    }

    pub async fn seed_content(&self, course: Uuid, path: &str) -> Uuid {
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
        .execute(&self.pool)
        .await
        .expect("content");
        id
    }

    pub async fn enroll(&self, user: Uuid, course: Uuid, role: &str) -> Uuid {
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
        .execute(&self.pool)
        .await
        .expect("enroll");
        id
    }

    pub async fn login(&self, username: &str, password: &str) -> Value {
        let (status, body, _) = self
            .request(
                "POST",
                "/auth/login",
                None,
                Some(serde_json::json!({ "username": username, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        body
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value, axum::http::HeaderMap) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.expect("request");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value, headers)
    }
}
