//! Route table.
//!
//! Specialized surfaces are mounted on static paths; the uniform CRUD
//! dispatcher serves `/{resource}` for everything in the descriptor
//! registry. Static segments win over the capture, so `/messages`,
//! `/tasks`, and friends shadow the generic routes.

pub mod auth;
pub mod messages;
pub mod password;
pub mod resources;
pub mod sessions;
pub mod tasks;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::extract;
use crate::state::AppState;
use crate::ws;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Authentication
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/providers", get(auth::providers))
        // Passwords
        .route("/password/set", post(password::set_own))
        .route("/password/change", post(password::change_own))
        .route("/password/admin/set", post(password::admin_set))
        .route("/password/admin/reset", post(password::admin_reset))
        .route("/password/status", get(password::own_status))
        .route("/password/status/{username}", get(password::status_for))
        // Device sessions
        .route("/sessions", get(sessions::list).delete(sessions::revoke_all))
        .route("/sessions/{sid}", delete(sessions::revoke))
        // Tasks
        .route("/tasks", get(tasks::list))
        .route("/tasks/submit", post(tasks::submit))
        .route("/tasks/{id}", get(tasks::get))
        .route("/tasks/{id}/status", get(tasks::status))
        .route("/tasks/{id}/result", get(tasks::result))
        .route("/tasks/{id}/cancel", delete(tasks::cancel))
        // Tutor test runs
        .route("/tutor-tests", post(tutor_tests::create))
        .route("/tutor-tests/{id}", get(tutor_tests::get))
        .route(
            "/tutor-tests/{id}/status",
            get(tutor_tests::status).post(tutor_tests::update_status),
        )
        .route("/tutor-tests/{id}/result", post(tutor_tests::store_result))
        // Messages
        .route("/messages", get(messages::list).post(messages::create))
        .route(
            "/messages/{id}",
            get(messages::get).patch(messages::update).delete(messages::delete),
        )
        .route(
            "/messages/{id}/reads",
            post(messages::mark_read).delete(messages::mark_unread),
        )
        .route("/messages/{id}/audit", get(messages::audit))
        // Realtime
        .route("/ws", get(ws::handler))
        // Uniform CRUD over the descriptor registry
        .route("/{resource}", get(resources::list).post(resources::create))
        .route(
            "/{resource}/{id}",
            get(resources::get)
                .patch(resources::update)
                .delete(resources::delete),
        )
        .layer(middleware::from_fn_with_state(state.clone(), extract::auth_context))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
