use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

use ctp_cache::{InMemoryKv, RedisKv, SharedKv};
use ctp_core::{error, AppConfig};
use ctp_events::{InMemoryBroker, RedisBroker, SharedBroker};
use ctp_server::{routes, seed, StateBuilder};
use ctp_tasks::engine::LocalWorkflowEngine;
use ctp_tasks::{SharedEngine, TaskTracker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ctp_core::init_tracing();
    let config = AppConfig::load()?;
    error::set_debug_mode(config.debug_mode);

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await?;
    ctp_data::schema::bootstrap(&pool).await?;
    ctp_data::schema::seed_roles(&pool).await?;

    let kv: SharedKv = match &config.redis_url {
        Some(url) => match RedisKv::connect(url).await {
            Ok(kv) => Arc::new(kv),
            Err(e) => {
                warn!(error = %e, "redis unavailable, using in-memory KV");
                Arc::new(InMemoryKv::new())
            }
        },
        None => Arc::new(InMemoryKv::new()),
    };

    let broker: SharedBroker = match &config.redis_url {
        Some(url) => match RedisBroker::connect(url).await {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                warn!(error = %e, "redis unavailable, using in-process broker");
                Arc::new(InMemoryBroker::new())
            }
        },
        None => Arc::new(InMemoryBroker::new()),
    };

    // Default engine: workflows are accepted locally and handed to the
    // external runners; the tracker carries the permission tags.
    let engine: SharedEngine = Arc::new(
        LocalWorkflowEngine::builder()
            .handler("submission-testing", |params| async move {
                Ok(serde_json::json!({ "dispatched": true, "parameters": params }))
            })
            .build(),
    );
    let tracker = TaskTracker::new(kv.clone(), engine);

    let state = StateBuilder {
        pool: pool.clone(),
        kv,
        broker,
        config: config.clone(),
    }
    .build(tracker);

    if let Some((username, password)) = &config.initial_admin {
        seed::ensure_admin(&pool, &state.passwords, username, password).await?;
    }
    seed::seed_worker_services(&pool, &config).await?;

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
