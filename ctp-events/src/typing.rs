//! Ephemeral typing indicators.
//!
//! Each indicator is a self-expiring KV key, so a user who closes the
//! browser mid-keystroke disappears from the channel within the TTL
//! without any explicit stop event.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use ctp_cache::SharedKv;

/// Indicators expire five seconds after the last `typing:start`.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

const TYPING_PREFIX: &str = "ws:typing:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: Uuid,
    pub user_name: Option<String>,
}

#[derive(Clone)]
pub struct TypingTracker {
    kv: SharedKv,
}

impl TypingTracker {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    fn key(channel: &str, user_id: Uuid) -> String {
        format!("{TYPING_PREFIX}{channel}:{user_id}")
    }

    pub async fn set_typing(&self, channel: &str, user_id: Uuid, user_name: Option<&str>) {
        let value = serde_json::json!({ "user_name": user_name }).to_string();
        self.kv.set(&Self::key(channel, user_id), value, TYPING_TTL).await;
        debug!(channel, %user_id, "typing started");
    }

    pub async fn stop_typing(&self, channel: &str, user_id: Uuid) {
        self.kv.delete(&Self::key(channel, user_id)).await;
        debug!(channel, %user_id, "typing stopped");
    }

    /// Everyone currently typing in `channel`, enumerated by key scan.
    pub async fn typing_users(&self, channel: &str) -> Vec<TypingUser> {
        let prefix = format!("{TYPING_PREFIX}{channel}:");
        let mut users = Vec::new();
        for key in self.kv.scan_prefix(&prefix).await {
            let Some(raw_id) = key.rsplit(':').next() else {
                continue;
            };
            let Ok(user_id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            let user_name = match self.kv.get(&key).await {
                Some(value) => serde_json::from_str::<serde_json::Value>(&value)
                    .ok()
                    .and_then(|v| v.get("user_name").and_then(|n| n.as_str()).map(String::from)),
                None => None,
            };
            users.push(TypingUser { user_id, user_name });
        }
        users
    }

    /// Clear every indicator a user holds; used on disconnect.
    pub async fn clear_user(&self, channels: &[String], user_id: Uuid) {
        for channel in channels {
            self.kv.delete(&Self::key(channel, user_id)).await;
        }
    }
}
