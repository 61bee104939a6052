//! Broker implementations: in-process broadcast and Redis pub/sub.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{Envelope, BROADCAST_PREFIX};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const BUS_CAPACITY: usize = 1024;

/// One message as observed by a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub envelope: Envelope,
}

/// Receiver half handed to the WebSocket gateway. Lagged subscribers skip
/// ahead; the bus never replays.
pub struct BusSubscriber {
    rx: broadcast::Receiver<BusMessage>,
}

impl BusSubscriber {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "bus subscriber lagged, skipping ahead");
                    continue;
                }
            }
        }
    }
}

/// Cross-replica event bus.
pub trait Broker: Send + Sync {
    /// Publish an envelope to a logical channel.
    fn publish<'a>(&'a self, channel: &'a str, envelope: Envelope) -> BoxFuture<'a, ()>;
    /// Subscribe to every broadcast this replica should see.
    fn subscribe(&self) -> BusSubscriber;
}

pub type SharedBroker = Arc<dyn Broker>;

// ── In-memory broker ─────────────────────────────────────────────────────

/// Single-replica bus over a `tokio::sync::broadcast` channel. Default
/// for tests and single-node deployments.
pub struct InMemoryBroker {
    tx: broadcast::Sender<BusMessage>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for InMemoryBroker {
    fn publish<'a>(&'a self, channel: &'a str, envelope: Envelope) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.tx.send(BusMessage {
                channel: channel.to_string(),
                envelope,
            });
        })
    }

    fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}

// ── Redis broker ─────────────────────────────────────────────────────────

/// Multi-replica bus over Redis pub/sub.
///
/// A long-lived listener task owns the pub/sub handle, pattern-subscribes
/// to the broadcast namespace once, and fans inbound messages out through
/// an in-process broadcast channel; per-connection writer tasks filter by
/// their own subscription sets. Dropping the broker aborts the listener,
/// which tears down every subscriber.
pub struct RedisBroker {
    manager: redis::aio::ConnectionManager,
    tx: broadcast::Sender<BusMessage>,
    listener: tokio::task::JoinHandle<()>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client.clone()).await?;
        let (tx, _) = broadcast::channel(BUS_CAPACITY);

        let listener_tx = tx.clone();
        let listener = tokio::spawn(async move {
            if let Err(e) = Self::listen(client, listener_tx).await {
                error!(error = %e, "pubsub listener terminated");
            }
        });

        Ok(Self {
            manager,
            tx,
            listener,
        })
    }

    async fn listen(
        client: redis::Client,
        tx: broadcast::Sender<BusMessage>,
    ) -> Result<(), redis::RedisError> {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{BROADCAST_PREFIX}*")).await?;
        info!("pubsub listener started");

        let mut stream = pubsub.on_message();
        while let Some(msg) = futures_util::StreamExt::next(&mut stream).await {
            let full_channel = msg.get_channel_name().to_string();
            let channel = full_channel
                .strip_prefix(BROADCAST_PREFIX)
                .unwrap_or(&full_channel)
                .to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel, error = %e, "unreadable pubsub payload");
                    continue;
                }
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => {
                    debug!(channel, event = %envelope.event_type, "bus message received");
                    let _ = tx.send(BusMessage { channel, envelope });
                }
                Err(e) => warn!(channel, error = %e, "invalid JSON in pubsub message"),
            }
        }
        info!("pubsub listener ended");
        Ok(())
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl Broker for RedisBroker {
    fn publish<'a>(&'a self, channel: &'a str, envelope: Envelope) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(channel, error = %e, "unserializable envelope");
                    return;
                }
            };
            let mut con = self.manager.clone();
            let result: Result<(), redis::RedisError> = redis::AsyncCommands::publish(
                &mut con,
                format!("{BROADCAST_PREFIX}{channel}"),
                payload,
            )
            .await;
            if let Err(e) = result {
                warn!(channel, error = %e, "pubsub publish failed");
            }
        })
    }

    fn subscribe(&self) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}
