//! Publish/subscribe backplane: one topic per room name plus a general topic.
//!
//! Every process holding members of a room subscribes to that room's topic,
//! so a publish from any process reaches all of them (including itself).
//! [`RedisBackplane`] carries topics between processes; [`LocalBackplane`]
//! keeps them inside one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use redis::AsyncCommands;
use tracing::{debug, info, trace, warn};

/// Payloads delivered on a subscribed topic, in publish order.
pub type Subscription = BoxStream<'static, Bytes>;

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    #[error("backplane connection failed: {reason}")]
    Connect { reason: String },

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
}

#[async_trait]
pub trait Backplane: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackplaneError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError>;
}

/// In-memory backplane built on `tokio::sync::broadcast`.
///
/// Hubs sharing one `Arc<LocalBackplane>` behave like separate processes
/// attached to the same broker.
pub struct LocalBackplane {
    topics: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl LocalBackplane {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<Bytes> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for LocalBackplane {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackplaneError> {
        // No subscribers is not an error: the payload just has no audience.
        let receivers = self.topic(topic).send(payload).unwrap_or(0);
        trace!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError> {
        let rx = self.topic(topic).subscribe();
        let topic = topic.to_owned();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let payload = match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(topic = %topic, skipped, "backplane subscriber lagged");
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(stream.boxed())
    }
}

/// Backplane on a Redis server: `PUBLISH` for sends, one pub/sub connection
/// per subscribed topic. Processes pointed at the same server share topics.
pub struct RedisBackplane {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisBackplane {
    /// Connect to the server at `url`. Fails if it cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, BackplaneError> {
        let client = redis::Client::open(url).map_err(connect_error)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_error)?;
        info!("redis backplane connected");
        Ok(Self { client, publisher })
    }
}

fn connect_error(e: redis::RedisError) -> BackplaneError {
    BackplaneError::Connect {
        reason: e.to_string(),
    }
}

#[async_trait]
impl Backplane for RedisBackplane {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackplaneError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(topic, &payload[..])
            .await
            .map_err(|e| BackplaneError::Publish {
                topic: topic.to_owned(),
                reason: e.to_string(),
            })?;
        trace!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BackplaneError> {
        let subscribe_error = |e: redis::RedisError| BackplaneError::Subscribe {
            topic: topic.to_owned(),
            reason: e.to_string(),
        };
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(subscribe_error)?;
        pubsub.subscribe(topic).await.map_err(subscribe_error)?;
        debug!(topic, "redis subscription open");

        let stream = pubsub
            .into_on_message()
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}

/// Connect the backplane named by `url`, or an in-process one when unset.
pub async fn connect_backplane(url: Option<&str>) -> Result<Arc<dyn Backplane>, BackplaneError> {
    match url {
        Some(url) => Ok(Arc::new(RedisBackplane::connect(url).await?)),
        None => {
            info!("no backplane url, fan-out stays in this process");
            Ok(Arc::new(LocalBackplane::new()))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(sub: &mut Subscription) -> Bytes {
        timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bp = LocalBackplane::new();
        let mut a = bp.subscribe("lobby").await.unwrap();
        let mut b = bp.subscribe("lobby").await.unwrap();

        bp.publish("lobby", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(next(&mut a).await, "hello");
        assert_eq!(next(&mut b).await, "hello");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bp = LocalBackplane::new();
        let mut lobby = bp.subscribe("lobby").await.unwrap();
        let mut other = bp.subscribe("other").await.unwrap();

        bp.publish("lobby", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(next(&mut lobby).await, "x");
        assert!(timeout(Duration::from_millis(50), other.next()).await.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bp = LocalBackplane::new();
        bp.publish("empty", Bytes::from_static(b"x")).await.unwrap();
        // A later subscriber starts after the unheard payload.
        let mut late = bp.subscribe("empty").await.unwrap();
        assert!(timeout(Duration::from_millis(50), late.next()).await.is_err());
    }

    #[tokio::test]
    async fn order_is_preserved_per_topic() {
        let bp = LocalBackplane::new();
        let mut sub = bp.subscribe("t").await.unwrap();
        for i in 0..10 {
            bp.publish("t", Bytes::from(format!("{i}"))).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(next(&mut sub).await, format!("{i}"));
        }
    }

    #[tokio::test]
    async fn unset_url_gives_local_backplane() {
        let bp = connect_backplane(None).await.unwrap();
        let mut sub = bp.subscribe("lobby").await.unwrap();
        bp.publish("lobby", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(next(&mut sub).await, "hi");
    }

    #[tokio::test]
    async fn malformed_redis_url_fails_to_connect() {
        assert!(matches!(
            RedisBackplane::connect("not a url").await,
            Err(BackplaneError::Connect { .. })
        ));
        assert!(matches!(
            connect_backplane(Some("http://localhost")).await,
            Err(BackplaneError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_and_continues() {
        let bp = LocalBackplane::with_capacity(2);
        let mut sub = bp.subscribe("t").await.unwrap();
        for i in 0..5 {
            bp.publish("t", Bytes::from(format!("{i}"))).await.unwrap();
        }
        // The oldest three were overwritten; the newest two survive.
        assert_eq!(next(&mut sub).await, "3");
        assert_eq!(next(&mut sub).await, "4");
    }
}
