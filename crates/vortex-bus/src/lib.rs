//! Thin facade over a pub/sub + key/value store: `subscribe`, `publish`,
//! `lpush`, `hget`. Modeled on Redis verbs and backed by the `redis` crate,
//! but callers depend only on the [`Bus`] trait so tests can swap in
//! [`MockBus`] without a live server.
//!
//! Connection loss is not recovered here — per spec, that is the
//! lifecycle's job: a subscription stream ending or erroring propagates up
//! to the caller, who exits and lets a supervisor restart the process.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Credentials delivered encrypted during enrollment, never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct BusCredentials {
    #[serde(rename = "addr")]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "db", default)]
    pub db_index: i64,
}

impl RedisBus {
    /// Convenience constructor from a decoded [`BusCredentials`].
    pub fn from_credentials(creds: &BusCredentials) -> Result<Self, BusError> {
        Self::new(&creds.address, &creds.username, &creds.password, creds.db_index)
    }
}

/// A single inbound message on a subscribed channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Message>, BusError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;
    async fn lpush(&self, list_key: &str, payload: &str) -> Result<(), BusError>;
    async fn hget(&self, hash_key: &str, field: &str) -> Result<Option<String>, BusError>;
}

/// Redis-backed [`Bus`]. Each call that needs a plain command connection
/// opens a multiplexed connection from the shared client; `subscribe` opens
/// its own dedicated pub/sub connection, since Redis requires a connection
/// in subscriber mode to not also issue regular commands.
pub struct RedisBus {
    client: redis::Client,
}

impl RedisBus {
    pub fn new(addr: &str, username: &str, password: &str, db: i64) -> Result<Self, BusError> {
        let mut url = String::from("redis://");
        if !username.is_empty() || !password.is_empty() {
            url.push_str(username);
            url.push(':');
            url.push_str(password);
            url.push('@');
        }
        url.push_str(addr);
        url.push('/');
        url.push_str(&db.to_string());
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Message>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(Message { channel, payload }),
                Err(_) => None,
            }
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn lpush(&self, list_key: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        redis::cmd("LPUSH")
            .arg(list_key)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, hash_key: &str, field: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("HGET")
            .arg(hash_key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }
}

/// Read `agent_config:<agent_id>` first, falling back to the global
/// `agent_config` hash when the per-agent value is missing or empty.
///
/// Job and port-range settings can be pushed either per-agent or globally;
/// this makes the fallback explicit instead of leaving callers to read only
/// one of the two hashes.
pub async fn hget_with_global_fallback(
    bus: &dyn Bus,
    agent_id: &str,
    field: &str,
) -> Result<Option<String>, BusError> {
    let per_agent_key = format!("agent_config:{agent_id}");
    if let Some(value) = bus.hget(&per_agent_key, field).await? {
        if !value.is_empty() {
            return Ok(Some(value));
        }
    }
    bus.hget("agent_config", field).await
}

/// In-memory [`Bus`] implementation for tests in this and other crates —
/// shipped as a regular module (not test-gated) so downstream crates can
/// depend on it from their own `#[cfg(test)]` code.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// In-memory [`Bus`] for unit tests: records published/pushed messages
    /// and serves canned `hget` responses, with no network dependency.
    #[derive(Default)]
    pub struct MockBus {
        pub published: Mutex<Vec<(String, String)>>,
        pub pushed: Mutex<Vec<(String, String)>>,
        pub hash_values: Mutex<HashMap<(String, String), String>>,
        subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<Message>)>>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_hget(&self, hash_key: &str, field: &str, value: &str) {
            self.hash_values
                .lock()
                .unwrap()
                .insert((hash_key.to_string(), field.to_string()), value.to_string());
        }

        /// Deliver `payload` to every subscriber currently registered on `channel`.
        pub fn deliver(&self, channel: &str, payload: &str) {
            for (chan, tx) in self.subscribers.lock().unwrap().iter() {
                if chan == channel {
                    let _ = tx.send(Message {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    });
                }
            }
        }
    }

    #[async_trait]
    impl Bus for MockBus {
        async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Message>, BusError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers
                .lock()
                .unwrap()
                .push((channel.to_string(), tx));
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }

        async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }

        async fn lpush(&self, list_key: &str, payload: &str) -> Result<(), BusError> {
            self.pushed
                .lock()
                .unwrap()
                .push((list_key.to_string(), payload.to_string()));
            Ok(())
        }

        async fn hget(&self, hash_key: &str, field: &str) -> Result<Option<String>, BusError> {
            Ok(self
                .hash_values
                .lock()
                .unwrap()
                .get(&(hash_key.to_string(), field.to_string()))
                .cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockBus;
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn publish_and_lpush_are_recorded() {
        let bus = MockBus::new();
        bus.publish("agent_task_result_a1", "{}").await.unwrap();
        bus.lpush("agent_status:a1", "{}").await.unwrap();
        assert_eq!(bus.published.lock().unwrap().len(), 1);
        assert_eq!(bus.pushed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_receives_delivered_messages() {
        let bus = MockBus::new();
        let mut stream = bus.subscribe("agent_task_a1").await.unwrap();
        bus.deliver("agent_task_a1", r#"{"id":"t1","type":"hello"}"#);
        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "agent_task_a1");
        assert!(msg.payload.contains("hello"));
    }

    #[tokio::test]
    async fn hget_with_global_fallback_prefers_per_agent() {
        let bus = MockBus::new();
        bus.set_hget("agent_config:a1", "AGENT_REPORT_STAT_JOB_CRON", "*/5 * * * * *");
        bus.set_hget("agent_config", "AGENT_REPORT_STAT_JOB_CRON", "0 * * * * *");

        let value = hget_with_global_fallback(&bus, "a1", "AGENT_REPORT_STAT_JOB_CRON")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("*/5 * * * * *"));
    }

    #[tokio::test]
    async fn hget_with_global_fallback_falls_back_when_per_agent_missing() {
        let bus = MockBus::new();
        bus.set_hget("agent_config", "AGENT_REPORT_TRAFFIC_JOB_CRON", "0 */5 * * * *");

        let value = hget_with_global_fallback(&bus, "a1", "AGENT_REPORT_TRAFFIC_JOB_CRON")
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("0 */5 * * * *"));
    }

    #[tokio::test]
    async fn hget_with_global_fallback_returns_none_when_absent_everywhere() {
        let bus = MockBus::new();
        let value = hget_with_global_fallback(&bus, "a1", "MISSING_KEY")
            .await
            .unwrap();
        assert_eq!(value, None);
    }
}
