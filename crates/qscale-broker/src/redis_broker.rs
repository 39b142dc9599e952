//! Redis broker.
//!
//! Queue depth is `LLEN <topic>`, a shutdown signal is
//! `LPUSH death-<topic> {"kill":"true"}`, and liveness is `PING`.
//! The connection is a [`ConnectionManager`], which reconnects on its own
//! after transport errors; every call is additionally bounded by a
//! response timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo};
use tracing::{debug, warn};

use crate::client::{
    Broker, BrokerConnector, DEATH_MARKER, ResolvedBroker, ResolvedSettings, death_queue,
};
use crate::error::{BrokerError, BrokerResult};

pub struct RedisBroker {
    conn: ConnectionManager,
    endpoint: String,
    response_timeout: Duration,
}

impl RedisBroker {
    /// Connect to `host:port`, selecting `db` and authenticating if a
    /// password is given.
    pub async fn connect(
        host: &str,
        port: u16,
        db: i64,
        password: Option<&str>,
        response_timeout: Duration,
    ) -> BrokerResult<Self> {
        let endpoint = format!("{host}:{port}/{db}");
        let mut info = (host.to_string(), port)
            .into_connection_info()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info.redis.db = db;
        info.redis.password = password.map(str::to_string);

        let client = redis::Client::open(info)?;
        let conn = tokio::time::timeout(response_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                BrokerError::Connection(format!(
                    "connecting to {endpoint} timed out after {response_timeout:?}"
                ))
            })??;

        debug!(%endpoint, "redis broker connected");
        Ok(Self {
            conn,
            endpoint,
            response_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> BrokerResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.response_timeout, fut).await {
            Ok(result) => result.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::Connection(format!(
                "{op} on {} timed out after {:?}",
                self.endpoint, self.response_timeout
            ))),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn queue_length(&self, topic: &str) -> BrokerResult<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = self.bounded("LLEN", conn.llen(topic)).await?;
        u64::try_from(len).map_err(|_| {
            BrokerError::Protocol(format!("LLEN {topic} returned negative length {len}"))
        })
    }

    async fn signal_graceful_shutdown(&self, topic: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let queue = death_queue(topic);
        self.bounded("LPUSH", conn.lpush::<_, _, ()>(&queue, DEATH_MARKER))
            .await
    }

    async fn is_connected(&self) -> bool {
        let mut conn = self.conn.clone();
        let ping = redis::cmd("PING");
        match self
            .bounded("PING", ping.query_async::<_, String>(&mut conn))
            .await
        {
            Ok(reply) => reply == "PONG",
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "redis ping failed");
                false
            }
        }
    }
}

/// Connector for [`ResolvedSettings::Redis`].
#[derive(Debug, Clone)]
pub struct RedisConnector {
    response_timeout: Duration,
}

impl RedisConnector {
    pub fn new(response_timeout: Duration) -> Self {
        Self { response_timeout }
    }
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self, broker: &ResolvedBroker) -> BrokerResult<Arc<dyn Broker>> {
        match &broker.settings {
            ResolvedSettings::Redis {
                host,
                port,
                db,
                password,
            } => {
                let client = RedisBroker::connect(
                    host,
                    *port,
                    *db,
                    password.as_deref(),
                    self.response_timeout,
                )
                .await?;
                Ok(Arc::new(client))
            }
        }
    }
}
