use async_trait::async_trait;
use tracing::debug;

use super::{KvBackend, KvError};

/// Redis (or Upstash over the Redis protocol) backend.
///
/// A connection is opened per operation, so an outage shows up as an error on
/// the call that hit it rather than at startup.
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    /// Fails only if the URL cannot be parsed.
    pub fn new(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        debug!(key, bytes = value.len(), "redis SET");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(deleted > 0)
    }
}
