//! L1 backed by Redis. Values are JSON encoded students keyed by id.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError};
use async_trait::async_trait;

use super::{EntityCache, TierError};
use crate::entity::Entity;

fn cache(e: RedisError) -> TierError {
    TierError::Cache(e.to_string())
}

pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, TierError> {
        let client = Client::open(url).map_err(cache)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(cache)?;
        Ok(RedisCache { conn })
    }
}

#[async_trait]
impl EntityCache for RedisCache {
    async fn get(&self, id: &str) -> Result<Option<Entity>, TierError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET")
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(cache)?;
        value
            .map(|json| serde_json::from_str(&json).map_err(|e| TierError::Cache(e.to_string())))
            .transpose()
    }

    async fn set(&self, entity: &Entity, ttl: Duration) -> Result<(), TierError> {
        let json = serde_json::to_string(entity).map_err(|e| TierError::Cache(e.to_string()))?;
        let mut conn = self.conn.clone();
        ::redis::cmd("SET")
            .arg(&entity.id)
            .arg(json)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(cache)
    }

    async fn delete(&self, id: &str) -> Result<(), TierError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("DEL")
            .arg(id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(cache)
    }
}
