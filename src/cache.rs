//! Occupancy flag cache.
//!
//! A fast, eventually consistent `space id -> occupied` view for map clients.
//! Never the source of truth: the document store is.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

use crate::model::ObjectId;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheError(pub String);

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cache error: {}", self.0)
    }
}

impl std::error::Error for CacheError {}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError(e.to_string())
    }
}

#[async_trait]
pub trait OccupancyCache: Send + Sync {
    async fn set_occupied(&self, space: ObjectId, occupied: bool) -> Result<(), CacheError>;

    /// `None` when the cache has never heard of the space.
    async fn occupied(&self, space: ObjectId) -> Result<Option<bool>, CacheError>;
}

fn cache_key(space: ObjectId) -> String {
    format!("occupied:{space}")
}

#[derive(Default)]
pub struct MemoryCache {
    flags: DashMap<ObjectId, bool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OccupancyCache for MemoryCache {
    async fn set_occupied(&self, space: ObjectId, occupied: bool) -> Result<(), CacheError> {
        self.flags.insert(space, occupied);
        Ok(())
    }

    async fn occupied(&self, space: ObjectId) -> Result<Option<bool>, CacheError> {
        Ok(self.flags.get(&space).map(|v| *v))
    }
}

/// Redis-backed flags, `SET occupied:<id> true|false`.
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    /// Short timeout and a single retry: a slow cache must not hold up fan-out.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager_with_config(config).await?;
        tracing::info!("occupancy cache: redis at {url}");
        Ok(Self { connection })
    }
}

#[async_trait]
impl OccupancyCache for RedisCache {
    async fn set_occupied(&self, space: ObjectId, occupied: bool) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(cache_key(space))
            .arg(if occupied { "true" } else { "false" })
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn occupied(&self, space: ObjectId) -> Result<Option<bool>, CacheError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(cache_key(space))
            .query_async(&mut conn)
            .await?;
        Ok(value.map(|v| v == "true"))
    }
}
