// Copyright 2025 HyperZoekt Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cluster membership published in Redis by indexer nodes.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config as RedisConfig, Pool};

use crate::endpoint::{EndpointMap, HashRing};

/// Hash that indexers register themselves in: node id => JSON with an
/// `endpoint` field.
pub const INDEXERS_KEY: &str = "zoekt:indexers";

#[async_trait]
pub trait DynRedis: Send + Sync {
    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, String)>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;
}

pub struct RealRedis {
    pub pool: Pool,
}

impl RealRedis {
    pub fn from_url(url: &str) -> Result<Self> {
        let pool = RedisConfig::from_url(url)
            .create_pool(None)
            .map_err(|e| anyhow!("creating redis pool for {}: {}", url, e))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> anyhow::Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| anyhow!(e.to_string()))
    }
}

#[async_trait]
impl DynRedis for RealRedis {
    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, String)> = conn
            .hgetall(key)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok(entries)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(key, field, value)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok(())
    }
}

/// Endpoint map read fresh from Redis on every call, so membership changes
/// are picked up by the next request.
pub struct RedisEndpointMap {
    redis: Arc<dyn DynRedis>,
    key: String,
}

impl RedisEndpointMap {
    pub fn new(redis: Arc<dyn DynRedis>) -> Self {
        Self::with_key(redis, INDEXERS_KEY)
    }

    pub fn with_key(redis: Arc<dyn DynRedis>, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    /// Publish `endpoint` for `node_id`, the way an indexer registers itself.
    pub async fn register(&self, node_id: &str, endpoint: &str) -> Result<()> {
        let blob = serde_json::json!({ "endpoint": endpoint }).to_string();
        self.redis.hset(&self.key, node_id, &blob).await
    }

    async fn ring(&self) -> Result<HashRing> {
        Ok(HashRing::new(self.endpoints().await?))
    }
}

#[async_trait]
impl EndpointMap for RedisEndpointMap {
    async fn endpoints(&self) -> Result<Vec<String>> {
        let entries = self.redis.hgetall(&self.key).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (node_id, blob) in entries {
            match serde_json::from_str::<serde_json::Value>(&blob) {
                Ok(v) => match v.get("endpoint").and_then(|e| e.as_str()) {
                    Some(ep) => out.push(ep.to_string()),
                    None => tracing::debug!(node_id = %node_id, "indexer entry has no endpoint"),
                },
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "skipping malformed indexer entry")
                }
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.ring().await?.lookup(key).map(str::to_string)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<String>> {
        let ring = self.ring().await?;
        keys.iter()
            .map(|k| ring.lookup(k).map(str::to_string))
            .collect()
    }
}
