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

//! Endpoint discovery and key-to-endpoint assignment.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Virtual nodes placed on the ring per endpoint.
const VNODES_PER_ENDPOINT: usize = 50;

/// Live membership of the search cluster.
#[async_trait]
pub trait EndpointMap: Send + Sync {
    /// Every endpoint currently in the cluster.
    async fn endpoints(&self) -> Result<Vec<String>>;

    /// The endpoint `key` is assigned to.
    async fn get(&self, key: &str) -> Result<String>;

    /// Assign many keys at once; `result[i]` belongs to `keys[i]`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            out.push(self.get(k).await?);
        }
        Ok(out)
    }
}

fn hash_key(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buf)
}

/// Consistent hash ring. Adding or removing one endpoint only moves the keys
/// that hashed next to its virtual nodes.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Sorted by hash.
    points: Vec<(u64, usize)>,
    nodes: Vec<String>,
}

impl HashRing {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<String> = endpoints.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();

        let mut points = Vec::with_capacity(nodes.len() * VNODES_PER_ENDPOINT);
        for (idx, node) in nodes.iter().enumerate() {
            for v in 0..VNODES_PER_ENDPOINT {
                points.push((hash_key(&format!("{}-{}", node, v)), idx));
            }
        }
        points.sort_unstable();
        Self { points, nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.nodes
    }

    /// First virtual node clockwise from the key's hash.
    pub fn lookup(&self, key: &str) -> Result<&str> {
        if self.points.is_empty() {
            return Err(anyhow!("no endpoints available for key {:?}", key));
        }
        let h = hash_key(key);
        let i = self.points.partition_point(|(p, _)| *p < h);
        let (_, node) = self.points[i % self.points.len()];
        Ok(&self.nodes[node])
    }
}

/// An endpoint map over a fixed list that can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticEndpointMap {
    ring: RwLock<HashRing>,
}

impl StaticEndpointMap {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ring: RwLock::new(HashRing::new(endpoints)),
        }
    }

    pub fn set_endpoints<I, S>(&self, endpoints: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ring = HashRing::new(endpoints);
        tracing::info!(endpoints = ?ring.endpoints(), "endpoint map updated");
        *self.ring.write() = ring;
    }
}

#[async_trait]
impl EndpointMap for StaticEndpointMap {
    async fn endpoints(&self) -> Result<Vec<String>> {
        Ok(self.ring.read().endpoints().to_vec())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.ring.read().lookup(key).map(str::to_string)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<String>> {
        let ring = self.ring.read();
        keys.iter()
            .map(|k| ring.lookup(k).map(str::to_string))
            .collect()
    }
}
