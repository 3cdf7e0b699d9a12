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

//! Which repositories an indexer should index.
//!
//! Repositories are spread over indexers with the same endpoint map the
//! searcher uses. When membership changes a repository moves to a new
//! owner; the old owner keeps it until the new owner reports it indexed, so
//! it never drops out of search while being rebalanced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::endpoint::EndpointMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MinimalRepo {
    pub id: u32,
    pub name: String,
}

/// Reports which repositories an endpoint currently has indexed.
#[async_trait]
pub trait IndexedRepos: Send + Sync {
    async fn indexed(&self, endpoint: &str) -> Result<HashSet<u32>>;
}

pub struct Indexers {
    pub map: Arc<dyn EndpointMap>,
    pub indexed: Arc<dyn IndexedRepos>,
}

impl Indexers {
    pub fn new(map: Arc<dyn EndpointMap>, indexed: Arc<dyn IndexedRepos>) -> Self {
        Self { map, indexed }
    }

    /// True when the cluster has any indexer to assign repositories to.
    pub async fn enabled(&self) -> bool {
        matches!(self.map.endpoints().await, Ok(eps) if !eps.is_empty())
    }

    /// The repositories `hostname` should index. `indexed` holds the ids
    /// the caller has indexed right now.
    pub async fn repos_subset(
        &self,
        hostname: &str,
        indexed: &HashSet<u32>,
        repos: Vec<MinimalRepo>,
    ) -> Result<Vec<MinimalRepo>> {
        let endpoints = self.map.endpoints().await?;
        if endpoints.is_empty() {
            return Ok(repos);
        }
        let endpoint = find_endpoint(&endpoints, hostname)?;

        let names: Vec<String> = repos.iter().map(|r| r.name.clone()).collect();
        let assigned = self.map.get_many(&names).await?;

        let mut other_indexed: HashMap<String, HashSet<u32>> = HashMap::new();
        let mut subset = Vec::with_capacity(repos.len());
        for (repo, owner) in repos.into_iter().zip(assigned) {
            if owner == endpoint {
                subset.push(repo);
                continue;
            }
            if !indexed.contains(&repo.id) {
                continue;
            }

            if !other_indexed.contains_key(&owner) {
                let set = match self.indexed.indexed(&owner).await {
                    Ok(set) => set,
                    Err(e) => {
                        tracing::warn!(endpoint = %owner, error = %e, "failed to fetch indexed repos; keeping moved repos");
                        HashSet::new()
                    }
                };
                other_indexed.insert(owner.clone(), set);
            }
            let moved_and_ready = other_indexed
                .get(&owner)
                .map_or(false, |set| set.contains(&repo.id));
            if !moved_and_ready {
                tracing::debug!(repo = %repo.name, new_owner = %owner, "keeping repo until its new owner has indexed it");
                subset.push(repo);
            }
        }
        Ok(subset)
    }
}

/// Resolve `hostname` to one of `endpoints`. An exact match wins; otherwise
/// the hostname must prefix exactly one endpoint, followed by `.` or `:`.
pub fn find_endpoint(endpoints: &[String], hostname: &str) -> Result<String> {
    if hostname.is_empty() {
        bail!("hostname must be set to find this indexer's endpoint");
    }
    if let Some(ep) = endpoints.iter().find(|ep| ep.as_str() == hostname) {
        return Ok(ep.clone());
    }

    let mut found: Option<&String> = None;
    for ep in endpoints {
        let Some(rest) = ep.strip_prefix(hostname) else {
            continue;
        };
        if rest.starts_with('.') || rest.starts_with(':') {
            if let Some(prev) = found {
                bail!(
                    "hostname {:?} matches multiple endpoints: {} and {}",
                    hostname,
                    prev,
                    ep
                );
            }
            found = Some(ep);
        }
    }

    match found {
        Some(ep) => Ok(ep.clone()),
        None => bail!("hostname {:?} not found in endpoints {:?}", hostname, endpoints),
    }
}
