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

//! Horizontal search over a cluster of zoekt replicas.
//!
//! Every replica indexes a subset of the repositories. A search fans out to
//! all of them and their streams are merged back into one:
//! - `HorizontalSearcher` dials each endpoint of an `EndpointMap`, dedups
//!   repositories that more than one replica reports, and merges batches in
//!   global score order (or collects and ranks them when document ranks are
//!   requested)
//! - `CachedSearcher` keeps "list everything" answers warm per shard
//! - `Indexers` decides which repositories a replica should index
//! - `ConfigFingerprint` lets indexers skip work when search config did not
//!   change

pub mod cached;
mod config;
pub mod dedup;
pub mod endpoint;
pub mod errors;
pub mod fingerprint;
pub mod flush_collect;
pub mod horizontal;
pub mod http_client;
pub mod indexers;
pub mod metrics;
pub mod query;
pub mod queue;
pub mod redis_adapter;
pub mod streamer;
pub mod test_utils;
pub mod types;

pub use cached::CachedSearcher;
pub use config::{load_config, HorizontalConfig, MergeOpts, Transport};
pub use dedup::Dedupper;
pub use endpoint::{EndpointMap, HashRing, StaticEndpointMap};
pub use errors::{RolloutReason, TransportError};
pub use fingerprint::{ConfigFingerprint, SearchSiteConfig, FINGERPRINT_HEADER};
pub use flush_collect::CollectSender;
pub use horizontal::HorizontalSearcher;
pub use http_client::{http_dialer, HttpStreamer};
pub use indexers::{find_endpoint, IndexedRepos, Indexers, MinimalRepo};
pub use metrics::{CacheEvent, Metrics, NoopMetrics};
pub use query::Query;
pub use queue::ResultQueue;
pub use redis_adapter::RedisEndpointMap;
pub use streamer::{Dialer, Sender, Streamer};
pub use types::{
    FileMatch, FlushReason, ListOptions, Progress, RepoList, RepoListEntry, Repository,
    SearchOptions, SearchResult, Stats,
};
