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

//! Capability seams between the aggregator and the shards it talks to.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::query::Query;
use crate::types::{ListOptions, RepoList, SearchOptions, SearchResult};

/// Receives streamed batches. Implementations must not block: senders are
/// called while aggregation state is locked.
pub trait Sender: Send + Sync {
    fn send(&self, result: SearchResult);
}

impl<F> Sender for F
where
    F: Fn(SearchResult) + Send + Sync,
{
    fn send(&self, result: SearchResult) {
        self(result)
    }
}

/// A searchable endpoint: a single shard client, a cache in front of one, or
/// another aggregator.
#[async_trait]
pub trait Streamer: Send + Sync + fmt::Display {
    async fn search(&self, q: &Query, opts: &SearchOptions) -> Result<SearchResult>;

    async fn stream_search(
        &self,
        q: &Query,
        opts: &SearchOptions,
        sender: Arc<dyn Sender>,
    ) -> Result<()>;

    async fn list(&self, q: &Query, opts: &ListOptions) -> Result<RepoList>;

    async fn close(&self);
}

/// Builds a client for a newly discovered endpoint.
pub trait Dialer: Send + Sync {
    fn dial(&self, endpoint: &str) -> Arc<dyn Streamer>;
}

impl<F> Dialer for F
where
    F: Fn(&str) -> Arc<dyn Streamer> + Send + Sync,
{
    fn dial(&self, endpoint: &str) -> Arc<dyn Streamer> {
        self(endpoint)
    }
}

/// Run `stream_search` and fold every event into one batch. `stats.duration`
/// is the wall time of the whole call.
pub async fn aggregate_stream_search<S>(
    streamer: &S,
    q: &Query,
    opts: &SearchOptions,
) -> Result<SearchResult>
where
    S: Streamer + ?Sized,
{
    let start = Instant::now();
    let aggregate = Arc::new(Mutex::new(SearchResult::default()));

    let sink = aggregate.clone();
    let sender: Arc<dyn Sender> = Arc::new(move |event: SearchResult| {
        sink.lock().absorb(event);
    });

    streamer.stream_search(q, opts, sender).await?;

    let mut result = std::mem::take(&mut *aggregate.lock());
    result.stats.duration = start.elapsed();
    Ok(result)
}
