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

//! Test utilities and helpers for zoekt-horizontal.
//!
//! Shared fakes for shards, metrics and Redis, environment variable
//! management, and test logging setup.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use crate::errors::RolloutReason;
use crate::metrics::{CacheEvent, Metrics};
use crate::query::Query;
use crate::redis_adapter::DynRedis;
use crate::streamer::{aggregate_stream_search, Sender, Streamer};
use crate::types::{FlushReason, ListOptions, RepoList, RepoListEntry, RepoStats, SearchOptions, SearchResult};

/// Initialize tracing only once for tests so logs are visible when running
/// `cargo test -- --nocapture`. Respects RUST_LOG when set.
pub fn init_test_logging() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Saves and clears environment variables, restoring them on drop.
#[derive(Default)]
pub struct EnvGuard {
    saved: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_and_clear(&mut self, vars: &[&str]) {
        for &var in vars {
            self.saved
                .entry(var.to_string())
                .or_insert_with(|| std::env::var(var).ok());
            std::env::remove_var(var);
        }
    }

    pub fn set(&self, var: &str, value: &str) {
        std::env::set_var(var, value);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (var, value) in &self.saved {
            match value {
                Some(v) => std::env::set_var(var, v),
                None => std::env::remove_var(var),
            }
        }
    }
}

type FailFn = Arc<dyn Fn() -> anyhow::Error + Send + Sync>;

/// In-memory shard. Streams its canned batches in order and lists its
/// canned repositories.
pub struct FakeStreamer {
    name: String,
    results: Mutex<Vec<SearchResult>>,
    repos: Mutex<Vec<RepoListEntry>>,
    list_crashes: AtomicUsize,
    delay: Option<Duration>,
    fail: Mutex<Option<FailFn>>,
    search_calls: Arc<AtomicUsize>,
    list_calls: Arc<AtomicUsize>,
    lists_finished: AtomicUsize,
    close_calls: Arc<AtomicUsize>,
}

impl FakeStreamer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            results: Mutex::new(Vec::new()),
            repos: Mutex::new(Vec::new()),
            list_crashes: AtomicUsize::new(0),
            delay: None,
            fail: Mutex::new(None),
            search_calls: Arc::new(AtomicUsize::new(0)),
            list_calls: Arc::new(AtomicUsize::new(0)),
            lists_finished: AtomicUsize::new(0),
            close_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_results(self, results: Vec<SearchResult>) -> Self {
        *self.results.lock() = results;
        self
    }

    pub fn with_repos(self, repos: Vec<RepoListEntry>) -> Self {
        *self.repos.lock() = repos;
        self
    }

    /// Sleep before every batch and before answering a list.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Share call counters with the caller, e.g. across dialed clients.
    pub fn with_counters(
        mut self,
        search_calls: Arc<AtomicUsize>,
        list_calls: Arc<AtomicUsize>,
        close_calls: Arc<AtomicUsize>,
    ) -> Self {
        self.search_calls = search_calls;
        self.list_calls = list_calls;
        self.close_calls = close_calls;
        self
    }

    pub fn set_repos(&self, repos: Vec<RepoListEntry>) {
        *self.repos.lock() = repos;
    }

    pub fn set_list_crashes(&self, n: usize) {
        self.list_crashes.store(n, Ordering::SeqCst);
    }

    /// Make every following call fail after it is counted.
    pub fn fail_with<F>(&self, f: F)
    where
        F: Fn() -> anyhow::Error + Send + Sync + 'static,
    {
        *self.fail.lock() = Some(Arc::new(f));
    }

    pub fn clear_failure(&self) {
        *self.fail.lock() = None;
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Lists that got past the delay, i.e. were not cancelled.
    pub fn lists_finished(&self) -> usize {
        self.lists_finished.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn failure(&self) -> Option<anyhow::Error> {
        self.fail.lock().as_ref().map(|f| f())
    }
}

impl fmt::Display for FakeStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait]
impl Streamer for FakeStreamer {
    async fn search(&self, q: &Query, opts: &SearchOptions) -> Result<SearchResult> {
        aggregate_stream_search(self, q, opts).await
    }

    async fn stream_search(
        &self,
        _q: &Query,
        _opts: &SearchOptions,
        sender: Arc<dyn Sender>,
    ) -> Result<()> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.failure() {
            return Err(e);
        }
        let results = self.results.lock().clone();
        for sr in results {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            sender.send(sr);
        }
        Ok(())
    }

    async fn list(&self, _q: &Query, _opts: &ListOptions) -> Result<RepoList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.lists_finished.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.failure() {
            return Err(e);
        }
        let repos = self.repos.lock().clone();
        Ok(RepoList {
            stats: RepoStats {
                repos: repos.len(),
                ..Default::default()
            },
            repos,
            crashes: self.list_crashes.load(Ordering::SeqCst),
            ..Default::default()
        })
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Metrics sink that remembers what it saw.
#[derive(Default)]
pub struct RecordingMetrics {
    reorder: Mutex<(usize, usize, u64)>,
    ignored: Mutex<Vec<RolloutReason>>,
    flushes: Mutex<Vec<FlushReason>>,
    cache: Mutex<Vec<CacheEvent>>,
}

impl RecordingMetrics {
    pub fn last_reorder_queue(&self) -> (usize, usize, u64) {
        *self.reorder.lock()
    }

    pub fn ignored_errors(&self) -> Vec<RolloutReason> {
        self.ignored.lock().clone()
    }

    pub fn flushes(&self) -> Vec<FlushReason> {
        self.flushes.lock().clone()
    }

    pub fn cache_events(&self) -> Vec<CacheEvent> {
        self.cache.lock().clone()
    }
}

impl Metrics for RecordingMetrics {
    fn reorder_queue(&self, depth: usize, match_count: usize, size_bytes: u64) {
        *self.reorder.lock() = (depth, match_count, size_bytes);
    }

    fn ignored_error(&self, reason: RolloutReason) {
        self.ignored.lock().push(reason);
    }

    fn flush(&self, reason: FlushReason) {
        self.flushes.lock().push(reason);
    }

    fn list_cache(&self, event: CacheEvent) {
        self.cache.lock().push(event);
    }
}

/// In-memory stand-in for Redis hashes.
#[derive(Default)]
pub struct MockRedis {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MockRedis {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DynRedis for MockRedis {
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }
}
