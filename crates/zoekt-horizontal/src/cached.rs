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

//! Stale-while-revalidate cache for listing every repository of a shard.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::metrics::{CacheEvent, Metrics};
use crate::query::Query;
use crate::streamer::{Sender, Streamer};
use crate::types::{ListOptions, RepoList, SearchOptions, SearchResult};

type Outcome = Result<RepoList, Arc<anyhow::Error>>;

struct Entry {
    /// `None` when the last refresh failed or the first one is running.
    list: Option<RepoList>,
    produced_at: Instant,
    ttl: Duration,
    refreshing: bool,
    /// Set while a caller refreshes an empty entry; others wait on it.
    pending: Option<watch::Receiver<Option<Outcome>>>,
}

/// A failed refresh, shared by every caller that waited on it.
#[derive(Debug)]
struct SharedRefreshError(Arc<anyhow::Error>);

impl fmt::Display for SharedRefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("listing repositories")
    }
}

impl StdError for SharedRefreshError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&**self.0)
    }
}

/// Owned by the caller refreshing an empty entry. If that caller is dropped
/// mid-refresh the placeholder is cleared so a waiter can take over.
struct PendingRefresh<'a> {
    inner: &'a Inner,
    opts: &'a ListOptions,
    tx: watch::Sender<Option<Outcome>>,
    finished: bool,
}

impl Drop for PendingRefresh<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(self.opts) {
            if entry.list.is_none() {
                entry.pending = None;
                entry.refreshing = false;
            }
        }
    }
}

enum Step {
    Serve(RepoList),
    Wait(watch::Receiver<Option<Outcome>>),
    Refresh(watch::Sender<Option<Outcome>>),
}

struct Inner {
    streamer: Arc<dyn Streamer>,
    ttl: Duration,
    jitter: Duration,
    metrics: Arc<dyn Metrics>,
    entries: Mutex<HashMap<ListOptions, Entry>>,
}

impl Inner {
    /// TTL drawn from `[ttl - jitter/2, ttl + jitter/2]` so that many
    /// caches started together do not refresh in lockstep.
    fn jittered_ttl(&self) -> Duration {
        let base = self.ttl.as_secs_f64();
        let half = self.jitter.as_secs_f64() / 2.0;
        let offset = rand::thread_rng().gen_range(-half..=half);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    async fn refresh(&self, q: &Query, opts: &ListOptions) -> Result<RepoList> {
        self.metrics.list_cache(CacheEvent::Refresh);
        let res = self.streamer.list(q, opts).await;

        let mut ttl = self.jittered_ttl();
        let list = match &res {
            Ok(list) => {
                if list.crashes > 0 {
                    ttl /= 4;
                }
                Some(list.clone())
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.streamer, error = %e, "list refresh failed");
                ttl /= 4;
                None
            }
        };

        self.entries.lock().insert(
            opts.clone(),
            Entry {
                list,
                produced_at: Instant::now(),
                ttl,
                refreshing: false,
                pending: None,
            },
        );
        res
    }
}

/// Caches "list everything" results of the wrapped streamer. Stale entries
/// are served while a single background refresh runs; other calls pass
/// through.
#[derive(Clone)]
pub struct CachedSearcher {
    inner: Arc<Inner>,
}

impl CachedSearcher {
    pub fn new(
        streamer: Arc<dyn Streamer>,
        ttl: Duration,
        jitter: Duration,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                streamer,
                ttl,
                jitter,
                metrics,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl fmt::Display for CachedSearcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.streamer)
    }
}

#[async_trait]
impl Streamer for CachedSearcher {
    async fn search(&self, q: &Query, opts: &SearchOptions) -> Result<SearchResult> {
        self.inner.streamer.search(q, opts).await
    }

    async fn stream_search(
        &self,
        q: &Query,
        opts: &SearchOptions,
        sender: Arc<dyn Sender>,
    ) -> Result<()> {
        self.inner.streamer.stream_search(q, opts, sender).await
    }

    async fn list(&self, q: &Query, opts: &ListOptions) -> Result<RepoList> {
        if !q.is_true_query() {
            return self.inner.streamer.list(q, opts).await;
        }

        loop {
            let step = {
                let mut entries = self.inner.entries.lock();
                match entries.get_mut(opts) {
                    Some(Entry {
                        list: Some(list),
                        produced_at,
                        ttl,
                        refreshing,
                        ..
                    }) => {
                        let stale = produced_at.elapsed() >= *ttl;
                        if stale && !*refreshing {
                            *refreshing = true;
                            let inner = self.inner.clone();
                            let q = q.clone();
                            let opts = opts.clone();
                            tokio::spawn(async move {
                                let _ = inner.refresh(&q, &opts).await;
                            });
                        }
                        let event = if stale {
                            CacheEvent::Stale
                        } else {
                            CacheEvent::Hit
                        };
                        self.inner.metrics.list_cache(event);
                        Step::Serve(list.clone())
                    }
                    Some(Entry {
                        pending: Some(rx), ..
                    }) => Step::Wait(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        entries.insert(
                            opts.clone(),
                            Entry {
                                list: None,
                                produced_at: Instant::now(),
                                ttl: Duration::ZERO,
                                refreshing: true,
                                pending: Some(rx),
                            },
                        );
                        Step::Refresh(tx)
                    }
                }
            };

            match step {
                Step::Serve(list) => return Ok(list),
                Step::Wait(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(v) => (*v).clone(),
                        Err(_) => None,
                    };
                    match outcome {
                        Some(Ok(list)) => return Ok(list),
                        Some(Err(e)) => return Err(SharedRefreshError(e).into()),
                        // the refreshing caller went away; try again
                        None => continue,
                    }
                }
                Step::Refresh(tx) => {
                    let mut pending = PendingRefresh {
                        inner: &self.inner,
                        opts,
                        tx,
                        finished: false,
                    };
                    let res = self.inner.refresh(q, opts).await;
                    pending.finished = true;
                    return match res {
                        Ok(list) => {
                            pending.tx.send_replace(Some(Ok(list.clone())));
                            Ok(list)
                        }
                        Err(e) => {
                            let e = Arc::new(e);
                            pending.tx.send_replace(Some(Err(e.clone())));
                            Err(SharedRefreshError(e).into())
                        }
                    };
                }
            }
        }
    }

    async fn close(&self) {
        self.inner.streamer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, FakeStreamer, RecordingMetrics};
    use crate::types::{RepoListEntry, Repository};

    fn repos(n: u32) -> Vec<RepoListEntry> {
        (0..n)
            .map(|i| RepoListEntry {
                repository: Repository {
                    id: i,
                    name: format!("repo-{}", i),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn serves_fresh_then_stale_then_refreshed() {
        init_test_logging();
        tracing::info!("TEST START: cached::tests::serves_fresh_then_stale_then_refreshed");
        let fake = Arc::new(FakeStreamer::new("shard").with_repos(repos(2)));
        let metrics = Arc::new(RecordingMetrics::default());
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            metrics.clone(),
        );
        let opts = ListOptions::default();

        let first = cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(first.repos.len(), 2);
        assert_eq!(fake.list_calls(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(fake.list_calls(), 1);

        fake.set_repos(repos(3));
        tokio::time::advance(Duration::from_secs(6)).await;
        let stale = cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(stale.repos.len(), 2, "stale entry is served immediately");

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fake.list_calls(), 2);
        let fresh = cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(fresh.repos.len(), 3);

        assert_eq!(
            metrics.cache_events(),
            vec![
                CacheEvent::Refresh,
                CacheEvent::Hit,
                CacheEvent::Stale,
                CacheEvent::Refresh,
                CacheEvent::Hit,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_background_refresh_per_key() {
        let fake = Arc::new(
            FakeStreamer::new("shard")
                .with_repos(repos(1))
                .with_delay(Duration::from_secs(1)),
        );
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Arc::new(RecordingMetrics::default()),
        );
        let opts = ListOptions::default();
        cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(fake.list_calls(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..5 {
            cached.list(&Query::all(), &opts).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fake.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn crashes_shorten_ttl() {
        let fake = Arc::new(FakeStreamer::new("shard").with_repos(repos(1)));
        fake.set_list_crashes(1);
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Arc::new(RecordingMetrics::default()),
        );
        let opts = ListOptions::default();
        cached.list(&Query::all(), &opts).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        cached.list(&Query::all(), &opts).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fake.list_calls(), 2, "a quarter of the ttl has passed");
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_not_served_from_cache() {
        let fake = Arc::new(FakeStreamer::new("shard").with_repos(repos(1)));
        fake.fail_with(|| anyhow::anyhow!("shard unavailable"));
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Arc::new(RecordingMetrics::default()),
        );
        let opts = ListOptions::default();
        assert!(cached.list(&Query::all(), &opts).await.is_err());

        fake.clear_failure();
        let got = cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(got.repos.len(), 1);
        assert_eq!(fake.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_by_options_and_bypassed_for_filters() {
        let fake = Arc::new(FakeStreamer::new("shard").with_repos(repos(1)));
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Arc::new(RecordingMetrics::default()),
        );
        let map_opts = ListOptions {
            field: crate::types::RepoListField::ReposMap,
        };
        cached.list(&Query::all(), &ListOptions::default()).await.unwrap();
        cached.list(&Query::all(), &map_opts).await.unwrap();
        cached.list(&Query::all(), &map_opts).await.unwrap();
        assert_eq!(fake.list_calls(), 2);

        let filtered = Query::Repo {
            pattern: "repo-0".into(),
        };
        cached.list(&filtered, &ListOptions::default()).await.unwrap();
        cached.list(&filtered, &ListOptions::default()).await.unwrap();
        assert_eq!(fake.list_calls(), 4);
        assert_eq!(cached.to_string(), "shard");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_callers_share_one_refresh() {
        init_test_logging();
        tracing::info!("TEST START: cached::tests::concurrent_cold_callers_share_one_refresh");
        let fake = Arc::new(
            FakeStreamer::new("shard")
                .with_repos(repos(4))
                .with_delay(Duration::from_secs(1)),
        );
        let metrics = Arc::new(RecordingMetrics::default());
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            metrics.clone(),
        );

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let cached = cached.clone();
                tokio::spawn(async move {
                    cached.list(&Query::all(), &ListOptions::default()).await
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().repos.len(), 4);
        }
        assert_eq!(fake.list_calls(), 1);
        assert_eq!(metrics.cache_events(), vec![CacheEvent::Refresh]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cold_callers_share_the_failure() {
        let fake = Arc::new(FakeStreamer::new("shard").with_delay(Duration::from_secs(1)));
        fake.fail_with(|| {
            crate::errors::TransportError::Dial {
                addr: "shard".into(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            }
            .into()
        });
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Arc::new(RecordingMetrics::default()),
        );

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cached = cached.clone();
                tokio::spawn(async move {
                    cached.list(&Query::all(), &ListOptions::default()).await
                })
            })
            .collect();
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert_eq!(
                crate::errors::rollout_reason(&err),
                Some(crate::errors::RolloutReason::DialRefused),
                "{:#}",
                err
            );
        }
        assert_eq!(fake.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_cold_refresh_is_taken_over() {
        let fake = Arc::new(
            FakeStreamer::new("shard")
                .with_repos(repos(2))
                .with_delay(Duration::from_secs(1)),
        );
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(10),
            Duration::ZERO,
            Arc::new(RecordingMetrics::default()),
        );
        let opts = ListOptions::default();

        let first = tokio::time::timeout(
            Duration::from_millis(100),
            cached.list(&Query::all(), &opts),
        )
        .await;
        assert!(first.is_err(), "first caller gave up");

        let got = cached.list(&Query::all(), &opts).await.unwrap();
        assert_eq!(got.repos.len(), 2);
        assert_eq!(fake.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_ttl_bounds_staleness() {
        let fake = Arc::new(FakeStreamer::new("shard").with_repos(repos(1)));
        let cached = CachedSearcher::new(
            fake.clone(),
            Duration::from_secs(16),
            Duration::from_secs(4),
            Arc::new(RecordingMetrics::default()),
        );
        let opts = ListOptions::default();
        cached.list(&Query::all(), &opts).await.unwrap();

        // ttl is somewhere in [14s, 18s]
        tokio::time::advance(Duration::from_millis(13_900)).await;
        cached.list(&Query::all(), &opts).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fake.list_calls(), 1, "still fresh before ttl - jitter/2");

        tokio::time::advance(Duration::from_millis(4_200)).await;
        cached.list(&Query::all(), &opts).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fake.list_calls(), 2, "refreshed after ttl + jitter/2");
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let inner = Inner {
            streamer: Arc::new(FakeStreamer::new("x")),
            ttl: Duration::from_secs(16),
            jitter: Duration::from_secs(4),
            metrics: Arc::new(RecordingMetrics::default()),
            entries: Mutex::new(HashMap::new()),
        };
        for _ in 0..200 {
            let ttl = inner.jittered_ttl();
            assert!(ttl >= Duration::from_secs(14) && ttl <= Duration::from_secs(18));
        }
    }
}
