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

//! Fan-out search over every endpoint in the cluster.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::HorizontalConfig;
use crate::dedup::Dedupper;
use crate::endpoint::EndpointMap;
use crate::errors::{crash_event, rollout_reason};
use crate::flush_collect::FlushCollectSender;
use crate::metrics::Metrics;
use crate::query::Query;
use crate::queue::{ReorderSender, StreamAggregator};
use crate::streamer::{aggregate_stream_search, Dialer, Sender, Streamer};
use crate::types::{ListOptions, RepoList, SearchOptions, SearchResult};

type ClientMap = HashMap<String, Arc<dyn Streamer>>;

/// Aborts per-endpoint tasks if the request is dropped before they finish.
struct AbortOnDrop<T>(Vec<JoinHandle<T>>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        for h in &self.0 {
            h.abort();
        }
    }
}

/// Searches every endpoint of an `EndpointMap` and merges the results into
/// one stream. Clients are dialed lazily and kept until their endpoint
/// leaves the map.
pub struct HorizontalSearcher {
    map: Arc<dyn EndpointMap>,
    dialer: Arc<dyn Dialer>,
    config: HorizontalConfig,
    metrics: Arc<dyn Metrics>,
    clients: RwLock<Arc<ClientMap>>,
}

impl HorizontalSearcher {
    pub fn new(
        map: Arc<dyn EndpointMap>,
        dialer: Arc<dyn Dialer>,
        config: HorizontalConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            map,
            dialer,
            config,
            metrics,
            clients: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// The clients for the current membership. Dials new endpoints and
    /// closes clients whose endpoint went away.
    async fn searchers(&self) -> Result<Arc<ClientMap>> {
        let mut endpoints = self.map.endpoints().await?;
        endpoints.sort();
        endpoints.dedup();

        {
            let clients = self.clients.read();
            if same_endpoints(&clients, &endpoints) {
                return Ok(clients.clone());
            }
        }

        let (current, removed) = {
            let mut clients = self.clients.write();
            if same_endpoints(&clients, &endpoints) {
                return Ok(clients.clone());
            }

            let mut next = ClientMap::with_capacity(endpoints.len());
            for ep in &endpoints {
                let client = match clients.get(ep) {
                    Some(c) => c.clone(),
                    None => {
                        tracing::info!(endpoint = %ep, "dialing new endpoint");
                        self.dialer.dial(ep)
                    }
                };
                next.insert(ep.clone(), client);
            }
            let removed: Vec<(String, Arc<dyn Streamer>)> = clients
                .iter()
                .filter(|(ep, _)| !next.contains_key(*ep))
                .map(|(ep, c)| (ep.clone(), c.clone()))
                .collect();

            *clients = Arc::new(next);
            (clients.clone(), removed)
        };

        for (ep, client) in removed {
            tracing::info!(endpoint = %ep, "closing client for removed endpoint");
            client.close().await;
        }
        Ok(current)
    }

    fn aggregator(
        &self,
        opts: &SearchOptions,
        endpoints: &[String],
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn StreamAggregator> {
        if opts.use_document_ranks {
            FlushCollectSender::new(
                opts,
                endpoints,
                self.config.flush_collect_max_size_bytes,
                sender,
                self.metrics.clone(),
            )
        } else {
            ReorderSender::new(&self.config, endpoints, sender, self.metrics.clone())
        }
    }
}

fn same_endpoints(clients: &ClientMap, endpoints: &[String]) -> bool {
    clients.len() == endpoints.len() && endpoints.iter().all(|ep| clients.contains_key(ep))
}

impl fmt::Display for HorizontalSearcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clients = self.clients.read();
        let mut eps: Vec<&String> = clients.keys().collect();
        eps.sort();
        write!(f, "HorizontalSearcher{{{:?}}}", eps)
    }
}

#[async_trait]
impl Streamer for HorizontalSearcher {
    async fn search(&self, q: &Query, opts: &SearchOptions) -> Result<SearchResult> {
        aggregate_stream_search(self, q, opts).await
    }

    async fn stream_search(
        &self,
        q: &Query,
        opts: &SearchOptions,
        sender: Arc<dyn Sender>,
    ) -> Result<()> {
        let start = Instant::now();
        let clients = self.searchers().await?;
        let endpoints: Vec<String> = clients.keys().cloned().collect();

        let aggregator = self.aggregator(opts, &endpoints, sender);
        let dedupper = Arc::new(Mutex::new(Dedupper::new()));
        let (done_tx, mut done_rx) = mpsc::channel::<(String, Result<()>)>(endpoints.len().max(1));

        let mut tasks = AbortOnDrop(Vec::with_capacity(clients.len()));
        for (ep, client) in clients.iter() {
            let ep = ep.clone();
            let client = client.clone();
            let aggregator = aggregator.clone();
            let dedupper = dedupper.clone();
            let done_tx = done_tx.clone();
            let metrics = self.metrics.clone();
            let q = q.clone();
            let opts = opts.clone();

            tasks.0.push(tokio::spawn(async move {
                let per_endpoint: Arc<dyn Sender> = {
                    let ep = ep.clone();
                    let aggregator = aggregator.clone();
                    Arc::new(move |mut sr: SearchResult| {
                        let files = std::mem::take(&mut sr.files);
                        sr.files = dedupper.lock().dedup(&ep, files);
                        aggregator.send(&ep, sr);
                    })
                };

                let mut res = client.stream_search(&q, &opts, per_endpoint).await;
                if let Err(e) = &res {
                    if let Some(reason) = rollout_reason(e) {
                        tracing::warn!(endpoint = %ep, reason = %reason, error = %e, "ignoring rollout error");
                        metrics.ignored_error(reason);
                        aggregator.send(&ep, crash_event());
                        res = Ok(());
                    }
                }
                aggregator.send_done(&ep);
                let _ = done_tx.send((ep, res)).await;
            }));
        }
        drop(done_tx);

        let mut first_err: Option<anyhow::Error> = None;
        for _ in 0..endpoints.len() {
            let Some((ep, res)) = done_rx.recv().await else {
                break;
            };
            if let Err(e) = res {
                if first_err.is_none() {
                    first_err = Some(e.context(format!("searching {}", ep)));
                } else {
                    tracing::warn!(endpoint = %ep, error = %e, "additional endpoint error");
                }
            }
        }
        aggregator.flush();

        tracing::debug!(
            endpoints = endpoints.len(),
            elapsed = ?start.elapsed(),
            "horizontal stream search finished"
        );
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn list(&self, q: &Query, opts: &ListOptions) -> Result<RepoList> {
        let clients = self.searchers().await?;

        let mut names = Vec::with_capacity(clients.len());
        let mut tasks = AbortOnDrop(Vec::with_capacity(clients.len()));
        for (ep, client) in clients.iter() {
            let client = client.clone();
            let q = q.clone();
            let opts = opts.clone();
            names.push(ep.clone());
            tasks
                .0
                .push(tokio::spawn(async move { client.list(&q, &opts).await }));
        }

        let mut aggregate = RepoList::default();
        let mut first_err: Option<anyhow::Error> = None;
        for (ep, handle) in names.iter().zip(tasks.0.iter_mut()) {
            let res = match handle.await {
                Ok(res) => res,
                Err(join) => Err(anyhow!("list task failed: {}", join)),
            };
            match res {
                Ok(list) => aggregate.merge(list),
                Err(e) => {
                    if let Some(reason) = rollout_reason(&e) {
                        tracing::warn!(endpoint = %ep, reason = %reason, error = %e, "ignoring rollout error");
                        self.metrics.ignored_error(reason);
                        aggregate.crashes += 1;
                    } else if first_err.is_none() {
                        first_err = Some(e.context(format!("listing {}", ep)));
                    } else {
                        tracing::warn!(endpoint = %ep, error = %e, "additional endpoint error");
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(aggregate),
        }
    }

    async fn close(&self) {
        let clients = std::mem::take(&mut *self.clients.write());
        for (ep, client) in clients.iter() {
            tracing::debug!(endpoint = %ep, "closing client");
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::StaticEndpointMap;
    use crate::metrics::NoopMetrics;
    use crate::test_utils::{init_test_logging, FakeStreamer};
    use std::time::Duration;

    #[tokio::test]
    async fn no_endpoints_is_an_empty_result() {
        init_test_logging();
        tracing::info!("TEST START: horizontal::tests::no_endpoints_is_an_empty_result");
        let dialer: Arc<dyn Dialer> =
            Arc::new(|ep: &str| -> Arc<dyn Streamer> { Arc::new(FakeStreamer::new(ep)) });
        let hs = HorizontalSearcher::new(
            Arc::new(StaticEndpointMap::new(Vec::<String>::new())),
            dialer,
            HorizontalConfig::default(),
            Arc::new(NoopMetrics),
        );
        let sr = hs
            .search(&Query::substring("x"), &SearchOptions::default())
            .await
            .unwrap();
        assert!(sr.files.is_empty());
        let rl = hs.list(&Query::all(), &ListOptions::default()).await.unwrap();
        assert!(rl.repos.is_empty());
        assert_eq!(hs.to_string(), "HorizontalSearcher{[]}");
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_list_aborts_endpoint_tasks() {
        init_test_logging();
        tracing::info!("TEST START: horizontal::tests::dropped_list_aborts_endpoint_tasks");
        let fake = Arc::new(FakeStreamer::new("slow").with_delay(Duration::from_secs(1)));
        let dialer: Arc<dyn Dialer> = {
            let fake = fake.clone();
            Arc::new(move |_ep: &str| -> Arc<dyn Streamer> { fake.clone() })
        };
        let hs = HorizontalSearcher::new(
            Arc::new(StaticEndpointMap::new(vec!["slow:6070".to_string()])),
            dialer,
            HorizontalConfig::default(),
            Arc::new(NoopMetrics),
        );

        let res = tokio::time::timeout(
            Duration::from_millis(100),
            hs.list(&Query::all(), &ListOptions::default()),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(fake.list_calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fake.lists_finished(), 0, "endpoint list kept running");
    }
}
