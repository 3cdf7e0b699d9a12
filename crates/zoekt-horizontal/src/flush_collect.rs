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

//! Collect-then-stream aggregation for ranked searches.
//!
//! When document ranks are in use, results from different endpoints are only
//! comparable after sorting. The first batch of every endpoint is collected,
//! sorted and sent as a single ranked batch; everything afterwards streams
//! straight through.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::metrics::Metrics;
use crate::queue::StreamAggregator;
use crate::streamer::Sender;
use crate::types::{sort_files, FlushReason, SearchOptions, SearchResult};

/// Accumulates batches into one aggregate.
#[derive(Debug, Default)]
pub struct CollectSender {
    aggregate: Option<SearchResult>,
    max_doc_display_count: usize,
    size_bytes: u64,
}

impl CollectSender {
    pub fn new(max_doc_display_count: usize) -> Self {
        Self {
            aggregate: None,
            max_doc_display_count,
            size_bytes: 0,
        }
    }

    pub fn send(&mut self, result: SearchResult) {
        self.size_bytes += result.size_bytes();
        let agg = self.aggregate.get_or_insert_with(SearchResult::default);
        agg.stats.add(&result.stats);
        if !result.files.is_empty() {
            agg.files.extend(result.files);
            agg.repo_urls.extend(result.repo_urls);
            agg.line_fragments.extend(result.line_fragments);
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Take the aggregate, rank-sorted and truncated to the display count.
    /// `None` if nothing was ever sent.
    pub fn done(&mut self) -> Option<SearchResult> {
        let mut agg = self.aggregate.take()?;
        self.size_bytes = 0;
        sort_files(&mut agg.files);
        if self.max_doc_display_count > 0 {
            agg.files.truncate(self.max_doc_display_count);
        }
        Some(agg)
    }
}

struct Collecting {
    collector: CollectSender,
    /// endpoint => has sent its first non-empty batch or finished
    first_results: HashMap<String, bool>,
    overflow: Vec<SearchResult>,
    overflow_size: u64,
}

impl Collecting {
    fn all_reported(&self) -> bool {
        self.first_results.values().all(|&v| v)
    }
}

/// Collects each endpoint's first results, then streams.
pub(crate) struct FlushCollectSender {
    /// `Some` while collecting, `None` once streaming.
    state: Mutex<Option<Collecting>>,
    max_size_bytes: i64,
    sender: Arc<dyn Sender>,
    metrics: Arc<dyn Metrics>,
    cancel_timer: Mutex<Option<oneshot::Sender<()>>>,
}

impl FlushCollectSender {
    /// Collection stops at the latest after twice `opts.flush_wall_time`.
    pub(crate) fn new(
        opts: &SearchOptions,
        endpoints: &[String],
        max_size_bytes: i64,
        sender: Arc<dyn Sender>,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        let state = Collecting {
            collector: CollectSender::new(opts.max_doc_display_count),
            first_results: endpoints.iter().map(|e| (e.clone(), false)).collect(),
            overflow: Vec::new(),
            overflow_size: 0,
        };
        let this = Arc::new(Self {
            state: Mutex::new(Some(state)),
            max_size_bytes,
            sender,
            metrics,
            cancel_timer: Mutex::new(None),
        });

        if !opts.flush_wall_time.is_zero() {
            let (tx, rx) = oneshot::channel();
            *this.cancel_timer.lock() = Some(tx);
            let wait = opts.flush_wall_time * 2;
            let weak = Arc::downgrade(&this);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if let Some(this) = weak.upgrade() {
                            let mut state = this.state.lock();
                            this.stop_collecting(&mut state, FlushReason::TimerExpired);
                        }
                    }
                    _ = rx => {}
                }
            });
        }
        this
    }

    /// Send the ranked aggregate and any overflow, then switch to streaming.
    fn stop_collecting(&self, state: &mut Option<Collecting>, reason: FlushReason) {
        let Some(mut collecting) = state.take() else {
            return;
        };
        if let Some(cancel) = self.cancel_timer.lock().take() {
            let _ = cancel.send(());
        }

        tracing::debug!(reason = %reason, overflow = collecting.overflow.len(), "flushing collected results");
        self.metrics.flush(reason);
        if let Some(mut agg) = collecting.collector.done() {
            agg.stats.flush_reason = reason;
            self.sender.send(agg);
        }
        for r in collecting.overflow.drain(..) {
            self.sender.send(r);
        }
    }

    fn over_size(&self, collecting: &Collecting) -> bool {
        self.max_size_bytes >= 0
            && (collecting.collector.size_bytes() + collecting.overflow_size) as i64
                > self.max_size_bytes
    }
}

impl StreamAggregator for FlushCollectSender {
    fn send(&self, endpoint: &str, result: SearchResult) {
        let mut state = self.state.lock();
        let Some(collecting) = state.as_mut() else {
            self.sender.send(result);
            return;
        };

        let seen_first = collecting
            .first_results
            .get(endpoint)
            .copied()
            .unwrap_or(false);
        if seen_first {
            collecting.overflow_size += result.size_bytes();
            collecting.overflow.push(result);
        } else {
            let has_files = !result.files.is_empty();
            collecting.collector.send(result);
            if has_files {
                collecting.first_results.insert(endpoint.to_string(), true);
            }
        }

        if collecting.all_reported() {
            self.stop_collecting(&mut state, FlushReason::FinalFlush);
        } else if self.over_size(collecting) {
            self.stop_collecting(&mut state, FlushReason::MaxSize);
        }
    }

    fn send_done(&self, endpoint: &str) {
        let mut state = self.state.lock();
        let Some(collecting) = state.as_mut() else {
            return;
        };
        collecting.first_results.insert(endpoint.to_string(), true);
        if collecting.all_reported() {
            self.stop_collecting(&mut state, FlushReason::FinalFlush);
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        self.stop_collecting(&mut state, FlushReason::FinalFlush);
    }
}
