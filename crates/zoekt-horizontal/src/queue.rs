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

//! Priority reordering of batches streamed from many endpoints.
//!
//! Every shard streams its batches in descending priority and reports an
//! upper bound on what it may still send. The queue holds batches back until
//! no endpoint can produce anything ranked higher, which yields a globally
//! ordered stream. Depth, match and size limits bound the memory spent
//! waiting for slow endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::config::HorizontalConfig;
use crate::metrics::Metrics;
use crate::streamer::Sender;
use crate::types::{SearchResult, Stats};

/// Per-request aggregation strategy fed by the per-endpoint stream tasks.
pub(crate) trait StreamAggregator: Send + Sync {
    fn send(&self, endpoint: &str, result: SearchResult);

    /// `endpoint` will not send anything more.
    fn send_done(&self, endpoint: &str);

    /// Emit everything still held. Called once all endpoints are done.
    fn flush(&self);
}

struct QueueItem {
    result: SearchResult,
    match_count: usize,
    size_bytes: u64,
}

impl QueueItem {
    fn priority(&self) -> f64 {
        self.result.progress.priority
    }
}

/// Binary max-heap keyed on batch priority.
#[derive(Default)]
struct PriorityHeap {
    items: Vec<QueueItem>,
}

impl PriorityHeap {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn above(&self, i: usize, j: usize) -> bool {
        self.items[i].priority() > self.items[j].priority()
    }

    fn push(&mut self, item: QueueItem) {
        self.items.push(item);
        let mut i = self.items.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.above(i, parent) {
                break;
            }
            self.items.swap(i, parent);
            i = parent;
        }
    }

    fn pop(&mut self) -> Option<QueueItem> {
        if self.items.is_empty() {
            return None;
        }
        let top = self.items.swap_remove(0);
        let n = self.items.len();
        let mut i = 0;
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut largest = i;
            if l < n && self.above(l, largest) {
                largest = l;
            }
            if r < n && self.above(r, largest) {
                largest = r;
            }
            if largest == i {
                break;
            }
            self.items.swap(i, largest);
            i = largest;
        }
        Some(top)
    }

    fn top_priority(&self) -> Option<f64> {
        self.items.first().map(QueueItem::priority)
    }
}

/// Holds batches until they can be emitted in global priority order.
pub struct ResultQueue {
    heap: PriorityHeap,
    max_queue_depth: usize,
    max_match_count: i64,
    max_size_bytes: i64,
    /// Upper bound on the priority each unfinished endpoint may still send.
    endpoint_max_pending: HashMap<String, f64>,
    /// Stats received but not yet attached to an emitted batch.
    stats: Stats,
    match_count: usize,
    size_bytes: u64,
    metrics: Arc<dyn Metrics>,
}

impl ResultQueue {
    /// Every endpoint starts unbounded, so nothing is emitted in order until
    /// each endpoint has reported at least once or finished.
    pub fn new(config: &HorizontalConfig, endpoints: &[String], metrics: Arc<dyn Metrics>) -> Self {
        let endpoint_max_pending = endpoints
            .iter()
            .map(|e| (e.clone(), f64::INFINITY))
            .collect();
        Self {
            heap: PriorityHeap::default(),
            max_queue_depth: config.max_queue_depth,
            max_match_count: config.max_match_count,
            max_size_bytes: config.max_size_bytes,
            endpoint_max_pending,
            stats: Stats::default(),
            match_count: 0,
            size_bytes: 0,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() == 0
    }

    pub fn enqueue(&mut self, endpoint: &str, result: SearchResult) {
        self.stats.add(&result.stats);
        let match_count = result.stats.match_count;
        self.match_count += match_count;
        self.endpoint_max_pending
            .insert(endpoint.to_string(), result.progress.max_pending_priority);

        if !result.files.is_empty() {
            let size_bytes = result.size_bytes();
            self.size_bytes += size_bytes;
            self.heap.push(QueueItem {
                result,
                match_count,
                size_bytes,
            });
        }
        self.observe();
    }

    pub fn done(&mut self, endpoint: &str) {
        self.endpoint_max_pending.remove(endpoint);
    }

    /// Emit every batch that can no longer be outranked, plus as many as
    /// needed to get back under the configured limits.
    pub fn flush_ready(&mut self, sender: &dyn Sender) {
        let bound = self
            .endpoint_max_pending
            .values()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        while self.has_results_to_send(bound) {
            self.pop(sender);
        }
    }

    fn has_results_to_send(&self, bound: f64) -> bool {
        let Some(top) = self.heap.top_priority() else {
            return false;
        };
        if self.heap.len() > self.max_queue_depth {
            return true;
        }
        if self.max_match_count >= 0 && self.match_count as i64 > self.max_match_count {
            return true;
        }
        if self.max_size_bytes >= 0 && self.size_bytes as i64 > self.max_size_bytes {
            return true;
        }
        top >= bound
    }

    fn pop(&mut self, sender: &dyn Sender) {
        let Some(item) = self.heap.pop() else {
            return;
        };
        self.match_count = self.match_count.saturating_sub(item.match_count);
        self.size_bytes = self.size_bytes.saturating_sub(item.size_bytes);

        let mut result = item.result;
        result.stats = std::mem::take(&mut self.stats);
        self.observe();
        sender.send(result);
    }

    /// Emit everything held, in priority order, then any leftover stats.
    pub fn flush_all(&mut self, sender: &dyn Sender) {
        while !self.is_empty() {
            self.pop(sender);
        }
        if !self.stats.is_zero() {
            sender.send(SearchResult {
                stats: std::mem::take(&mut self.stats),
                ..Default::default()
            });
        }
    }

    fn observe(&self) {
        self.metrics
            .reorder_queue(self.heap.len(), self.match_count, self.size_bytes);
    }
}

/// Reordering strategy for one request.
pub(crate) struct ReorderSender {
    queue: Mutex<ResultQueue>,
    sender: Arc<dyn Sender>,
    cancel_timer: Mutex<Option<oneshot::Sender<()>>>,
}

impl ReorderSender {
    /// Starts the escape-hatch timer: after twice `max_reorder_duration`
    /// everything held is flushed regardless of order.
    pub(crate) fn new(
        config: &HorizontalConfig,
        endpoints: &[String],
        sender: Arc<dyn Sender>,
        metrics: Arc<dyn Metrics>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            queue: Mutex::new(ResultQueue::new(config, endpoints, metrics)),
            sender,
            cancel_timer: Mutex::new(None),
        });

        if !config.max_reorder_duration.is_zero() {
            let (tx, rx) = oneshot::channel();
            *this.cancel_timer.lock() = Some(tx);
            let wait = config.max_reorder_duration * 2;
            let weak = Arc::downgrade(&this);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if let Some(this) = weak.upgrade() {
                            tracing::debug!(after = ?wait, "reorder timer expired, flushing queue");
                            this.queue.lock().flush_all(&*this.sender);
                        }
                    }
                    _ = rx => {}
                }
            });
        }
        this
    }
}

impl StreamAggregator for ReorderSender {
    fn send(&self, endpoint: &str, result: SearchResult) {
        let mut q = self.queue.lock();
        q.enqueue(endpoint, result);
        q.flush_ready(&*self.sender);
    }

    fn send_done(&self, endpoint: &str) {
        let mut q = self.queue.lock();
        q.done(endpoint);
        q.flush_ready(&*self.sender);
    }

    fn flush(&self) {
        if let Some(cancel) = self.cancel_timer.lock().take() {
            let _ = cancel.send(());
        }
        self.queue.lock().flush_all(&*self.sender);
    }
}
