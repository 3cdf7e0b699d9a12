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

//! Observation sink handed to constructors. There is no process-wide
//! registry; wire an implementation to whatever exporter the host uses.

use crate::errors::RolloutReason;
use crate::types::FlushReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEvent {
    /// Fresh entry served.
    Hit,
    /// Stale entry served while a background refresh runs.
    Stale,
    /// The underlying list call was made.
    Refresh,
}

pub trait Metrics: Send + Sync {
    /// Reorder queue state after every change.
    fn reorder_queue(&self, _depth: usize, _match_count: usize, _size_bytes: u64) {}

    /// An endpoint error was swallowed as a rollout error.
    fn ignored_error(&self, _reason: RolloutReason) {}

    /// A collected aggregate was flushed.
    fn flush(&self, _reason: FlushReason) {}

    fn list_cache(&self, _event: CacheEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}
