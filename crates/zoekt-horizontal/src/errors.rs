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

//! Network failures and their classification.
//!
//! While indexers roll out, endpoints disappear from DNS, refuse
//! connections or drop them mid-stream. Those failures are expected and are
//! reported to callers as crashed shards instead of failed requests.

use std::error::Error;
use std::fmt::{self, Display};
use std::io;

use crate::types::{Progress, SearchResult, Stats};

/// A typed failure talking to one endpoint.
#[derive(Debug)]
pub enum TransportError {
    /// The endpoint's host did not resolve.
    Dns { host: String },
    /// Connecting failed.
    Dial { addr: String, source: io::Error },
    /// The connection broke while reading a response.
    Read { addr: String, source: io::Error },
    /// The endpoint answered with a non-success status.
    Status {
        addr: String,
        status: u16,
        body: String,
    },
    /// The endpoint answered with something we could not parse.
    Decode { addr: String, message: String },
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Dns { host } => write!(f, "lookup {}: no such host", host),
            TransportError::Dial { addr, source } => write!(f, "dial {}: {}", addr, source),
            TransportError::Read { addr, source } => write!(f, "read {}: {}", addr, source),
            TransportError::Status { addr, status, body } => {
                write!(f, "{} returned status {}: {}", addr, status, body)
            }
            TransportError::Decode { addr, message } => {
                write!(f, "decoding response from {}: {}", addr, message)
            }
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransportError::Dial { source, .. } | TransportError::Read { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

/// Why an endpoint error was swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RolloutReason {
    DnsNotFound,
    DialTimeout,
    DialRefused,
    ReadFailed,
}

impl RolloutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutReason::DnsNotFound => "dns-not-found",
            RolloutReason::DialTimeout => "dial-timeout",
            RolloutReason::DialRefused => "dial-refused",
            RolloutReason::ReadFailed => "read-failed",
        }
    }
}

impl Display for RolloutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify `err` as an expected rollout failure. Anything not recognised,
/// including status and decode errors, returns `None` and must be surfaced.
pub fn rollout_reason(err: &anyhow::Error) -> Option<RolloutReason> {
    for cause in err.chain() {
        if let Some(te) = cause.downcast_ref::<TransportError>() {
            return match te {
                TransportError::Dns { .. } => Some(RolloutReason::DnsNotFound),
                TransportError::Dial { source, .. } => match source.kind() {
                    io::ErrorKind::TimedOut => Some(RolloutReason::DialTimeout),
                    io::ErrorKind::ConnectionRefused => Some(RolloutReason::DialRefused),
                    _ => None,
                },
                TransportError::Read { .. } => Some(RolloutReason::ReadFailed),
                TransportError::Status { .. } | TransportError::Decode { .. } => None,
            };
        }
    }
    None
}

/// The batch reported in place of an endpoint that went away: no files, one
/// crash, and a progress that never holds back ordering.
pub fn crash_event() -> SearchResult {
    SearchResult {
        stats: Stats {
            crashes: 1,
            ..Default::default()
        },
        progress: Progress {
            priority: f64::NEG_INFINITY,
            max_pending_priority: f64::NEG_INFINITY,
        },
        ..Default::default()
    }
}
