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

//! Fingerprint of the search configuration an indexer last saw.
//!
//! Indexers send the fingerprint back on their next poll. If the
//! configuration is unchanged, only repositories modified since the
//! fingerprint was generated need to be considered; otherwise everything is
//! reconsidered.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeDelta, TimeZone, Timelike, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `X-Search-Config-Fingerprint`; header names are case-insensitive and
/// stored lowercase.
pub const FINGERPRINT_HEADER: &str = "x-search-config-fingerprint";

const VERSION_PREFIX: &str = "search-config-fingerprint-1";

/// Padding subtracted from `changes_since` to absorb clock skew between the
/// fingerprint's producer and the database recording repository updates.
const SKEW_PADDING_SECS: i64 = 90;

/// Configuration that affects what gets indexed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSiteConfig {
    /// repository => extra branches to index
    pub search_index_branches: BTreeMap<String, Vec<String>>,
    pub search_large_files: Vec<String>,
    pub search_index_symbols_enabled: bool,
    pub search_index_query_contexts: bool,
}

impl SearchSiteConfig {
    /// Stable hash: fixed field order and sorted maps give a canonical JSON
    /// encoding.
    pub fn hash(&self) -> u64 {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(buf)
    }
}

/// Point in time plus the configuration hash at that time. Timestamps have
/// second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigFingerprint {
    ts: DateTime<Utc>,
    hash: u64,
}

impl ConfigFingerprint {
    pub fn new(config: &SearchSiteConfig) -> Self {
        Self::new_at(config, Utc::now())
    }

    pub fn new_at(config: &SearchSiteConfig, ts: DateTime<Utc>) -> Self {
        Self {
            ts: truncate_to_secs(ts),
            hash: config.hash(),
        }
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn marshal(&self) -> String {
        format!(
            "{} {} {:x}",
            VERSION_PREFIX,
            self.ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.hash
        )
    }

    /// The empty string means no fingerprint.
    pub fn unmarshal(s: &str) -> Result<Option<Self>> {
        if s.is_empty() {
            return Ok(None);
        }
        let mut parts = s.split(' ');
        let (Some(version), Some(ts), Some(hash), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("malformed config fingerprint {:?}", s);
        };
        if version != VERSION_PREFIX {
            bail!("unsupported config fingerprint version {:?}", version);
        }
        let ts = DateTime::parse_from_rfc3339(ts)
            .with_context(|| format!("parsing config fingerprint timestamp {:?}", ts))?
            .with_timezone(&Utc);
        let hash = u64::from_str_radix(hash, 16)
            .with_context(|| format!("parsing config fingerprint hash {:?}", hash))?;
        Ok(Some(Self {
            ts: truncate_to_secs(ts),
            hash,
        }))
    }

    pub fn to_headers(&self, headers: &mut HeaderMap) -> Result<()> {
        let v = HeaderValue::from_str(&self.marshal())?;
        headers.insert(FINGERPRINT_HEADER, v);
        Ok(())
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>> {
        match headers.get(FINGERPRINT_HEADER) {
            None => Ok(None),
            Some(v) => Self::unmarshal(v.to_str().context("config fingerprint header")?),
        }
    }

    pub fn to_proto(&self) -> FingerprintProto {
        FingerprintProto {
            identifier: self.hash,
            generated_at: Some(prost_types::Timestamp {
                seconds: self.ts.timestamp(),
                nanos: 0,
            }),
        }
    }

    pub fn from_proto(p: &FingerprintProto) -> Result<Self> {
        let ts = p
            .generated_at
            .as_ref()
            .ok_or_else(|| anyhow!("config fingerprint without timestamp"))?;
        let ts = Utc
            .timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
            .single()
            .ok_or_else(|| anyhow!("invalid config fingerprint timestamp {:?}", ts))?;
        Ok(Self {
            ts: truncate_to_secs(ts),
            hash: p.identifier,
        })
    }

    pub fn same_config(a: Option<&Self>, b: Option<&Self>) -> bool {
        matches!((a, b), (Some(a), Some(b)) if a.hash == b.hash)
    }

    /// The time after which repositories must be reconsidered. `None` means
    /// everything, which is the answer whenever either side is missing or
    /// the configuration changed, or when padding the timestamp would
    /// leave the representable range.
    pub fn changes_since(a: Option<&Self>, b: Option<&Self>) -> Option<DateTime<Utc>> {
        let (a, b) = (a?, b?);
        if a.hash != b.hash {
            return None;
        }
        let older = a.ts.min(b.ts);
        older.checked_sub_signed(TimeDelta::seconds(SKEW_PADDING_SECS))
    }
}

fn truncate_to_secs(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Wire form exchanged with indexers over gRPC.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FingerprintProto {
    #[prost(uint64, tag = "1")]
    pub identifier: u64,
    #[prost(message, optional, tag = "2")]
    pub generated_at: Option<prost_types::Timestamp>,
}
