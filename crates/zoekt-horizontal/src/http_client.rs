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

//! Shard client speaking JSON over HTTP.
//!
//! A shard serves three routes:
//!
//! - `POST /api/search`: one `SearchResult` for the whole search
//! - `POST /api/stream`: newline-delimited `SearchResult` batches
//! - `POST /api/list`: a `RepoList`
//!
//! Search bodies are `{"query": .., "options": ..}`; list bodies use the same
//! shape with `ListOptions`.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cached::CachedSearcher;
use crate::config::{HorizontalConfig, Transport};
use crate::errors::TransportError;
use crate::metrics::Metrics;
use crate::query::Query;
use crate::streamer::{Dialer, Sender, Streamer};
use crate::types::{ListOptions, RepoList, SearchOptions, SearchResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct RequestBody<'a, O: Serialize> {
    query: &'a Query,
    options: &'a O,
}

pub struct HttpStreamer {
    endpoint: String,
    base_url: String,
    client: Client,
    transport: Transport,
}

impl HttpStreamer {
    /// `endpoint` is `host:port` or a full `http(s)://` URL.
    pub fn new(endpoint: &str, client: Client, transport: Transport) -> Self {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        Self {
            endpoint: endpoint.to_string(),
            base_url,
            client,
            transport,
        }
    }

    fn host(&self) -> String {
        let rest = self
            .base_url
            .split_once("://")
            .map_or(self.base_url.as_str(), |(_, r)| r);
        let authority = rest.split('/').next().unwrap_or(rest);
        authority
            .rsplit_once(':')
            .map_or(authority, |(h, _)| h)
            .to_string()
    }

    async fn post<O: Serialize>(
        &self,
        path: &str,
        q: &Query,
        options: &O,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(&RequestBody { query: q, options })
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                addr: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            }
            .into());
        }
        tracing::debug!(endpoint = %self.endpoint, path, status = %status, "shard responded");
        Ok(resp)
    }

    async fn post_json<O: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        q: &Query,
        options: &O,
    ) -> Result<T> {
        let resp = self.post(path, q, options).await?;
        let bytes = resp.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            TransportError::Decode {
                addr: self.endpoint.clone(),
                message: e.to_string(),
            }
            .into()
        })
    }

    fn decode_line(&self, line: &[u8]) -> Result<SearchResult> {
        serde_json::from_slice(line).map_err(|e| {
            TransportError::Decode {
                addr: self.endpoint.clone(),
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Map a reqwest failure onto a typed transport error so callers can
    /// recognise endpoints that are going away.
    fn classify(&self, e: reqwest::Error) -> anyhow::Error {
        let addr = self.endpoint.clone();
        if e.is_connect() {
            if chain_mentions(&e, "dns error") || chain_mentions(&e, "failed to lookup address") {
                return TransportError::Dns { host: self.host() }.into();
            }
            let kind = if e.is_timeout() {
                io::ErrorKind::TimedOut
            } else if let Some(kind) = find_io_kind(&e) {
                kind
            } else if chain_mentions(&e, "refused") {
                io::ErrorKind::ConnectionRefused
            } else {
                io::ErrorKind::Other
            };
            return TransportError::Dial {
                addr,
                source: io::Error::new(kind, e.to_string()),
            }
            .into();
        }
        if e.is_timeout() {
            return anyhow!("request to {} timed out: {}", addr, e);
        }
        if e.is_decode() {
            return TransportError::Decode {
                addr,
                message: e.to_string(),
            }
            .into();
        }
        if e.is_body() || e.is_request() {
            let kind = find_io_kind(&e).unwrap_or(io::ErrorKind::ConnectionReset);
            return TransportError::Read {
                addr,
                source: io::Error::new(kind, e.to_string()),
            }
            .into();
        }
        anyhow::Error::new(e).context(format!("request to {}", addr))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end.max(start)]
}

fn find_io_kind(e: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = cur {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        cur = err.source();
    }
    None
}

fn chain_mentions(e: &(dyn StdError + 'static), needle: &str) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = cur {
        if err.to_string().contains(needle) {
            return true;
        }
        cur = err.source();
    }
    false
}

impl fmt::Display for HttpStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint)
    }
}

#[async_trait]
impl Streamer for HttpStreamer {
    async fn search(&self, q: &Query, opts: &SearchOptions) -> Result<SearchResult> {
        self.post_json("/api/search", q, opts).await
    }

    async fn stream_search(
        &self,
        q: &Query,
        opts: &SearchOptions,
        sender: Arc<dyn Sender>,
    ) -> Result<()> {
        if self.transport == Transport::Json {
            let sr = self.search(q, opts).await?;
            sender.send(sr);
            return Ok(());
        }

        let mut resp = self.post("/api/stream", q, opts).await?;
        let mut buf: Vec<u8> = Vec::new();
        let mut batches = 0usize;
        while let Some(chunk) = resp.chunk().await.map_err(|e| self.classify(e))? {
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = trim_line(&line);
                if line.is_empty() {
                    continue;
                }
                sender.send(self.decode_line(line)?);
                batches += 1;
            }
        }
        let tail = trim_line(&buf);
        if !tail.is_empty() {
            sender.send(self.decode_line(tail)?);
            batches += 1;
        }
        tracing::debug!(endpoint = %self.endpoint, batches, "stream finished");
        Ok(())
    }

    async fn list(&self, q: &Query, opts: &ListOptions) -> Result<RepoList> {
        self.post_json("/api/list", q, opts).await
    }

    async fn close(&self) {
        tracing::debug!(endpoint = %self.endpoint, "closing http client");
    }
}

/// A dialer sharing one connection pool across endpoints. Every client is
/// wrapped in a list cache.
pub fn http_dialer(config: &HorizontalConfig, metrics: Arc<dyn Metrics>) -> Result<Arc<dyn Dialer>> {
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(config.request_timeout)
        .build()?;
    let transport = config.transport;
    let ttl = config.list_ttl;
    let jitter = config.list_jitter();

    let dialer = move |endpoint: &str| -> Arc<dyn Streamer> {
        let http = Arc::new(HttpStreamer::new(endpoint, client.clone(), transport));
        Arc::new(CachedSearcher::new(http, ttl, jitter, metrics.clone()))
    };
    Ok(Arc::new(dialer))
}
