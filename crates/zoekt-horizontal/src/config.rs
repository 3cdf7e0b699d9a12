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

use anyhow::{bail, Result};
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

/// How a shard client talks to its endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transport {
    /// One request, one aggregated response.
    #[default]
    Json,
    /// Newline-delimited batches streamed as the shard produces them.
    NdJson,
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Transport::Json),
            "ndjson" | "stream" => Ok(Transport::NdJson),
            other => bail!("unknown transport {:?}", other),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Json => f.write_str("json"),
            Transport::NdJson => f.write_str("ndjson"),
        }
    }
}

/// Tuning for the aggregator, its shard clients and the list cache.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizontalConfig {
    /// Static endpoint list; ignored when `redis_url` is set.
    pub endpoints: Vec<String>,
    /// Read membership from the indexer registry in Redis.
    pub redis_url: Option<String>,
    /// Reorder queue flushes past this many pending batches.
    pub max_queue_depth: usize,
    /// Reorder queue flushes past this many pending matches. Negative disables.
    pub max_match_count: i64,
    /// Reorder queue flushes past this many pending bytes. Negative disables.
    pub max_size_bytes: i64,
    /// The reorder queue is force-flushed after twice this. Zero disables.
    pub max_reorder_duration: Duration,
    /// Collect phase ends once the aggregate exceeds this many bytes.
    pub flush_collect_max_size_bytes: i64,
    pub list_ttl: Duration,
    /// Defaults to a quarter of `list_ttl` when unset.
    pub list_ttl_jitter: Option<Duration>,
    pub transport: Transport,
    pub request_timeout: Duration,
}

impl Default for HorizontalConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            redis_url: None,
            max_queue_depth: 24,
            max_match_count: -1,
            max_size_bytes: -1,
            max_reorder_duration: Duration::ZERO,
            flush_collect_max_size_bytes: 100 * 1024 * 1024,
            list_ttl: Duration::from_secs(15),
            list_ttl_jitter: None,
            transport: Transport::Json,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HorizontalConfig {
    pub fn list_jitter(&self) -> Duration {
        self.list_ttl_jitter.unwrap_or(self.list_ttl / 4)
    }
}

/// CLI-level options that binaries pass to `load_config`.
#[derive(Clone, Debug, Default)]
pub struct MergeOpts {
    pub config_path: Option<std::path::PathBuf>,
    pub cli_endpoints: Option<Vec<String>>,
    pub cli_redis_url: Option<String>,
    pub cli_max_queue_depth: Option<usize>,
    pub cli_max_reorder_duration_ms: Option<u64>,
    pub cli_list_ttl_seconds: Option<u64>,
    pub cli_transport: Option<Transport>,
}

fn split_endpoints(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

/// Load and merge HorizontalConfig from: defaults <- config file <- env vars <- CLI
pub fn load_config(mut base: HorizontalConfig, opts: MergeOpts) -> Result<HorizontalConfig> {
    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let s = fs::read_to_string(path)?;
            let v: toml::Value = toml::from_str(&s)?;
            if let Some(eps) = v.get("endpoints").and_then(|x| x.as_array()) {
                base.endpoints = eps
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect();
            }
            if let Some(u) = v.get("redis_url").and_then(|x| x.as_str()) {
                base.redis_url = Some(u.to_string());
            }
            if let Some(d) = v.get("max_queue_depth").and_then(|x| x.as_integer()) {
                base.max_queue_depth = d.max(0) as usize;
            }
            if let Some(m) = v.get("max_match_count").and_then(|x| x.as_integer()) {
                base.max_match_count = m;
            }
            if let Some(m) = v.get("max_size_bytes").and_then(|x| x.as_integer()) {
                base.max_size_bytes = m;
            }
            if let Some(ms) = v.get("max_reorder_duration_ms").and_then(|x| x.as_integer()) {
                base.max_reorder_duration = Duration::from_millis(ms.max(0) as u64);
            }
            if let Some(m) = v
                .get("flush_collect_max_size_bytes")
                .and_then(|x| x.as_integer())
            {
                base.flush_collect_max_size_bytes = m;
            }
            if let Some(t) = v.get("list_ttl_seconds").and_then(|x| x.as_integer()) {
                base.list_ttl = Duration::from_secs(t.max(0) as u64);
            }
            if let Some(j) = v.get("list_ttl_jitter_ms").and_then(|x| x.as_integer()) {
                base.list_ttl_jitter = Some(Duration::from_millis(j.max(0) as u64));
            }
            if let Some(t) = v.get("transport").and_then(|x| x.as_str()) {
                base.transport = t.parse()?;
            }
            if let Some(t) = v.get("request_timeout_seconds").and_then(|x| x.as_integer()) {
                base.request_timeout = Duration::from_secs(t.max(0) as u64);
            }
        }
    }

    // env vars override file; unparsable values are ignored
    if let Ok(eps) = std::env::var("ZOEKTH_ENDPOINTS") {
        base.endpoints = split_endpoints(&eps);
    }
    if let Ok(u) = std::env::var("ZOEKTH_REDIS_URL") {
        base.redis_url = Some(u);
    }
    if let Some(v) = env_parse::<usize>("ZOEKTH_MAX_QUEUE_DEPTH") {
        base.max_queue_depth = v;
    }
    if let Some(v) = env_parse::<i64>("ZOEKTH_MAX_MATCH_COUNT") {
        base.max_match_count = v;
    }
    if let Some(v) = env_parse::<i64>("ZOEKTH_MAX_SIZE_BYTES") {
        base.max_size_bytes = v;
    }
    if let Some(v) = env_parse::<u64>("ZOEKTH_MAX_REORDER_DURATION_MS") {
        base.max_reorder_duration = Duration::from_millis(v);
    }
    if let Some(v) = env_parse::<i64>("ZOEKTH_FLUSH_COLLECT_MAX_SIZE_BYTES") {
        base.flush_collect_max_size_bytes = v;
    }
    if let Some(v) = env_parse::<u64>("ZOEKTH_LIST_TTL_SECONDS") {
        base.list_ttl = Duration::from_secs(v);
    }
    if let Some(v) = env_parse::<u64>("ZOEKTH_LIST_TTL_JITTER_MS") {
        base.list_ttl_jitter = Some(Duration::from_millis(v));
    }
    if let Some(v) = env_parse::<Transport>("ZOEKTH_TRANSPORT") {
        base.transport = v;
    }
    if let Some(v) = env_parse::<u64>("ZOEKTH_REQUEST_TIMEOUT_SECONDS") {
        base.request_timeout = Duration::from_secs(v);
    }

    // CLI overrides everything
    if let Some(eps) = opts.cli_endpoints {
        base.endpoints = eps;
    }
    if let Some(u) = opts.cli_redis_url {
        base.redis_url = Some(u);
    }
    if let Some(d) = opts.cli_max_queue_depth {
        base.max_queue_depth = d;
    }
    if let Some(ms) = opts.cli_max_reorder_duration_ms {
        base.max_reorder_duration = Duration::from_millis(ms);
    }
    if let Some(t) = opts.cli_list_ttl_seconds {
        base.list_ttl = Duration::from_secs(t);
    }
    if let Some(t) = opts.cli_transport {
        base.transport = t;
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, EnvGuard};

    const VARS: &[&str] = &[
        "ZOEKTH_ENDPOINTS",
        "ZOEKTH_REDIS_URL",
        "ZOEKTH_MAX_QUEUE_DEPTH",
        "ZOEKTH_MAX_MATCH_COUNT",
        "ZOEKTH_MAX_SIZE_BYTES",
        "ZOEKTH_MAX_REORDER_DURATION_MS",
        "ZOEKTH_FLUSH_COLLECT_MAX_SIZE_BYTES",
        "ZOEKTH_LIST_TTL_SECONDS",
        "ZOEKTH_LIST_TTL_JITTER_MS",
        "ZOEKTH_TRANSPORT",
        "ZOEKTH_REQUEST_TIMEOUT_SECONDS",
    ];

    #[test]
    #[serial_test::serial]
    fn test_defaults() {
        init_test_logging();
        tracing::info!("TEST START: config::tests::test_defaults");
        let mut env = EnvGuard::new();
        env.save_and_clear(VARS);

        let got = load_config(HorizontalConfig::default(), MergeOpts::default()).expect("load");
        assert_eq!(got.max_queue_depth, 24);
        assert_eq!(got.max_match_count, -1);
        assert_eq!(got.max_size_bytes, -1);
        assert!(got.max_reorder_duration.is_zero());
        assert_eq!(got.flush_collect_max_size_bytes, 100 * 1024 * 1024);
        assert_eq!(got.list_ttl, Duration::from_secs(15));
        assert_eq!(got.list_jitter(), Duration::from_millis(3750));
        assert_eq!(got.transport, Transport::Json);
    }

    #[test]
    #[serial_test::serial]
    fn test_merge_file_env_cli_precedence() {
        init_test_logging();
        tracing::info!("TEST START: config::tests::test_merge_file_env_cli_precedence");
        let mut env = EnvGuard::new();
        env.save_and_clear(VARS);

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let toml = r#"
endpoints = ["file-a:6070", "file-b:6070"]
max_queue_depth = 10
max_match_count = 1000
list_ttl_seconds = 60
transport = "ndjson"
"#;
        fs::write(tmp.path(), toml).unwrap();

        env.set("ZOEKTH_MAX_QUEUE_DEPTH", "12");
        env.set("ZOEKTH_LIST_TTL_SECONDS", "30");
        env.set("ZOEKTH_MAX_SIZE_BYTES", "4096");

        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            cli_max_queue_depth: Some(16),
            ..Default::default()
        };

        let got = load_config(HorizontalConfig::default(), opts).expect("load");
        assert_eq!(got.endpoints, vec!["file-a:6070", "file-b:6070"]);
        assert_eq!(got.max_queue_depth, 16);
        assert_eq!(got.max_match_count, 1000);
        assert_eq!(got.max_size_bytes, 4096);
        assert_eq!(got.list_ttl.as_secs(), 30);
        assert_eq!(got.list_jitter(), Duration::from_millis(7500));
        assert_eq!(got.transport, Transport::NdJson);
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_env_is_ignored() {
        init_test_logging();
        tracing::info!("TEST START: config::tests::test_invalid_env_is_ignored");
        let mut env = EnvGuard::new();
        env.save_and_clear(VARS);

        env.set("ZOEKTH_MAX_QUEUE_DEPTH", "lots");
        env.set("ZOEKTH_TRANSPORT", "carrier-pigeon");
        env.set("ZOEKTH_ENDPOINTS", " a:1 , ,b:2 ");

        let got = load_config(HorizontalConfig::default(), MergeOpts::default()).expect("load");
        assert_eq!(got.max_queue_depth, 24);
        assert_eq!(got.transport, Transport::Json);
        assert_eq!(got.endpoints, vec!["a:1", "b:2"]);
    }

    #[test]
    #[serial_test::serial]
    fn test_missing_file_is_skipped() {
        init_test_logging();
        tracing::info!("TEST START: config::tests::test_missing_file_is_skipped");
        let mut env = EnvGuard::new();
        env.save_and_clear(VARS);

        let dir = tempfile::tempdir().expect("tempdir");
        let opts = MergeOpts {
            config_path: Some(dir.path().join("absent.toml")),
            cli_endpoints: Some(vec!["cli:6070".into()]),
            ..Default::default()
        };
        let got = load_config(HorizontalConfig::default(), opts).expect("load");
        assert_eq!(got.endpoints, vec!["cli:6070"]);
    }
}
