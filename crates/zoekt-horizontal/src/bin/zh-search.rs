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

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use zoekt_horizontal::redis_adapter::RealRedis;
use zoekt_horizontal::{
    http_dialer, load_config, EndpointMap, HorizontalConfig, HorizontalSearcher, ListOptions,
    MergeOpts, NoopMetrics, Query, RedisEndpointMap, SearchOptions, StaticEndpointMap, Streamer,
    Transport,
};

/// Search every replica of a horizontally sharded zoekt cluster.
#[derive(Parser)]
struct Opts {
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Comma separated replica endpoints (env: ZOEKTH_ENDPOINTS)
    #[arg(long, value_delimiter = ',')]
    endpoints: Option<Vec<String>>,
    /// Read replica membership from Redis instead (env: ZOEKTH_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,
    #[arg(long)]
    max_queue_depth: Option<usize>,
    #[arg(long)]
    max_reorder_duration_ms: Option<u64>,
    #[arg(long)]
    transport: Option<Transport>,
    /// Rank with document ranks, collecting results before sending
    #[arg(long)]
    ranks: bool,
    #[arg(long, default_value_t = 500)]
    flush_wall_time_ms: u64,
    #[arg(long, default_value_t = 0)]
    max_doc_display_count: usize,
    /// List repositories instead of searching
    #[arg(long)]
    list: bool,
    /// Substring to search for; omit with --list to list everything
    query: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper_util=warn,hyper=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opts = Opts::parse();

    let cfg = load_config(
        HorizontalConfig::default(),
        MergeOpts {
            config_path: opts.config,
            cli_endpoints: opts.endpoints,
            cli_redis_url: opts.redis_url,
            cli_max_queue_depth: opts.max_queue_depth,
            cli_max_reorder_duration_ms: opts.max_reorder_duration_ms,
            cli_list_ttl_seconds: None,
            cli_transport: opts.transport,
        },
    )?;

    let map: Arc<dyn EndpointMap> = match cfg.redis_url.as_deref() {
        Some(url) => {
            tracing::info!(redis_url = %url, "reading endpoints from redis");
            Arc::new(RedisEndpointMap::new(Arc::new(RealRedis::from_url(url)?)))
        }
        None => {
            tracing::info!(endpoints = ?cfg.endpoints, "using static endpoints");
            Arc::new(StaticEndpointMap::new(cfg.endpoints.clone()))
        }
    };

    let metrics = Arc::new(NoopMetrics);
    let dialer = http_dialer(&cfg, metrics.clone())?;
    let searcher = HorizontalSearcher::new(map, dialer, cfg, metrics);

    let q = match opts.query.as_deref() {
        Some(s) if !s.is_empty() => Query::substring(s),
        _ => Query::all(),
    };

    let out = if opts.list {
        let list = searcher.list(&q, &ListOptions::default()).await?;
        serde_json::to_string_pretty(&list)?
    } else {
        let search_opts = SearchOptions {
            use_document_ranks: opts.ranks,
            flush_wall_time: Duration::from_millis(opts.flush_wall_time_ms),
            max_doc_display_count: opts.max_doc_display_count,
            ..Default::default()
        };
        tracing::info!(query = %q, options = %search_opts, "searching");
        let sr = searcher.search(&q, &search_opts).await?;
        serde_json::to_string_pretty(&sr)?
    };
    searcher.close().await;

    println!("{}", out);
    Ok(())
}
