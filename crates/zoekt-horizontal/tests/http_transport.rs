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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use zoekt_horizontal::test_utils::{init_test_logging, RecordingMetrics};
use zoekt_horizontal::types::Stats;
use zoekt_horizontal::{
    http_dialer, CacheEvent, FileMatch, HorizontalConfig, HorizontalSearcher, ListOptions,
    Progress, Query, RepoList, RepoListEntry, Repository, RolloutReason, SearchOptions,
    SearchResult, StaticEndpointMap, Streamer, Transport,
};

#[derive(Clone)]
struct Shard {
    name: &'static str,
    lists: Arc<AtomicUsize>,
}

impl Shard {
    fn batch(&self, n: usize, priority: f64, max_pending: f64) -> SearchResult {
        SearchResult {
            files: vec![FileMatch {
                repository: format!("{}-repo-{}", self.name, n),
                file_name: "main.rs".into(),
                score: priority,
                ..Default::default()
            }],
            stats: Stats {
                match_count: 1,
                ..Default::default()
            },
            progress: Progress {
                priority,
                max_pending_priority: max_pending,
            },
            ..Default::default()
        }
    }
}

async fn search(State(shard): State<Shard>, Json(_body): Json<serde_json::Value>) -> Json<SearchResult> {
    let mut sr = shard.batch(0, 2.0, 1.0);
    sr.absorb(shard.batch(1, 1.0, f64::NEG_INFINITY));
    Json(sr)
}

async fn stream(State(shard): State<Shard>, Json(_body): Json<serde_json::Value>) -> String {
    let mut out = String::new();
    for sr in [
        shard.batch(0, 2.0, 1.0),
        shard.batch(1, 1.0, f64::NEG_INFINITY),
    ] {
        out.push_str(&serde_json::to_string(&sr).unwrap_or_default());
        out.push('\n');
    }
    out
}

async fn list(State(shard): State<Shard>, Json(_body): Json<serde_json::Value>) -> Json<RepoList> {
    shard.lists.fetch_add(1, Ordering::SeqCst);
    let mut rl = RepoList {
        repos: vec![RepoListEntry {
            repository: Repository {
                id: 1,
                name: format!("{}-repo", shard.name),
                ..Default::default()
            },
            ..Default::default()
        }],
        ..Default::default()
    };
    rl.stats.repos = 1;
    Json(rl)
}

async fn broken(Json(_body): Json<serde_json::Value>) -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "index corrupt")
}

async fn spawn_shard(name: &'static str) -> (String, Arc<AtomicUsize>) {
    let lists = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/search", post(search))
        .route("/api/stream", post(stream))
        .route("/api/list", post(list))
        .with_state(Shard {
            name,
            lists: lists.clone(),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr.to_string(), lists)
}

async fn spawn_broken() -> String {
    let app = Router::new()
        .route("/api/search", post(broken))
        .route("/api/stream", post(broken))
        .route("/api/list", post(broken));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr.to_string()
}

/// An address nothing listens on.
async fn closed_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn horizontal(
    endpoints: Vec<String>,
    transport: Transport,
    metrics: Arc<RecordingMetrics>,
) -> HorizontalSearcher {
    let config = HorizontalConfig {
        endpoints: endpoints.clone(),
        transport,
        ..Default::default()
    };
    let dialer = http_dialer(&config, metrics.clone()).unwrap();
    HorizontalSearcher::new(
        Arc::new(StaticEndpointMap::new(endpoints)),
        dialer,
        config,
        metrics,
    )
}

#[tokio::test]
async fn search_over_both_transports() {
    init_test_logging();
    tracing::info!("TEST START: search_over_both_transports");
    let (a, _) = spawn_shard("a").await;
    let (b, _) = spawn_shard("b").await;

    for transport in [Transport::Json, Transport::NdJson] {
        let hs = horizontal(
            vec![a.clone(), b.clone()],
            transport,
            Arc::new(RecordingMetrics::default()),
        );
        let sr = hs
            .search(&Query::substring("main"), &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(sr.files.len(), 4, "transport {}", transport);
        assert_eq!(sr.stats.match_count, 4, "transport {}", transport);
        hs.close().await;
    }
}

#[tokio::test]
async fn list_goes_through_the_cache() {
    init_test_logging();
    tracing::info!("TEST START: list_goes_through_the_cache");
    let (a, a_lists) = spawn_shard("a").await;
    let (b, _) = spawn_shard("b").await;
    let metrics = Arc::new(RecordingMetrics::default());
    let hs = horizontal(vec![a, b], Transport::Json, metrics.clone());

    for _ in 0..3 {
        let rl = hs.list(&Query::all(), &ListOptions::default()).await.unwrap();
        assert_eq!(rl.repos.len(), 2);
        assert_eq!(rl.stats.repos, 2);
    }
    assert_eq!(a_lists.load(Ordering::SeqCst), 1);
    let hits = metrics
        .cache_events()
        .into_iter()
        .filter(|e| *e == CacheEvent::Hit)
        .count();
    assert_eq!(hits, 4);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_crash() {
    init_test_logging();
    tracing::info!("TEST START: unreachable_endpoint_is_a_crash");
    let (a, _) = spawn_shard("a").await;
    let down = closed_addr().await;
    let metrics = Arc::new(RecordingMetrics::default());
    let hs = horizontal(vec![a, down], Transport::NdJson, metrics.clone());

    let sr = hs
        .search(&Query::substring("main"), &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(sr.files.len(), 2);
    assert_eq!(sr.stats.crashes, 1);
    assert_eq!(metrics.ignored_errors(), vec![RolloutReason::DialRefused]);
}

#[tokio::test]
async fn server_errors_are_surfaced() {
    init_test_logging();
    tracing::info!("TEST START: server_errors_are_surfaced");
    let (a, _) = spawn_shard("a").await;
    let bad = spawn_broken().await;
    let hs = horizontal(
        vec![a, bad],
        Transport::Json,
        Arc::new(RecordingMetrics::default()),
    );

    let err = hs
        .search(&Query::substring("main"), &SearchOptions::default())
        .await
        .unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("status 500"), "{}", msg);
    assert!(msg.contains("index corrupt"), "{}", msg);
    assert!(hs.list(&Query::all(), &ListOptions::default()).await.is_err());
}
