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

//! Result, statistics and option types exchanged with shards.
//!
//! These mirror the shapes a zoekt webserver streams back: a `SearchResult`
//! is one batch of file matches plus cumulative statistics and the shard's
//! progress report. Size estimates are best-effort lower bounds used only for
//! memory caps, never for correctness.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

const MAP_HEADER_BYTES: u64 = 48;
const SLICE_HEADER_BYTES: u64 = 24;
const STRING_HEADER_BYTES: u64 = 16;

/// A single matched fragment inside a line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineFragmentMatch {
    /// Offset within the line, in bytes.
    pub line_offset: u32,
    /// Offset from the start of the file, in bytes.
    pub offset: u32,
    pub match_length: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineMatch {
    pub line: Vec<u8>,
    pub line_start: u32,
    pub line_end: u32,
    pub line_number: u32,
    /// True when the match is on the file name rather than its content.
    pub file_name: bool,
    pub score: f64,
    pub fragments: Vec<LineFragmentMatch>,
}

impl LineMatch {
    fn size_bytes(&self) -> u64 {
        // line, start, end, number, file_name flag, score
        let mut sz = SLICE_HEADER_BYTES + self.line.len() as u64 + 4 + 4 + 4 + 1 + 8;
        sz += SLICE_HEADER_BYTES + self.fragments.len() as u64 * 12;
        sz
    }
}

/// All matches within one file of one repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMatch {
    pub file_name: String,
    /// Globally unique repository name; the dedup key.
    pub repository: String,
    pub repository_id: u32,
    /// Orders results from different repositories relative to each other.
    pub repository_priority: f64,
    /// Ranking; the higher, the better.
    pub score: f64,
    pub language: String,
    pub branches: Vec<String>,
    pub line_matches: Vec<LineMatch>,
    pub content: Option<Vec<u8>>,
    pub checksum: Vec<u8>,
}

impl FileMatch {
    pub fn size_bytes(&self) -> u64 {
        let mut sz: u64 = 8 + 8 + 4; // score, repository_priority, repository_id
        for s in [&self.file_name, &self.repository, &self.language] {
            sz += STRING_HEADER_BYTES + s.len() as u64;
        }
        sz += SLICE_HEADER_BYTES;
        for b in &self.branches {
            sz += STRING_HEADER_BYTES + b.len() as u64;
        }
        sz += SLICE_HEADER_BYTES;
        for lm in &self.line_matches {
            sz += lm.size_bytes();
        }
        sz += SLICE_HEADER_BYTES + self.content.as_ref().map_or(0, |c| c.len() as u64);
        sz += SLICE_HEADER_BYTES + self.checksum.len() as u64;
        sz
    }
}

/// Why an aggregate was flushed. The first non-`None` reason is sticky when
/// stats are added together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    #[default]
    None,
    TimerExpired,
    FinalFlush,
    #[serde(rename = "max_size_reached")]
    MaxSize,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlushReason::None => "none",
            FlushReason::TimerExpired => "timer_expired",
            FlushReason::FinalFlush => "final_flush",
            FlushReason::MaxSize => "max_size_reached",
        };
        f.write_str(s)
    }
}

/// Cumulative statistics for a search. Every counter is additive except
/// `duration`, which is wall time of the whole request and set by whoever
/// measures it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub content_bytes_loaded: i64,
    pub index_bytes_loaded: i64,
    /// Number of shards (or endpoints) that crashed or were unreachable.
    pub crashes: usize,
    pub duration: Duration,
    pub file_count: usize,
    pub shard_files_considered: usize,
    pub files_considered: usize,
    pub files_loaded: usize,
    pub files_skipped: usize,
    pub shards_scanned: usize,
    pub shards_skipped: usize,
    pub shards_skipped_filter: usize,
    pub match_count: usize,
    pub ngram_matches: usize,
    pub wait: Duration,
    pub regexps_considered: usize,
    pub flush_reason: FlushReason,
}

impl Stats {
    pub fn add(&mut self, o: &Stats) {
        self.content_bytes_loaded += o.content_bytes_loaded;
        self.index_bytes_loaded += o.index_bytes_loaded;
        self.crashes += o.crashes;
        self.file_count += o.file_count;
        self.shard_files_considered += o.shard_files_considered;
        self.files_considered += o.files_considered;
        self.files_loaded += o.files_loaded;
        self.files_skipped += o.files_skipped;
        self.shards_scanned += o.shards_scanned;
        self.shards_skipped += o.shards_skipped;
        self.shards_skipped_filter += o.shards_skipped_filter;
        self.match_count += o.match_count;
        self.ngram_matches += o.ngram_matches;
        self.wait += o.wait;
        self.regexps_considered += o.regexps_considered;

        if self.flush_reason == FlushReason::None {
            self.flush_reason = o.flush_reason;
        }
    }

    /// True if no counter has been touched. The flush reason does not count.
    pub fn is_zero(&self) -> bool {
        !(self.content_bytes_loaded > 0
            || self.index_bytes_loaded > 0
            || self.crashes > 0
            || self.file_count > 0
            || self.shard_files_considered > 0
            || self.files_considered > 0
            || self.files_loaded > 0
            || self.files_skipped > 0
            || self.shards_scanned > 0
            || self.shards_skipped > 0
            || self.shards_skipped_filter > 0
            || self.match_count > 0
            || self.ngram_matches > 0
            || !self.wait.is_zero()
            || self.regexps_considered > 0)
    }

    fn size_bytes(&self) -> u64 {
        17 * 8 + 1
    }
}

/// Progress report attached to every batch.
///
/// `max_pending_priority` is the shard's upper bound on the priority of any
/// result it may still emit and decreases monotonically over a stream. A
/// batch whose `priority` is at or above the max of every endpoint's bound is
/// safe to emit in global order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(with = "infinite_f64")]
    pub priority: f64,
    #[serde(with = "infinite_f64")]
    pub max_pending_priority: f64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            priority: f64::NEG_INFINITY,
            max_pending_priority: f64::NEG_INFINITY,
        }
    }
}

/// JSON has no infinities: `-inf` travels as `null`, `+inf` as the string "inf".
mod infinite_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Finite(f64),
        Tag(String),
    }

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if *v == f64::NEG_INFINITY {
            s.serialize_none()
        } else if *v == f64::INFINITY {
            s.serialize_str("inf")
        } else {
            s.serialize_f64(*v)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Option::<Wire>::deserialize(d)? {
            None => Ok(f64::NEG_INFINITY),
            Some(Wire::Finite(v)) => Ok(v),
            Some(Wire::Tag(t)) if t == "inf" => Ok(f64::INFINITY),
            Some(Wire::Tag(t)) => Err(serde::de::Error::custom(format!(
                "invalid priority {t:?}"
            ))),
        }
    }
}

/// One batch of streamed results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    pub stats: Stats,
    pub progress: Progress,
    pub files: Vec<FileMatch>,
    /// repository => URL template
    pub repo_urls: HashMap<String, String>,
    /// repository => line fragment template
    pub line_fragments: HashMap<String, String>,
}

impl SearchResult {
    /// Best-effort estimate of the in-memory size. Lower bound, alignment ignored.
    pub fn size_bytes(&self) -> u64 {
        let mut sz = self.stats.size_bytes() + 16;
        sz += SLICE_HEADER_BYTES;
        for f in &self.files {
            sz += f.size_bytes();
        }
        for m in [&self.repo_urls, &self.line_fragments] {
            sz += MAP_HEADER_BYTES;
            for (k, v) in m {
                sz += STRING_HEADER_BYTES + k.len() as u64 + STRING_HEADER_BYTES + v.len() as u64;
            }
        }
        sz
    }

    /// Merge files, templates and stats of `other` into `self`.
    pub fn absorb(&mut self, other: SearchResult) {
        self.stats.add(&other.stats);
        self.files.extend(other.files);
        self.repo_urls.extend(other.repo_urls);
        self.line_fragments.extend(other.line_fragments);
    }
}

/// Rank sort: score descending, then repository priority descending. Stable,
/// so equal-ranked files keep their arrival order.
pub fn sort_files(files: &mut [FileMatch]) {
    files.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.repository_priority.total_cmp(&a.repository_priority))
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Return an upper-bound estimate of eligible documents.
    pub estimate_doc_count: bool,
    /// Return the whole file.
    pub whole: bool,
    pub shard_max_match_count: usize,
    pub total_max_match_count: usize,
    pub shard_repo_max_match_count: usize,
    /// Abort the search after this much time has passed. Zero means no limit.
    pub max_wall_time: Duration,
    /// In ranked mode, collect and sort results for up to twice this long
    /// before reverting to plain streaming.
    pub flush_wall_time: Duration,
    /// Truncate the collected aggregate to this many files. Zero means no limit.
    pub max_doc_display_count: usize,
    pub num_context_lines: usize,
    pub chunk_matches: bool,
    /// Selects the flush-collect aggregation strategy instead of priority
    /// reordering.
    pub use_document_ranks: bool,
    pub document_ranks_weight: f64,
    pub trace: bool,
    pub debug_score: bool,
}

impl fmt::Display for SearchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SearchOptions{ ")?;
        for (name, v) in [
            ("ShardMaxMatchCount", self.shard_max_match_count),
            ("TotalMaxMatchCount", self.total_max_match_count),
            ("ShardRepoMaxMatchCount", self.shard_repo_max_match_count),
            ("MaxDocDisplayCount", self.max_doc_display_count),
            ("NumContextLines", self.num_context_lines),
        ] {
            if v != 0 {
                write!(f, "{name}={v} ")?;
            }
        }
        for (name, d) in [
            ("MaxWallTime", self.max_wall_time),
            ("FlushWallTime", self.flush_wall_time),
        ] {
            if !d.is_zero() {
                write!(f, "{name}={d:?} ")?;
            }
        }
        if self.document_ranks_weight > 0.0 {
            write!(f, "DocumentRanksWeight={} ", self.document_ranks_weight)?;
        }
        for (name, b) in [
            ("EstimateDocCount", self.estimate_doc_count),
            ("Whole", self.whole),
            ("ChunkMatches", self.chunk_matches),
            ("UseDocumentRanks", self.use_document_ranks),
            ("Trace", self.trace),
            ("DebugScore", self.debug_score),
        ] {
            if b {
                write!(f, "{name} ")?;
            }
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoListField {
    #[default]
    Repos,
    ReposMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub field: RepoListField,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryBranch {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u32,
    pub name: String,
    pub priority: f64,
    pub branches: Vec<RepositoryBranch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoStats {
    pub repos: usize,
    pub shards: usize,
    pub documents: usize,
    pub index_bytes: i64,
    pub content_bytes: i64,
}

impl RepoStats {
    pub fn add(&mut self, o: &RepoStats) {
        self.repos += o.repos;
        self.shards += o.shards;
        self.documents += o.documents;
        self.index_bytes += o.index_bytes;
        self.content_bytes += o.content_bytes;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoListEntry {
    pub repository: Repository,
    pub stats: RepoStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinimalRepoListEntry {
    pub has_symbols: bool,
    pub branches: Vec<RepositoryBranch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoList {
    /// Populated when `ListOptions::field` is `Repos`.
    pub repos: Vec<RepoListEntry>,
    /// Populated when `ListOptions::field` is `ReposMap`, keyed by repository id.
    pub repos_map: HashMap<u32, MinimalRepoListEntry>,
    pub crashes: usize,
    pub stats: RepoStats,
}

impl RepoList {
    /// Append another endpoint's listing. No dedup: callers of list already
    /// deduplicate.
    pub fn merge(&mut self, other: RepoList) {
        self.repos.extend(other.repos);
        self.repos_map.extend(other.repos_map);
        self.crashes += other.crashes;
        self.stats.add(&other.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fm(repo: &str, score: f64) -> FileMatch {
        FileMatch {
            file_name: "f.go".into(),
            repository: repo.into(),
            score,
            ..Default::default()
        }
    }

    #[test]
    fn stats_add_keeps_first_flush_reason() {
        let mut a = Stats {
            match_count: 2,
            ..Default::default()
        };
        let b = Stats {
            match_count: 3,
            crashes: 1,
            flush_reason: FlushReason::MaxSize,
            ..Default::default()
        };
        let c = Stats {
            flush_reason: FlushReason::TimerExpired,
            ..Default::default()
        };
        a.add(&b);
        a.add(&c);
        assert_eq!(a.match_count, 5);
        assert_eq!(a.crashes, 1);
        assert_eq!(a.flush_reason, FlushReason::MaxSize);
    }

    #[test]
    fn stats_zero_ignores_flush_reason() {
        let s = Stats {
            flush_reason: FlushReason::FinalFlush,
            ..Default::default()
        };
        assert!(s.is_zero());
        let s = Stats {
            wait: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(!s.is_zero());
    }

    #[test]
    fn size_grows_with_content() {
        let small = SearchResult {
            files: vec![fm("a", 1.0)],
            ..Default::default()
        };
        let mut big = small.clone();
        big.files[0].content = Some(vec![0u8; 4096]);
        assert!(big.size_bytes() >= small.size_bytes() + 4096);
    }

    #[test]
    fn sort_files_by_score_then_priority() {
        let mut files = vec![fm("low", 1.0), fm("high", 5.0), fm("mid", 3.0)];
        files.push(FileMatch {
            repository_priority: 10.0,
            ..fm("mid-prio", 3.0)
        });
        sort_files(&mut files);
        let names: Vec<_> = files.iter().map(|f| f.repository.as_str()).collect();
        assert_eq!(names, vec!["high", "mid-prio", "mid", "low"]);
    }

    #[test]
    fn progress_infinities_survive_json() {
        let p = Progress {
            priority: 2.5,
            max_pending_priority: f64::NEG_INFINITY,
        };
        let s = serde_json::to_string(&p).unwrap();
        assert!(s.contains("null"));
        let back: Progress = serde_json::from_str(&s).unwrap();
        assert_eq!(back, p);

        let up: Progress = serde_json::from_str(
            r#"{"priority": null, "max_pending_priority": "inf"}"#,
        )
        .unwrap();
        assert_eq!(up.priority, f64::NEG_INFINITY);
        assert_eq!(up.max_pending_priority, f64::INFINITY);
    }

    #[test]
    fn options_display_only_lists_set_fields() {
        let opts = SearchOptions {
            max_doc_display_count: 5,
            use_document_ranks: true,
            flush_wall_time: Duration::from_millis(200),
            ..Default::default()
        };
        let s = opts.to_string();
        assert!(s.contains("MaxDocDisplayCount=5"));
        assert!(s.contains("UseDocumentRanks"));
        assert!(s.contains("FlushWallTime=200ms"));
        assert!(!s.contains("Whole"));
    }

    #[test]
    fn repo_list_merge_sums() {
        let mut a = RepoList {
            repos: vec![RepoListEntry::default()],
            stats: RepoStats {
                repos: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let b = RepoList {
            repos: vec![RepoListEntry::default(), RepoListEntry::default()],
            crashes: 1,
            stats: RepoStats {
                repos: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        a.merge(b);
        assert_eq!(a.repos.len(), 3);
        assert_eq!(a.stats.repos, 3);
        assert_eq!(a.crashes, 1);
    }
}
