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

//! Keeps one endpoint's results per repository while replicas overlap during rebalancing.

use std::collections::HashMap;

use crate::types::FileMatch;

/// Drops results for a repository coming from more than one endpoint.
///
/// During rebalancing a repository can be indexed on two endpoints at once.
/// The first endpoint to report a repository owns it for the rest of the
/// request. Not safe for concurrent use; callers serialise access.
#[derive(Debug, Default)]
pub struct Dedupper {
    /// repository => endpoint that first reported it
    owners: HashMap<String, String>,
}

impl Dedupper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the files `endpoint` may report, in their original order.
    /// Files for one repository usually arrive in runs, so each run is
    /// decided with a single lookup.
    pub fn dedup(&mut self, endpoint: &str, mut files: Vec<FileMatch>) -> Vec<FileMatch> {
        let owners = &self.owners;
        let mut last_repo: Option<String> = None;
        let mut keep_run = false;

        files.retain(|f| {
            if last_repo.as_deref() != Some(f.repository.as_str()) {
                keep_run = owners
                    .get(&f.repository)
                    .map_or(true, |owner| owner == endpoint);
                last_repo = Some(f.repository.clone());
            }
            keep_run
        });

        for f in &files {
            if !self.owners.contains_key(&f.repository) {
                self.owners
                    .insert(f.repository.clone(), endpoint.to_string());
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fm(repo: &str, name: &str) -> FileMatch {
        FileMatch {
            repository: repo.into(),
            file_name: name.into(),
            ..Default::default()
        }
    }

    fn names(files: &[FileMatch]) -> Vec<String> {
        files
            .iter()
            .map(|f| format!("{}/{}", f.repository, f.file_name))
            .collect()
    }

    #[test]
    fn first_endpoint_wins_in_either_order() {
        for (first, second) in [("e1", "e2"), ("e2", "e1")] {
            let mut d = Dedupper::new();
            let a = d.dedup(first, vec![fm("r", "a.go"), fm("r", "b.go")]);
            let b = d.dedup(second, vec![fm("r", "a.go"), fm("s", "c.go")]);
            assert_eq!(names(&a), vec!["r/a.go", "r/b.go"]);
            assert_eq!(names(&b), vec!["s/c.go"]);

            // later batches from the owner still pass
            let c = d.dedup(first, vec![fm("r", "d.go")]);
            assert_eq!(names(&c), vec!["r/d.go"]);
        }
    }

    #[test]
    fn compaction_keeps_order_across_runs() {
        let mut d = Dedupper::new();
        d.dedup("other", vec![fm("taken", "x")]);
        let out = d.dedup(
            "me",
            vec![
                fm("taken", "1"),
                fm("mine", "2"),
                fm("mine", "3"),
                fm("taken", "4"),
                fm("also", "5"),
            ],
        );
        assert_eq!(names(&out), vec!["mine/2", "mine/3", "also/5"]);
    }

    #[test]
    fn each_repository_reported_by_exactly_one_endpoint() {
        let mut d = Dedupper::new();
        let mut seen: HashMap<String, String> = HashMap::new();
        let batches = [
            ("e1", vec![fm("a", "1"), fm("b", "1")]),
            ("e2", vec![fm("b", "2"), fm("c", "2")]),
            ("e3", vec![fm("c", "3"), fm("a", "3"), fm("d", "3")]),
            ("e2", vec![fm("d", "4"), fm("c", "4")]),
        ];
        for (ep, files) in batches {
            for f in d.dedup(ep, files) {
                let owner = seen.entry(f.repository.clone()).or_insert(ep.to_string());
                assert_eq!(owner.as_str(), ep, "repository {} from two endpoints", f.repository);
            }
        }
        assert_eq!(seen.len(), 4);
    }
}
