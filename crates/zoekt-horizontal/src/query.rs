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

//! Query tree handed to shards.
//!
//! The aggregation layer treats queries as opaque: it forwards them to every
//! endpoint unchanged. The only thing it inspects is whether a query matches
//! everything, which is what the list cache keys on.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    Const { value: bool },
    Substring {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
        #[serde(default)]
        file_name: bool,
    },
    Regexp {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    Repo { pattern: String },
    RepoIds { ids: Vec<u32> },
    And { children: Vec<Query> },
    Or { children: Vec<Query> },
    Not { child: Box<Query> },
}

impl Query {
    pub fn all() -> Self {
        Query::Const { value: true }
    }

    pub fn substring(pattern: impl Into<String>) -> Self {
        Query::Substring {
            pattern: pattern.into(),
            case_sensitive: false,
            file_name: false,
        }
    }

    /// Fold constants out of boolean nodes.
    pub fn simplify(&self) -> Query {
        match self {
            Query::And { children } => {
                let mut kept = Vec::with_capacity(children.len());
                for c in children.iter().map(Query::simplify) {
                    match c {
                        Query::Const { value: true } => {}
                        Query::Const { value: false } => return Query::Const { value: false },
                        other => kept.push(other),
                    }
                }
                match kept.len() {
                    0 => Query::Const { value: true },
                    1 => kept.remove(0),
                    _ => Query::And { children: kept },
                }
            }
            Query::Or { children } => {
                let mut kept = Vec::with_capacity(children.len());
                for c in children.iter().map(Query::simplify) {
                    match c {
                        Query::Const { value: false } => {}
                        Query::Const { value: true } => return Query::Const { value: true },
                        other => kept.push(other),
                    }
                }
                match kept.len() {
                    0 => Query::Const { value: false },
                    1 => kept.remove(0),
                    _ => Query::Or { children: kept },
                }
            }
            Query::Not { child } => match child.simplify() {
                Query::Const { value } => Query::Const { value: !value },
                Query::Not { child } => *child,
                other => Query::Not {
                    child: Box::new(other),
                },
            },
            other => other.clone(),
        }
    }

    /// True when the query, once simplified, matches every document.
    pub fn is_true_query(&self) -> bool {
        matches!(self.simplify(), Query::Const { value: true })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Const { value } => write!(f, "{value}"),
            Query::Substring {
                pattern,
                case_sensitive,
                file_name,
            } => {
                let kind = if *file_name { "file" } else { "substr" };
                let case = if *case_sensitive { "case_" } else { "" };
                write!(f, "{case}{kind}:{pattern:?}")
            }
            Query::Regexp {
                pattern,
                case_sensitive,
            } => {
                let case = if *case_sensitive { "case_" } else { "" };
                write!(f, "{case}regex:{pattern:?}")
            }
            Query::Repo { pattern } => write!(f, "repo:{pattern}"),
            Query::RepoIds { ids } => write!(f, "repoids:{}", ids.len()),
            Query::And { children } => join(f, "and", children),
            Query::Or { children } => join(f, "or", children),
            Query::Not { child } => write!(f, "(not {child})"),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, op: &str, children: &[Query]) -> fmt::Result {
    write!(f, "({op}")?;
    for c in children {
        write!(f, " {c}")?;
    }
    f.write_str(")")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn true_query_detection() {
        assert!(Query::all().is_true_query());
        assert!(Query::And {
            children: vec![Query::all(), Query::all()]
        }
        .is_true_query());
        assert!(Query::Not {
            child: Box::new(Query::Const { value: false })
        }
        .is_true_query());
        assert!(Query::Or {
            children: vec![Query::substring("foo"), Query::all()]
        }
        .is_true_query());
        assert!(!Query::substring("foo").is_true_query());
        assert!(!Query::And {
            children: vec![Query::all(), Query::substring("foo")]
        }
        .is_true_query());
    }

    #[test]
    fn simplify_collapses_single_child() {
        let q = Query::And {
            children: vec![
                Query::all(),
                Query::Repo {
                    pattern: "github.com/foo".into(),
                },
            ],
        };
        assert_eq!(
            q.simplify(),
            Query::Repo {
                pattern: "github.com/foo".into()
            }
        );
    }

    #[test]
    fn serde_shape_is_tagged() {
        let q = Query::substring("needle");
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["type"], "substring");
        assert_eq!(v["pattern"], "needle");
        let back: Query = serde_json::from_value(v).unwrap();
        assert_eq!(back, q);
    }

    #[test]
    fn display_is_readable() {
        let q = Query::And {
            children: vec![
                Query::substring("foo"),
                Query::Not {
                    child: Box::new(Query::Repo {
                        pattern: "bar".into(),
                    }),
                },
            ],
        };
        assert_eq!(q.to_string(), r#"(and substr:"foo" (not repo:bar))"#);
    }
}
