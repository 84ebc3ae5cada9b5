//! Test query loading.
//!
//! Supports:
//! - Query lists embedded in the config file
//! - JSON files (a list of strings, or `{"name": ..., "queries": [...]}`)
//! - YAML files with the same shapes
//! - Plain text files, one query per line (`#` starts a comment line)

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A single test query. Identity is its text plus its position in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// 0-based position in the query set.
    pub position: usize,
    pub text: String,
}

impl Query {
    pub fn new(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            text: text.into(),
        }
    }
}

/// An ordered collection of test queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySet {
    pub name: String,
    pub queries: Vec<Query>,
}

/// On-disk shapes accepted for query files.
#[derive(Deserialize)]
#[serde(untagged)]
enum QueryFile {
    List(Vec<String>),
    Named {
        #[serde(default)]
        name: Option<String>,
        queries: Vec<String>,
    },
}

impl QuerySet {
    /// Build a set from query texts, numbering them in order.
    pub fn from_texts<I, S>(name: &str, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            queries: texts
                .into_iter()
                .enumerate()
                .map(|(position, text)| Query::new(position, text))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Keep only the first `n` queries (for quick testing).
    pub fn take(&self, n: usize) -> Self {
        Self {
            name: self.name.clone(),
            queries: self.queries.iter().take(n).cloned().collect(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Query> {
        self.queries.iter()
    }

    /// Load queries from a file, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        let default_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("queries")
            .to_string();

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        let parsed = match extension.as_deref() {
            Some("json") => Some(serde_json::from_str::<QueryFile>(&content).map_err(|e| {
                EvalError::QuerySource(format!("Failed to parse {}: {}", path.display(), e))
            })?),
            Some("yaml") | Some("yml") => {
                Some(serde_yaml::from_str::<QueryFile>(&content).map_err(|e| {
                    EvalError::QuerySource(format!("Failed to parse {}: {}", path.display(), e))
                })?)
            }
            _ => None,
        };

        let set = match parsed {
            Some(QueryFile::List(texts)) => Self::from_texts(&default_name, texts),
            Some(QueryFile::Named { name, queries }) => {
                Self::from_texts(name.as_deref().unwrap_or(&default_name), queries)
            }
            None => Self::from_lines(&default_name, &content),
        };

        if set.is_empty() {
            return Err(EvalError::QuerySource(format!(
                "No queries found in '{}'",
                path.display()
            )));
        }

        Ok(set)
    }

    /// One query per non-blank line; lines starting with `#` are comments.
    pub fn from_lines(name: &str, content: &str) -> Self {
        Self::from_texts(
            name,
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }
}

/// Built-in queries used when neither the config nor the CLI supplies any.
pub fn sample_queries() -> QuerySet {
    QuerySet::from_texts(
        "sample",
        [
            "What are the benefits of SharePoint?",
            "How do I create a communication site?",
        ],
    )
}
