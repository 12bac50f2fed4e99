use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Language name to byte count, as reported by the languages endpoint.
pub type LanguageStats = BTreeMap<String, i64>;

// Normalized repository metadata. Immutable once built by the fetch client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub github_id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub description: Option<String>,
    pub html_url: String,
    pub homepage: Option<String>,
    pub stars: i64,
    pub forks: i64,
    pub watchers: i64,
    pub open_issues: i64,
    pub size_kb: i64,
    pub default_branch: Option<String>,
    pub language: Option<String>,
    pub license: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub private: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    /// `None` means the list was not fetched; existing rows are left alone.
    #[serde(default)]
    pub contributors: Option<Vec<Contributor>>,
    #[serde(default)]
    pub languages: Option<LanguageStats>,
}

impl RepositoryRecord {
    /// Case-insensitive `owner/repo` key used for run-level deduplication.
    pub fn key(&self) -> String {
        self.full_name.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub login: String,
    pub github_id: Option<i64>,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
    pub contributions: i64,
}

// A fetched record tagged by the caller, waiting in the writer's batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub record: RepositoryRecord,
    pub ecosystem: String,
    pub category: String,
    /// Lower-cased `owner/repo` from the source listing when it differs
    /// from the record's current name, as after a rename.
    pub listed_as: Option<String>,
}

impl PendingRecord {
    pub fn new(
        record: RepositoryRecord,
        ecosystem: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            record,
            ecosystem: ecosystem.into(),
            category: category.into(),
            listed_as: None,
        }
    }

    pub fn with_source_key(mut self, source_key: &str) -> Self {
        let source_key = source_key.to_ascii_lowercase();
        self.listed_as = (source_key != self.record.key()).then_some(source_key);
        self
    }

    pub fn key(&self) -> String {
        self.record.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_without_optional_lists() {
        let raw = r#"{
            "github_id": 1,
            "owner": "Foo",
            "name": "Bar",
            "full_name": "Foo/Bar",
            "description": null,
            "html_url": "https://github.com/Foo/Bar",
            "homepage": null,
            "stars": 3,
            "forks": 0,
            "watchers": 3,
            "open_issues": 0,
            "size_kb": 10,
            "default_branch": "main",
            "language": "Rust",
            "license": null,
            "created_at": null,
            "updated_at": null,
            "pushed_at": null
        }"#;

        let record: RepositoryRecord = serde_json::from_str(raw).expect("parse record");
        assert!(record.topics.is_empty());
        assert!(record.contributors.is_none());
        assert!(record.languages.is_none());
        assert_eq!(record.key(), "foo/bar");

        let pending = PendingRecord::new(record.clone(), "eco", "defi").with_source_key("FOO/bar");
        assert_eq!(pending.listed_as, None);
        let renamed = PendingRecord::new(record, "eco", "defi").with_source_key("old/Bar");
        assert_eq!(renamed.listed_as.as_deref(), Some("old/bar"));
    }
}
