use chrono::{DateTime, Utc};
use ecoindex_types::{Contributor, RepositoryRecord};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ApiOwner {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiLicense {
    pub name: Option<String>,
    pub spdx_id: Option<String>,
}

/// Subset of `GET /repos/{owner}/{repo}` we keep.
#[derive(Debug, Deserialize)]
pub struct ApiRepository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub owner: ApiOwner,
    pub description: Option<String>,
    pub html_url: String,
    pub homepage: Option<String>,
    #[serde(default)]
    pub stargazers_count: i64,
    #[serde(default)]
    pub forks_count: i64,
    #[serde(default)]
    pub watchers_count: i64,
    #[serde(default)]
    pub open_issues_count: i64,
    #[serde(default)]
    pub size: i64,
    pub default_branch: Option<String>,
    pub language: Option<String>,
    pub license: Option<ApiLicense>,
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
}

impl ApiRepository {
    pub fn into_record(self) -> RepositoryRecord {
        let license = self
            .license
            .and_then(|license| license.name.or(license.spdx_id))
            .filter(|name| !name.is_empty());
        let homepage = self.homepage.filter(|url| !url.trim().is_empty());

        RepositoryRecord {
            github_id: self.id,
            owner: self.owner.login,
            name: self.name,
            full_name: self.full_name,
            description: self.description,
            html_url: self.html_url,
            homepage,
            stars: self.stargazers_count,
            forks: self.forks_count,
            watchers: self.watchers_count,
            open_issues: self.open_issues_count,
            size_kb: self.size,
            default_branch: self.default_branch,
            language: self.language,
            license,
            topics: self.topics,
            archived: self.archived,
            fork: self.fork,
            private: self.private,
            created_at: self.created_at,
            updated_at: self.updated_at,
            pushed_at: self.pushed_at,
            contributors: None,
            languages: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiContributor {
    pub login: Option<String>,
    pub id: Option<i64>,
    pub avatar_url: Option<String>,
    pub html_url: Option<String>,
    #[serde(default)]
    pub contributions: i64,
}

impl ApiContributor {
    /// Anonymous contributors have no login and are dropped.
    pub fn into_contributor(self) -> Option<Contributor> {
        let login = self.login.filter(|login| !login.is_empty())?;
        Some(Contributor {
            login,
            github_id: self.id,
            avatar_url: self.avatar_url,
            profile_url: self.html_url,
            contributions: self.contributions,
        })
    }
}
