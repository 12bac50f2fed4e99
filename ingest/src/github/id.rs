use std::fmt;

use reqwest::Url;

use crate::error::ValidationError;

/// A validated `owner/repo` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    /// Accepts `owner/repo`, `github.com/owner/repo` or a full GitHub URL.
    /// A trailing `.git` or `/` is tolerated; anything other than exactly two
    /// non-empty path segments is rejected.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::new(input, "empty identifier"));
        }

        let path = if trimmed.contains("://") {
            let url = Url::parse(trimmed).map_err(|_| ValidationError::new(input, "malformed url"))?;
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            if host != "github.com" && !host.ends_with(".github.com") {
                return Err(ValidationError::new(input, "not a github.com url"));
            }
            url.path().to_string()
        } else if let Some(rest) = strip_host(trimmed) {
            rest.to_string()
        } else {
            trimmed.to_string()
        };

        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let segments: Vec<&str> = path.split('/').collect();
        let [owner, name] = segments.as_slice() else {
            return Err(ValidationError::new(input, "expected exactly owner/repo"));
        };
        if owner.is_empty() || name.is_empty() {
            return Err(ValidationError::new(input, "empty owner or repository name"));
        }
        if !owner.chars().all(valid_char) || !name.chars().all(valid_char) {
            return Err(ValidationError::new(input, "invalid characters in owner/repo"));
        }

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Lower-cased form used for deduplication and cache file names.
    pub fn key(&self) -> String {
        self.full_name().to_ascii_lowercase()
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn strip_host(input: &str) -> Option<&str> {
    let lowered = input.to_ascii_lowercase();
    ["www.github.com/", "github.com/"]
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
        .map(|prefix| &input[prefix.len()..])
}

fn valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}
