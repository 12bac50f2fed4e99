use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{info, warn};

/// `url = "<value>"` at the start of a line. Commented-out lines never match.
static URL_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^\s*url\s*=\s*"([^"]*)""#).expect("valid url line regex"));

const HOST_MARKER: &str = "github.com";

/// Streams repository URLs out of ecosystem `.toml` files.
#[derive(Debug, Clone)]
pub struct SourceReader {
    root: PathBuf,
}

enum ReadState {
    Unopened(PathBuf),
    Reading(Lines<BufReader<File>>),
}

impl SourceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<id>.toml`, unless `source_id` already names an existing file.
    pub fn resolve(&self, source_id: &str) -> PathBuf {
        let direct = Path::new(source_id);
        if direct.extension().is_some_and(|ext| ext == "toml") || direct.is_file() {
            return direct.to_path_buf();
        }
        self.root.join(format!("{source_id}.toml"))
    }

    /// Lazily reads the source line by line. Each call starts over from the
    /// top of the file. A missing or unreadable source yields nothing.
    pub fn parse(&self, source_id: &str) -> BoxStream<'static, String> {
        let path = self.resolve(source_id);
        stream::unfold(ReadState::Unopened(path), |state| async move {
            let mut lines = match state {
                ReadState::Unopened(path) => match File::open(&path).await {
                    Ok(file) => BufReader::new(file).lines(),
                    Err(err) => {
                        warn!(
                            stage = "source",
                            event = "source.open",
                            result = "error",
                            path = %path.display(),
                            error = %err,
                            "ecosystem source unavailable, skipping"
                        );
                        return None;
                    }
                },
                ReadState::Reading(lines) => lines,
            };

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(url) = extract_url(&line, HOST_MARKER) {
                            return Some((url, ReadState::Reading(lines)));
                        }
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        warn!(
                            stage = "source",
                            event = "source.read",
                            result = "error",
                            error = %err,
                            "stopped reading ecosystem source"
                        );
                        return None;
                    }
                }
            }
        })
        .boxed()
    }

    /// Ecosystem ids under the root, relative and without extension, sorted.
    pub async fn list_sources(&self) -> std::io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && dir == self.root => {
                    warn!(
                        stage = "source",
                        event = "source.list",
                        root = %self.root.display(),
                        "sources directory does not exist"
                    );
                    return Ok(ids);
                }
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    dirs.push(path);
                } else if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(id) = self.source_id(&path) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        info!(
            stage = "source",
            event = "source.list",
            root = %self.root.display(),
            count = ids.len(),
            "listed ecosystem sources"
        );
        Ok(ids)
    }

    fn source_id(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn extract_url(line: &str, marker: &str) -> Option<String> {
    let value = URL_LINE_RE.captures(line)?.get(1)?.as_str();
    value.contains(marker).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    async fn collect(reader: &SourceReader, id: &str) -> Vec<String> {
        reader.parse(id).collect().await
    }

    #[tokio::test]
    async fn ignores_commented_urls() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("foo.toml"),
            "[[repo]]\nurl = \"https://github.com/foo/bar\"\n# url = \"https://github.com/baz/qux\"\n",
        )
        .expect("write");

        let reader = SourceReader::new(dir.path());
        assert_eq!(collect(&reader, "foo").await, vec!["https://github.com/foo/bar"]);
    }

    #[tokio::test]
    async fn skips_other_hosts_and_noise() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("eco.toml"),
            concat!(
                "# Ecosystem\n",
                "title = \"Eco\"\n",
                "\n",
                "[[repo]]\n",
                "url = \"https://gitlab.com/a/b\"\n",
                "  url   =  \"https://github.com/a/b\"\n",
                "missing_url = \"https://github.com/x/y\"\n",
                "[[repo]]\n",
                "url = \"https://github.com/c/d\"\n",
                "tags = [\"defi\"]\n",
            ),
        )
        .expect("write");

        let reader = SourceReader::new(dir.path());
        assert_eq!(
            collect(&reader, "eco").await,
            vec!["https://github.com/a/b", "https://github.com/c/d"]
        );
    }

    #[tokio::test]
    async fn missing_source_is_empty() {
        let dir = TempDir::new().expect("tempdir");
        let reader = SourceReader::new(dir.path());
        assert!(collect(&reader, "nope").await.is_empty());
    }

    #[tokio::test]
    async fn each_parse_restarts_from_top() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("eco.toml");
        std::fs::write(&path, "url = \"https://github.com/a/b\"\nurl = \"https://github.com/c/d\"\n")
            .expect("write");

        let reader = SourceReader::new(dir.path());
        let mut first = reader.parse("eco");
        assert_eq!(first.next().await.as_deref(), Some("https://github.com/a/b"));
        drop(first);

        let by_path = path.to_string_lossy().into_owned();
        assert_eq!(collect(&reader, &by_path).await.len(), 2);
        assert_eq!(collect(&reader, "eco").await.len(), 2);
    }

    #[tokio::test]
    async fn lists_nested_sources() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("e")).expect("mkdir");
        std::fs::write(dir.path().join("e/ethereum.toml"), "").expect("write");
        std::fs::write(dir.path().join("bitcoin.toml"), "").expect("write");
        std::fs::write(dir.path().join("README.md"), "").expect("write");

        let reader = SourceReader::new(dir.path());
        assert_eq!(
            reader.list_sources().await.expect("list"),
            vec!["bitcoin".to_string(), "e/ethereum".to_string()]
        );
    }
}
