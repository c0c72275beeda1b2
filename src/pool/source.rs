//! Where subscription URLs come from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Yields the subscription URLs to sync.
pub trait SubscriptionSource: Send + Sync {
    fn load(&self) -> Result<Vec<String>>;

    /// Human-readable origin, used in error messages.
    fn describe(&self) -> String;
}

/// One URL per line; blank lines and `#` comments are skipped.
/// A missing file yields no URLs.
#[derive(Debug, Clone)]
pub struct FileSubscriptionSource {
    path: PathBuf,
}

impl FileSubscriptionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SubscriptionSource for FileSubscriptionSource {
    fn load(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(parse_url_list(&text))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Static list, handy for tests and one-off runs.
#[derive(Debug, Clone, Default)]
pub struct StaticSubscriptionSource {
    urls: Vec<String>,
}

impl StaticSubscriptionSource {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

impl SubscriptionSource for StaticSubscriptionSource {
    fn load(&self) -> Result<Vec<String>> {
        Ok(self.urls.clone())
    }

    fn describe(&self) -> String {
        "<static list>".to_string()
    }
}

fn parse_url_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_source_skips_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.txt");
        std::fs::write(
            &path,
            "# feeds\nhttps://a.example/sub\n\n   \n  https://b.example/clash.yaml  \n#https://disabled\n",
        )
        .unwrap();

        let urls = FileSubscriptionSource::new(&path).load().unwrap();
        assert_eq!(urls, vec!["https://a.example/sub", "https://b.example/clash.yaml"]);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileSubscriptionSource::new(dir.path().join("absent.txt"));
        assert!(source.load().unwrap().is_empty());
        assert!(source.describe().ends_with("absent.txt"));
    }

    #[test]
    fn static_source() {
        let source = StaticSubscriptionSource::new(["u1", "u2"]);
        assert_eq!(source.load().unwrap(), vec!["u1", "u2"]);
    }
}
