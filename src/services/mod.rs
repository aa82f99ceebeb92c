//! External collaborators
//!
//! Contracts for the parts of the application this core only talks to:
//! event branding lookup, reference track resolution and asset fetching.
//! Simple local implementations are provided for solo use and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Branding hints for an event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBranding {
    pub event_id: String,
    pub name: Option<String>,
    /// `#rrggbb` hint for the fallback badge
    pub primary_color: Option<String>,
    pub secondary_color: Option<String>,
    pub logo_url: Option<String>,
}

/// Event/branding lookup
#[async_trait]
pub trait EventDirectory: Send + Sync {
    async fn branding(&self, event_id: &str) -> anyhow::Result<EventBranding>;
}

/// Reference track resolution: song id to a directly playable URL or path
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, song_id: &str) -> anyhow::Result<String>;
}

/// Fetches raw asset bytes (logos)
#[async_trait]
pub trait AssetLoader: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// In-memory event directory
#[derive(Debug, Default, Clone)]
pub struct StaticEventDirectory {
    events: HashMap<String, EventBranding>,
}

impl StaticEventDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, branding: EventBranding) -> Self {
        self.events.insert(branding.event_id.clone(), branding);
        self
    }
}

#[async_trait]
impl EventDirectory for StaticEventDirectory {
    async fn branding(&self, event_id: &str) -> anyhow::Result<EventBranding> {
        self.events
            .get(event_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown event: {}", event_id))
    }
}

/// Resolves songs to `<dir>/<song_id>.<ext>` for the first existing extension
#[derive(Debug, Clone)]
pub struct LocalTrackResolver {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl LocalTrackResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extensions: vec!["mp4".to_string(), "webm".to_string(), "mov".to_string()],
        }
    }
}

#[async_trait]
impl TrackResolver for LocalTrackResolver {
    async fn resolve(&self, song_id: &str) -> anyhow::Result<String> {
        if song_id.is_empty() || song_id.contains(|c: char| c == '/' || c == '\\') || song_id.contains("..") {
            anyhow::bail!("Invalid song id: {:?}", song_id);
        }
        for ext in &self.extensions {
            let path = self.dir.join(format!("{}.{}", song_id, ext));
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path.to_string_lossy().to_string());
            }
        }
        anyhow::bail!("No track for song {} in {:?}", song_id, self.dir)
    }
}

/// Reads assets from local paths or `file://` URLs
#[derive(Debug, Default, Clone)]
pub struct FileAssetLoader {
    base_dir: Option<PathBuf>,
}

impl FileAssetLoader {
    /// Relative paths are resolved against `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, url: &str) -> anyhow::Result<PathBuf> {
        let raw = match url.strip_prefix("file://") {
            Some(rest) => urlencoding::decode(rest)?.into_owned(),
            None if url.contains("://") => {
                anyhow::bail!("Unsupported asset scheme: {}", url)
            }
            None => url.to_string(),
        };
        let path = Path::new(&raw);
        Ok(match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        })
    }
}

#[async_trait]
impl AssetLoader for FileAssetLoader {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(url)?;
        Ok(tokio::fs::read(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_resolver_finds_first_extension() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("song-1.webm"), b"x").unwrap();
        let resolver = LocalTrackResolver::new(dir.path());

        let url = resolver.resolve("song-1").await.unwrap();
        assert!(url.ends_with("song-1.webm"));
        assert!(resolver.resolve("missing").await.is_err());
        assert!(resolver.resolve("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_file_loader_handles_file_urls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("my logo.png");
        std::fs::write(&path, b"png").unwrap();

        let loader = FileAssetLoader::default();
        let url = format!(
            "file://{}",
            path.to_string_lossy().replace(' ', "%20")
        );
        assert_eq!(loader.fetch(&url).await.unwrap(), b"png");
        assert!(loader.fetch("https://cdn.example.com/logo.png").await.is_err());

        let relative = FileAssetLoader::with_base_dir(dir.path());
        assert_eq!(relative.fetch("my logo.png").await.unwrap(), b"png");
    }

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticEventDirectory::new().with_event(EventBranding {
            event_id: "gala".into(),
            logo_url: Some("logos/gala.png".into()),
            ..Default::default()
        });
        let branding = directory.branding("gala").await.unwrap();
        assert_eq!(branding.logo_url.as_deref(), Some("logos/gala.png"));
        assert!(directory.branding("other").await.is_err());
    }
}
