//! Content files plus metadata for each session key.
//!
//! Files live under the cache directory as `<key>.html`, `<key>.template`
//! and `<key>.data`. The metadata row is written after the files so a reader
//! never sees a row pointing at missing content.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::connection::CacheDb;
use super::hash::content_hash;
use super::session_data::SessionData;
use crate::Error;
use crate::template::DataMap;

/// A document ready to be persisted for one key.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub html: String,
    /// Separated template; `None` removes any stale template file.
    pub template: Option<String>,
    /// Separated data; `None` removes any stale data file.
    pub data: Option<DataMap>,
    pub etag: String,
    pub template_tag: String,
    pub csp: Option<String>,
    pub csp_report_only: Option<String>,
}

/// Persistent cache: SQLite metadata plus a directory of content files.
#[derive(Clone, Debug)]
pub struct CacheStore {
    db: CacheDb,
    dir: PathBuf,
}

impl CacheStore {
    /// Create a store, making sure the content directory exists.
    pub async fn new(db: CacheDb, dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { db, dir })
    }

    fn path(&self, key: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ext}"))
    }

    pub fn html_path(&self, key: &str) -> PathBuf {
        self.path(key, "html")
    }

    pub fn template_path(&self, key: &str) -> PathBuf {
        self.path(key, "template")
    }

    pub fn data_path(&self, key: &str) -> PathBuf {
        self.path(key, "data")
    }

    pub async fn session_data(&self, key: &str) -> Result<Option<SessionData>, Error> {
        self.db.get_session_data(key).await
    }

    /// Full cached document, or `None` if the file does not exist.
    pub async fn read_html(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        read_optional(&self.html_path(key)).await
    }

    pub async fn read_template(&self, key: &str) -> Result<Option<String>, Error> {
        match read_optional(&self.template_path(key)).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    pub async fn read_data(&self, key: &str) -> Result<Option<DataMap>, Error> {
        match read_optional(&self.data_path(key)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write content files and then the metadata row.
    ///
    /// Hash and size are computed from `req.html`. Returns the stored metadata.
    pub async fn save(&self, key: &str, req: SaveRequest) -> Result<SessionData, Error> {
        tokio::fs::write(self.html_path(key), req.html.as_bytes()).await?;

        match &req.template {
            Some(template) => tokio::fs::write(self.template_path(key), template.as_bytes()).await?,
            None => remove_optional(&self.template_path(key)).await?,
        }
        match &req.data {
            Some(data) => tokio::fs::write(self.data_path(key), serde_json::to_vec(data)?).await?,
            None => remove_optional(&self.data_path(key)).await?,
        }

        let data = SessionData {
            session_key: key.to_string(),
            etag: req.etag,
            template_tag: req.template_tag,
            html_hash: content_hash(req.html.as_bytes()),
            html_size: req.html.len() as u64,
            csp: req.csp,
            csp_report_only: req.csp_report_only,
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        self.db.upsert_session_data(&data).await?;

        tracing::debug!(key, size = data.html_size, "Saved session cache");
        Ok(data)
    }

    /// Remove the metadata row and content files for one key.
    ///
    /// The key's cooldown window is left in place.
    pub async fn purge(&self, key: &str) -> Result<(), Error> {
        self.db.remove_session_data(key).await?;
        for ext in ["html", "template", "data"] {
            remove_optional(&self.path(key, ext)).await?;
        }
        tracing::debug!(key, "Purged session cache");
        Ok(())
    }

    /// Remove every cached entry, content file and cooldown window.
    pub async fn purge_all(&self) -> Result<u64, Error> {
        let count = self.db.clear_all().await?;

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ours = matches!(path.extension().and_then(|e| e.to_str()), Some("html" | "template" | "data"));
            if ours && entry.file_type().await?.is_file() {
                remove_optional(&path).await?;
            }
        }

        tracing::info!(count, "Cleared session cache");
        Ok(count)
    }

    pub async fn set_unavailable_until(&self, key: &str, until_ms: i64) -> Result<(), Error> {
        self.db.set_unavailable_until(key, until_ms).await
    }

    pub async fn unavailable_until(&self, key: &str) -> Result<i64, Error> {
        self.db.unavailable_until(key).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_optional(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
