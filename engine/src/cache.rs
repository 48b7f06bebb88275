//! Per-host blob cache, used for the raw app catalog.

use std::{
    io,
    path::{Path, PathBuf},
};

use futures::future::BoxFuture;
use thiserror::Error as ThisError;
use tokio::fs;

#[derive(Debug, ThisError)]
pub enum CacheError {
    #[error("Refusing to use '{0}' as a cache key")]
    InvalidKey(String),
    #[error("Cache I/O failed")]
    Io(#[from] io::Error),
}

/// Keyed by host uuid.
pub trait CacheStore: Send + Sync {
    fn write_app_catalog<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
        raw: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), CacheError>>;

    /// `Ok(None)` if nothing was cached for this host yet.
    fn read_app_catalog<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<Option<String>, CacheError>>;

    fn remove<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), CacheError>>;
}

/// Stores each catalog as `<dir>/applist/<uuid>`.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn applist_path(&self, uuid: &str) -> Result<PathBuf, CacheError> {
        let valid = !uuid.is_empty()
            && uuid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(CacheError::InvalidKey(uuid.to_owned()));
        }
        Ok(self.dir.join("applist").join(uuid))
    }
}

async fn write_atomically(path: &Path, content: &str) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

impl CacheStore for FileCacheStore {
    fn write_app_catalog<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
        raw: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), CacheError>> {
        Box::pin(async move { write_atomically(&self.applist_path(uuid)?, raw).await })
    }

    fn read_app_catalog<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<Option<String>, CacheError>> {
        Box::pin(async move {
            match fs::read_to_string(self.applist_path(uuid)?).await {
                Ok(raw) => Ok(Some(raw)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn remove<'future_life>(
        &'future_life self,
        uuid: &'future_life str,
    ) -> BoxFuture<'future_life, Result<(), CacheError>> {
        Box::pin(async move {
            match fs::remove_file(self.applist_path(uuid)?).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        })
    }
}
