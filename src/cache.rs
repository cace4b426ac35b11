// src/cache.rs

//! Derived caches invalidated when an installation run finishes

use crate::error::Result;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

/// A cache whose contents are derived from installed packages
pub trait DerivedCache {
    /// Drop every cached entry
    fn flush_all(&self) -> Result<()>;
}

/// No derived cache
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl DerivedCache for NoCache {
    fn flush_all(&self) -> Result<()> {
        Ok(())
    }
}

/// Cache stored as files in a directory; flushing empties the directory
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    dir: PathBuf,
}

impl DirectoryCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DerivedCache for DirectoryCache {
    fn flush_all(&self) -> Result<()> {
        debug!("Flushing cache directory {}", self.dir.display());

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_cache_flush() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("options.json"), "{}").unwrap();
        fs::create_dir(dir.path().join("templates")).unwrap();
        fs::write(dir.path().join("templates/index.tpl"), "x").unwrap();

        DirectoryCache::new(dir.path()).flush_all().unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(dir.path().exists());
    }

    #[test]
    fn test_missing_cache_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DirectoryCache::new(dir.path().join("absent"));
        assert!(cache.flush_all().is_ok());
    }
}
