// src/config.rs

//! Engine configuration
//!
//! All persistent state lives in the database; this struct only carries the
//! locations and defaults an installation run needs. The CLI fills it from
//! its arguments.

use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Package every other package implicitly requires
pub const DEFAULT_BASE_PACKAGE: &str = "com.packforge.core";

/// Name of the manifest entry inside a package archive
pub const MANIFEST_ENTRY: &str = "package.xml";

/// Default database location
pub const DEFAULT_DB_PATH: &str = "/var/lib/packforge/packforge.db";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database holding packages, queues and nodes
    pub db_path: PathBuf,
    /// Directory instruction handlers install into
    pub install_root: PathBuf,
    /// Downloads and extracted sub-archives; must survive between invocations
    pub work_dir: PathBuf,
    /// Derived cache flushed after a finished run
    pub cache_dir: Option<PathBuf>,
    /// Identifier of the base framework package
    pub base_package: String,
    /// Preferred language for localized manifest texts
    pub language: String,
    /// Upper bound for a single HTTP request
    pub http_timeout: Duration,
    /// User recorded on created queues
    pub user_id: i64,
    /// Point after which fetching and extracting archives fails with a timeout
    pub deadline: Option<Instant>,
}

impl EngineConfig {
    /// Configuration rooted at a single directory (database, work dir and install root inside it)
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db_path: dir.join("packforge.db"),
            install_root: dir.join("root"),
            work_dir: dir.join("work"),
            cache_dir: None,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            install_root: PathBuf::from("/"),
            work_dir: std::env::temp_dir().join("packforge"),
            cache_dir: None,
            base_package: DEFAULT_BASE_PACKAGE.to_string(),
            language: "en".to_string(),
            http_timeout: Duration::from_secs(30),
            user_id: 0,
            deadline: None,
        }
    }
}
