// src/lib.rs

//! Packforge package installation engine
//!
//! Installs packages from tar archives that carry a `package.xml` manifest,
//! resolving requirements and exclusions against the installed set and
//! executing instructions as a resumable, node-based process.
//!
//! # Architecture
//!
//! - Database-first: packages, queues, nodes and sessions live in SQLite
//! - Archives: manifest parsing and sub-archive extraction
//! - Resolver: open requirements and exclusion conflicts
//! - Install: node building and the stepped orchestrator, resumable from
//!   `(process_no, queue_id, node, step)`

pub mod archive;
pub mod cache;
pub mod config;
pub mod db;
mod error;
pub mod install;
pub mod resolver;
pub mod version;

pub use archive::{ArchiveSource, PackageArchive, PackageDescriptor};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use install::{HandlerRegistry, Orchestrator, Progress, StepResult};
