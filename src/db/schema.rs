// src/db/schema.rs

//! Database schema definitions and migrations for Packforge
//!
//! This module defines the SQLite schema for all core tables and provides
//! a migration system to evolve the schema over time.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    // Apply migrations in order
    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates the installed-package tables:
/// - packages: Installed package records
/// - package_requirements: Declared requirements of installed packages
/// - package_exclusions: Packages an installed package refuses to coexist with
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Packages: one row per installed package version
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT NOT NULL,
            package_name TEXT NOT NULL,
            package_description TEXT,
            version TEXT NOT NULL,
            is_application INTEGER NOT NULL DEFAULT 0,
            package_url TEXT NOT NULL DEFAULT '',
            author TEXT,
            author_url TEXT,
            package_date INTEGER,
            installed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT,
            UNIQUE(package, version)
        );

        CREATE INDEX idx_packages_package ON packages(package);

        -- Requirements declared by installed packages
        CREATE TABLE package_requirements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            requirement TEXT NOT NULL,
            min_version TEXT,
            UNIQUE(package_id, requirement),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_requirements_requirement ON package_requirements(requirement);

        -- Exclusions declared by installed packages
        CREATE TABLE package_exclusions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            excluded_package TEXT NOT NULL,
            excluded_version TEXT,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_exclusions_excluded ON package_exclusions(excluded_package);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Installation queues and nodes
///
/// - installation_queue: One row per install/update/uninstall run or dependency sub-run
/// - installation_nodes: Expanded, ordered instruction sequence of a process
/// - installation_sessions: Resumption point of a process
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE installation_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            process_no INTEGER NOT NULL,
            user_id INTEGER NOT NULL DEFAULT 0,
            package TEXT NOT NULL,
            package_name TEXT NOT NULL DEFAULT '',
            package_id INTEGER,
            archive TEXT,
            action TEXT NOT NULL CHECK(action IN ('install', 'update', 'uninstall')),
            parent_queue_id INTEGER NOT NULL DEFAULT 0,
            done INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE SET NULL
        );

        CREATE INDEX idx_queue_process ON installation_queue(process_no);
        CREATE INDEX idx_queue_package ON installation_queue(package);

        CREATE TABLE installation_nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            process_no INTEGER NOT NULL,
            queue_id INTEGER NOT NULL,
            sequence_no INTEGER NOT NULL,
            node TEXT NOT NULL,
            parent_node TEXT NOT NULL DEFAULT '',
            node_type TEXT NOT NULL CHECK(node_type IN ('package', 'pip')),
            node_data TEXT NOT NULL,
            done INTEGER NOT NULL DEFAULT 0,
            UNIQUE(process_no, node),
            FOREIGN KEY (queue_id) REFERENCES installation_queue(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_nodes_parent ON installation_nodes(process_no, parent_node);
        CREATE INDEX idx_nodes_queue ON installation_nodes(queue_id);

        CREATE TABLE installation_sessions (
            process_no INTEGER PRIMARY KEY,
            queue_id INTEGER NOT NULL,
            node TEXT NOT NULL DEFAULT '',
            step TEXT NOT NULL CHECK(step IN ('prepare', 'install', 'uninstall', 'done')),
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: Per-package installation artifacts
///
/// - package_pips: Instruction handlers that ran for a package, replayed on uninstall
/// - package_files: Files placed by the file handler
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "
        CREATE TABLE package_pips (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            pip TEXT NOT NULL,
            UNIQUE(package_id, pip),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE TABLE package_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            UNIQUE(package_id, path),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_files_path ON package_files(path);
        ",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}
