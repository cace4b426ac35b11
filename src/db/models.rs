// src/db/models.rs

//! Data models for Packforge database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Convert a text column into an enum, mapping parse failures to a conversion error
fn parse_column<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

/// An installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: Option<i64>,
    /// Unique identifier, e.g. `com.example.plugin`
    pub package: String,
    /// Display name
    pub package_name: String,
    pub package_description: Option<String>,
    pub version: String,
    pub is_application: bool,
    pub package_url: String,
    pub author: Option<String>,
    pub author_url: Option<String>,
    pub package_date: Option<i64>,
    pub installed_at: Option<String>,
    pub updated_at: Option<String>,
}

const PACKAGE_COLUMNS: &str = "id, package, package_name, package_description, version, is_application, package_url, author, author_url, package_date, installed_at, updated_at";

impl Package {
    /// Create a new Package
    pub fn new(package: String, package_name: String, version: String) -> Self {
        Self {
            id: None,
            package,
            package_name,
            package_description: None,
            version,
            is_application: false,
            package_url: String::new(),
            author: None,
            author_url: None,
            package_date: None,
            installed_at: None,
            updated_at: None,
        }
    }

    /// Insert this package into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO packages (package, package_name, package_description, version, is_application,
                                   package_url, author, author_url, package_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.package,
                &self.package_name,
                &self.package_description,
                &self.version,
                self.is_application,
                &self.package_url,
                &self.author,
                &self.author_url,
                &self.package_date,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Update the stored metadata of this package
    pub fn update(&self, conn: &Connection) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update package without ID".to_string()))?;

        conn.execute(
            "UPDATE packages SET package_name = ?1, package_description = ?2, version = ?3,
             is_application = ?4, package_url = ?5, author = ?6, author_url = ?7,
             package_date = ?8, updated_at = CURRENT_TIMESTAMP WHERE id = ?9",
            params![
                &self.package_name,
                &self.package_description,
                &self.version,
                self.is_application,
                &self.package_url,
                &self.author,
                &self.author_url,
                &self.package_date,
                id,
            ],
        )?;

        Ok(())
    }

    /// Find a package by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE id = ?1",
            PACKAGE_COLUMNS
        ))?;

        let package = stmt.query_row([id], Self::from_row).optional()?;

        Ok(package)
    }

    /// Find all installed versions of a package identifier
    pub fn find_by_name(conn: &Connection, package: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE package = ?1 ORDER BY id",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([package], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Find the installed record of a package with the highest version
    pub fn find_latest_by_name(conn: &Connection, package: &str) -> Result<Option<Self>> {
        Self::latest(Self::find_by_name(conn, package)?)
    }

    /// The record with the highest version; the first one wins on ties
    pub fn latest(candidates: Vec<Self>) -> Result<Option<Self>> {
        let mut latest: Option<(Version, Self)> = None;
        for candidate in candidates {
            let version = Version::parse(&candidate.version)?;
            match &latest {
                Some((best, _)) if *best >= version => {}
                _ => latest = Some((version, candidate)),
            }
        }

        Ok(latest.map(|(_, package)| package))
    }

    /// List all installed packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages ORDER BY package, version",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Search installed packages by identifier or display name
    pub fn search(conn: &Connection, pattern: &str) -> Result<Vec<Self>> {
        let like = format!("%{}%", pattern);
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE package LIKE ?1 OR package_name LIKE ?1 ORDER BY package, version",
            PACKAGE_COLUMNS
        ))?;

        let packages = stmt
            .query_map([like], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Count installed applications whose identifier ends with `.abbreviation`
    pub fn count_applications_with_abbreviation(
        conn: &Connection,
        abbreviation: &str,
    ) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM packages WHERE is_application = 1 AND package LIKE ?1",
            [format!("%.{}", abbreviation)],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// Delete a package by ID
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM packages WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Convert a database row to a Package
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package: row.get(1)?,
            package_name: row.get(2)?,
            package_description: row.get(3)?,
            version: row.get(4)?,
            is_application: row.get(5)?,
            package_url: row.get(6)?,
            author: row.get(7)?,
            author_url: row.get(8)?,
            package_date: row.get(9)?,
            installed_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

/// A requirement declared by an installed package
#[derive(Debug, Clone)]
pub struct PackageRequirement {
    pub id: Option<i64>,
    pub package_id: i64,
    pub requirement: String,
    pub min_version: Option<String>,
}

impl PackageRequirement {
    pub fn new(package_id: i64, requirement: String, min_version: Option<String>) -> Self {
        Self {
            id: None,
            package_id,
            requirement,
            min_version,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO package_requirements (package_id, requirement, min_version) VALUES (?1, ?2, ?3)",
            params![&self.package_id, &self.requirement, &self.min_version],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, requirement, min_version FROM package_requirements
             WHERE package_id = ?1 ORDER BY id",
        )?;

        let requirements = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(requirements)
    }

    /// Installed packages that require `package` (reverse dependencies)
    pub fn find_dependents(conn: &Connection, package: &str) -> Result<Vec<Package>> {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.package, p.package_name, p.package_description, p.version, p.is_application,
                    p.package_url, p.author, p.author_url, p.package_date, p.installed_at, p.updated_at
             FROM package_requirements r
             JOIN packages p ON p.id = r.package_id
             WHERE r.requirement = ?1
             ORDER BY p.package",
        )?;

        let packages = stmt
            .query_map([package], Package::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(packages)
    }

    pub fn delete_by_package(conn: &Connection, package_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM package_requirements WHERE package_id = ?1",
            [package_id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            requirement: row.get(2)?,
            min_version: row.get(3)?,
        })
    }
}

/// An exclusion declared by an installed package
#[derive(Debug, Clone)]
pub struct PackageExclusion {
    pub id: Option<i64>,
    pub package_id: i64,
    pub excluded_package: String,
    /// Version from which on the exclusion applies; `None` excludes every version
    pub excluded_version: Option<String>,
}

impl PackageExclusion {
    pub fn new(package_id: i64, excluded_package: String, excluded_version: Option<String>) -> Self {
        Self {
            id: None,
            package_id,
            excluded_package,
            excluded_version,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO package_exclusions (package_id, excluded_package, excluded_version) VALUES (?1, ?2, ?3)",
            params![&self.package_id, &self.excluded_package, &self.excluded_version],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, excluded_package, excluded_version FROM package_exclusions
             WHERE package_id = ?1 ORDER BY id",
        )?;

        let exclusions = stmt
            .query_map([package_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(exclusions)
    }

    /// Installed packages that exclude `package`, together with their declaration
    pub fn find_excluding(conn: &Connection, package: &str) -> Result<Vec<(Package, Self)>> {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.package, p.package_name, p.package_description, p.version, p.is_application,
                    p.package_url, p.author, p.author_url, p.package_date, p.installed_at, p.updated_at,
                    e.id, e.package_id, e.excluded_package, e.excluded_version
             FROM package_exclusions e
             JOIN packages p ON p.id = e.package_id
             WHERE e.excluded_package = ?1
             ORDER BY e.id",
        )?;

        let rows = stmt
            .query_map([package], |row| {
                let package = Package::from_row(row)?;
                let exclusion = Self {
                    id: Some(row.get(12)?),
                    package_id: row.get(13)?,
                    excluded_package: row.get(14)?,
                    excluded_version: row.get(15)?,
                };
                Ok((package, exclusion))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    pub fn delete_by_package(conn: &Connection, package_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM package_exclusions WHERE package_id = ?1",
            [package_id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            package_id: row.get(1)?,
            excluded_package: row.get(2)?,
            excluded_version: row.get(3)?,
        })
    }
}

/// Instruction handler types that ran for a package
pub struct PackagePip;

impl PackagePip {
    /// Record that `pip` ran for a package; recording twice is a no-op
    pub fn record(conn: &Connection, package_id: i64, pip: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO package_pips (package_id, pip) VALUES (?1, ?2)",
            params![package_id, pip],
        )?;
        Ok(())
    }

    /// Pips in the order they first ran
    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT pip FROM package_pips WHERE package_id = ?1 ORDER BY id")?;

        let pips = stmt
            .query_map([package_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        Ok(pips)
    }
}

/// Files placed into the install root on behalf of a package
pub struct PackageFile;

impl PackageFile {
    pub fn record(conn: &Connection, package_id: i64, path: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO package_files (package_id, path) VALUES (?1, ?2)",
            params![package_id, path],
        )?;
        Ok(())
    }

    pub fn find_by_package(conn: &Connection, package_id: i64) -> Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT path FROM package_files WHERE package_id = ?1 ORDER BY path")?;

        let paths = stmt
            .query_map([package_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        Ok(paths)
    }

    pub fn delete_by_package(conn: &Connection, package_id: i64) -> Result<()> {
        conn.execute("DELETE FROM package_files WHERE package_id = ?1", [package_id])?;
        Ok(())
    }
}

/// What a queue does to its package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Install,
    Update,
    Uninstall,
}

impl QueueAction {
    pub fn as_str(&self) -> &str {
        match self {
            QueueAction::Install => "install",
            QueueAction::Update => "update",
            QueueAction::Uninstall => "uninstall",
        }
    }
}

impl FromStr for QueueAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(QueueAction::Install),
            "update" => Ok(QueueAction::Update),
            "uninstall" => Ok(QueueAction::Uninstall),
            _ => Err(format!("Invalid queue action: {}", s)),
        }
    }
}

/// A persisted install/update/uninstall run, or a dependency sub-run of one
#[derive(Debug, Clone)]
pub struct Queue {
    pub id: Option<i64>,
    /// Groups a root queue and its dependency sub-queues
    pub process_no: i64,
    pub user_id: i64,
    /// Package identifier
    pub package: String,
    /// Display label for progress reporting
    pub package_name: String,
    /// `None` while the package is not installed yet
    pub package_id: Option<i64>,
    /// Local path of the package archive (install and update only)
    pub archive: Option<String>,
    pub action: QueueAction,
    /// 0 for the root queue
    pub parent_queue_id: i64,
    pub done: bool,
}

const QUEUE_COLUMNS: &str =
    "id, process_no, user_id, package, package_name, package_id, archive, action, parent_queue_id, done";

impl Queue {
    /// Create a new root queue
    pub fn new(process_no: i64, user_id: i64, package: String, action: QueueAction) -> Self {
        Self {
            id: None,
            process_no,
            user_id,
            package,
            package_name: String::new(),
            package_id: None,
            archive: None,
            action,
            parent_queue_id: 0,
            done: false,
        }
    }

    /// The queue id; only valid for persisted queues
    pub fn queue_id(&self) -> Result<i64> {
        self.id
            .ok_or_else(|| Error::InitError("Queue has not been persisted".to_string()))
    }

    /// Allocate a process number that no queue uses yet
    pub fn next_process_no(conn: &Connection) -> Result<i64> {
        let process_no = conn.query_row(
            "SELECT COALESCE(MAX(process_no), 0) + 1 FROM installation_queue",
            [],
            |row| row.get(0),
        )?;
        Ok(process_no)
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO installation_queue (process_no, user_id, package, package_name, package_id,
                                             archive, action, parent_queue_id, done)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &self.process_no,
                &self.user_id,
                &self.package,
                &self.package_name,
                &self.package_id,
                &self.archive,
                self.action.as_str(),
                &self.parent_queue_id,
                self.done,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_queue WHERE id = ?1",
            QUEUE_COLUMNS
        ))?;

        let queue = stmt.query_row([id], Self::from_row).optional()?;

        Ok(queue)
    }

    /// All queues of a process, root first
    pub fn find_by_process(conn: &Connection, process_no: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_queue WHERE process_no = ?1 ORDER BY id",
            QUEUE_COLUMNS
        ))?;

        let queues = stmt
            .query_map([process_no], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(queues)
    }

    /// Direct sub-queues of a queue
    pub fn find_children(conn: &Connection, parent_queue_id: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_queue WHERE parent_queue_id = ?1 ORDER BY id",
            QUEUE_COLUMNS
        ))?;

        let queues = stmt
            .query_map([parent_queue_id], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(queues)
    }

    /// An unfinished queue working on `package`, in any process
    pub fn find_active_by_package(conn: &Connection, package: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_queue WHERE package = ?1 AND done = 0 ORDER BY id LIMIT 1",
            QUEUE_COLUMNS
        ))?;

        let queue = stmt.query_row([package], Self::from_row).optional()?;

        Ok(queue)
    }

    pub fn mark_done(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("UPDATE installation_queue SET done = 1 WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn set_package_id(conn: &Connection, id: i64, package_id: i64) -> Result<()> {
        conn.execute(
            "UPDATE installation_queue SET package_id = ?1 WHERE id = ?2",
            [package_id, id],
        )?;
        Ok(())
    }

    pub fn set_package_name(conn: &Connection, id: i64, package_name: &str) -> Result<()> {
        conn.execute(
            "UPDATE installation_queue SET package_name = ?1 WHERE id = ?2",
            params![package_name, id],
        )?;
        Ok(())
    }

    /// Remove the unfinished sub-queues of a process (their nodes cascade)
    pub fn delete_pending_children(conn: &Connection, process_no: i64) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM installation_queue WHERE process_no = ?1 AND parent_queue_id != 0 AND done = 0",
            [process_no],
        )?;
        Ok(deleted)
    }

    /// Remove every unfinished queue of a process, the root included
    pub fn delete_pending_by_process(conn: &Connection, process_no: i64) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM installation_queue WHERE process_no = ?1 AND done = 0",
            [process_no],
        )?;
        Ok(deleted)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            process_no: row.get(1)?,
            user_id: row.get(2)?,
            package: row.get(3)?,
            package_name: row.get(4)?,
            package_id: row.get(5)?,
            archive: row.get(6)?,
            action: parse_column(row, 7)?,
            parent_queue_id: row.get(8)?,
            done: row.get(9)?,
        })
    }
}

/// Kind of work a node performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Registers, updates or removes the package record
    Package,
    /// Runs one instruction through its handler
    Pip,
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Package => "package",
            NodeType::Pip => "pip",
        }
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "package" => Ok(NodeType::Package),
            "pip" => Ok(NodeType::Pip),
            _ => Err(format!("Invalid node type: {}", s)),
        }
    }
}

/// One position in the expanded instruction sequence of a process
#[derive(Debug, Clone)]
pub struct Node {
    pub id: Option<i64>,
    pub process_no: i64,
    pub queue_id: i64,
    /// Position within the process, strictly increasing
    pub sequence_no: i64,
    /// Opaque token
    pub node: String,
    /// Token of the preceding node; empty for the first node
    pub parent_node: String,
    pub node_type: NodeType,
    /// JSON payload
    pub node_data: String,
    pub done: bool,
}

const NODE_COLUMNS: &str =
    "id, process_no, queue_id, sequence_no, node, parent_node, node_type, node_data, done";

impl Node {
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO installation_nodes (process_no, queue_id, sequence_no, node, parent_node,
                                             node_type, node_data, done)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &self.process_no,
                &self.queue_id,
                &self.sequence_no,
                &self.node,
                &self.parent_node,
                self.node_type.as_str(),
                &self.node_data,
                self.done,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Look up a node; never crosses into another process
    pub fn find(conn: &Connection, process_no: i64, node: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_nodes WHERE process_no = ?1 AND node = ?2",
            NODE_COLUMNS
        ))?;

        let node = stmt
            .query_row(params![process_no, node], Self::from_row)
            .optional()?;

        Ok(node)
    }

    /// The node that follows `parent_node` (empty string for the first node)
    pub fn find_child(conn: &Connection, process_no: i64, parent_node: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_nodes WHERE process_no = ?1 AND parent_node = ?2",
            NODE_COLUMNS
        ))?;

        let node = stmt
            .query_row(params![process_no, parent_node], Self::from_row)
            .optional()?;

        Ok(node)
    }

    /// All nodes of a process in sequence order
    pub fn find_by_process(conn: &Connection, process_no: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM installation_nodes WHERE process_no = ?1 ORDER BY sequence_no",
            NODE_COLUMNS
        ))?;

        let nodes = stmt
            .query_map([process_no], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(nodes)
    }

    pub fn count_by_process(conn: &Connection, process_no: i64) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM installation_nodes WHERE process_no = ?1",
            [process_no],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of nodes of a process positioned at or before `sequence_no`
    pub fn count_up_to(conn: &Connection, process_no: i64, sequence_no: i64) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM installation_nodes WHERE process_no = ?1 AND sequence_no <= ?2",
            [process_no, sequence_no],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mark_done(conn: &Connection, process_no: i64, node: &str) -> Result<()> {
        conn.execute(
            "UPDATE installation_nodes SET done = 1 WHERE process_no = ?1 AND node = ?2",
            params![process_no, node],
        )?;
        Ok(())
    }

    pub fn delete_by_process(conn: &Connection, process_no: i64) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM installation_nodes WHERE process_no = ?1",
            [process_no],
        )?;
        Ok(deleted)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            process_no: row.get(1)?,
            queue_id: row.get(2)?,
            sequence_no: row.get(3)?,
            node: row.get(4)?,
            parent_node: row.get(5)?,
            node_type: parse_column(row, 6)?,
            node_data: row.get(7)?,
            done: row.get(8)?,
        })
    }
}

/// State of the installation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Prepare,
    Install,
    Uninstall,
    Done,
}

impl Step {
    pub fn as_str(&self) -> &str {
        match self {
            Step::Prepare => "prepare",
            Step::Install => "install",
            Step::Uninstall => "uninstall",
            Step::Done => "done",
        }
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Step::Prepare),
            "install" => Ok(Step::Install),
            "uninstall" => Ok(Step::Uninstall),
            "done" => Ok(Step::Done),
            _ => Err(format!("Invalid step: {}", s)),
        }
    }
}

/// The resumption point of a process: everything needed to rebuild the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub process_no: i64,
    #[serde(rename = "queueID")]
    pub queue_id: i64,
    /// Current node; empty before `prepare` and after the last node
    pub node: String,
    pub step: Step,
}

impl SessionState {
    pub fn new(process_no: i64, queue_id: i64, step: Step) -> Self {
        Self {
            process_no,
            queue_id,
            node: String::new(),
            step,
        }
    }

    /// Insert or replace the stored session of this process
    pub fn save(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO installation_sessions (process_no, queue_id, node, step)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(process_no) DO UPDATE SET
                queue_id = excluded.queue_id,
                node = excluded.node,
                step = excluded.step,
                updated_at = CURRENT_TIMESTAMP",
            params![&self.process_no, &self.queue_id, &self.node, self.step.as_str()],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, process_no: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT process_no, queue_id, node, step FROM installation_sessions WHERE process_no = ?1",
        )?;

        let session = stmt.query_row([process_no], Self::from_row).optional()?;

        Ok(session)
    }

    pub fn delete(conn: &Connection, process_no: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM installation_sessions WHERE process_no = ?1",
            [process_no],
        )?;
        Ok(())
    }

    /// Sessions that have not reached `done`
    pub fn list_pending(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT process_no, queue_id, node, step FROM installation_sessions
             WHERE step != 'done' ORDER BY process_no",
        )?;

        let sessions = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            process_no: row.get(0)?,
            queue_id: row.get(1)?,
            node: row.get(2)?,
            step: parse_column(row, 3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn insert_package(conn: &Connection, name: &str, version: &str) -> i64 {
        let mut package = Package::new(name.to_string(), name.to_string(), version.to_string());
        package.insert(conn).unwrap()
    }

    #[test]
    fn test_package_crud() {
        let (_temp, conn) = create_test_db();

        let mut package = Package::new(
            "com.example.blog".to_string(),
            "Blog".to_string(),
            "1.0.0".to_string(),
        );
        package.is_application = true;
        package.author = Some("Example Ltd".to_string());
        let id = package.insert(&conn).unwrap();

        let found = Package::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.package, "com.example.blog");
        assert!(found.is_application);
        assert_eq!(found.author.as_deref(), Some("Example Ltd"));

        let mut updated = found.clone();
        updated.version = "1.1.0".to_string();
        updated.update(&conn).unwrap();
        let found = Package::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.version, "1.1.0");
        assert!(found.updated_at.is_some());

        Package::delete(&conn, id).unwrap();
        assert!(Package::find_by_id(&conn, id).unwrap().is_none());
    }

    #[test]
    fn test_find_latest_by_name() {
        let (_temp, conn) = create_test_db();
        insert_package(&conn, "com.example.lib", "1.10.0");
        insert_package(&conn, "com.example.lib", "1.9.0");
        insert_package(&conn, "com.example.lib", "1.10.0 Beta 1");

        let latest = Package::find_latest_by_name(&conn, "com.example.lib")
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, "1.10.0");
        assert!(Package::find_latest_by_name(&conn, "com.example.none").unwrap().is_none());
    }

    #[test]
    fn test_latest_keeps_first_of_equal_versions() {
        let mut first = Package::new("com.example.lib".to_string(), "A".to_string(), "2.0.0".to_string());
        first.id = Some(1);
        let mut second = first.clone();
        second.id = Some(2);
        let older = Package::new("com.example.lib".to_string(), "B".to_string(), "1.0.0 pl 3".to_string());

        let latest = Package::latest(vec![older, first, second]).unwrap().unwrap();
        assert_eq!(latest.id, Some(1));
        assert!(Package::latest(Vec::new()).unwrap().is_none());

        let invalid = Package::new("com.example.lib".to_string(), "C".to_string(), "1.0.x".to_string());
        assert!(matches!(
            Package::latest(vec![invalid]),
            Err(Error::InvalidVersionFormat(_))
        ));
    }

    #[test]
    fn test_application_abbreviation_count() {
        let (_temp, conn) = create_test_db();
        let mut app = Package::new(
            "com.example.blog".to_string(),
            "Blog".to_string(),
            "1.0.0".to_string(),
        );
        app.is_application = true;
        app.insert(&conn).unwrap();
        insert_package(&conn, "org.other.blog", "1.0.0");

        assert_eq!(Package::count_applications_with_abbreviation(&conn, "blog").unwrap(), 1);
        assert_eq!(Package::count_applications_with_abbreviation(&conn, "wiki").unwrap(), 0);
    }

    #[test]
    fn test_requirements_and_dependents() {
        let (_temp, conn) = create_test_db();
        let core = insert_package(&conn, "com.example.core", "1.0.0");
        let plugin = insert_package(&conn, "com.example.plugin", "1.0.0");

        PackageRequirement::new(plugin, "com.example.core".to_string(), Some("1.0.0".to_string()))
            .insert(&conn)
            .unwrap();

        let dependents = PackageRequirement::find_dependents(&conn, "com.example.core").unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].package, "com.example.plugin");
        assert!(PackageRequirement::find_dependents(&conn, "com.example.plugin").unwrap().is_empty());

        // Requirements cascade with their package
        Package::delete(&conn, plugin).unwrap();
        assert!(PackageRequirement::find_by_package(&conn, plugin).unwrap().is_empty());
        assert!(Package::find_by_id(&conn, core).unwrap().is_some());
    }

    #[test]
    fn test_find_excluding() {
        let (_temp, conn) = create_test_db();
        let other = insert_package(&conn, "com.example.other", "2.0.0");
        PackageExclusion::new(other, "com.example.plugin".to_string(), Some("3.0.0".to_string()))
            .insert(&conn)
            .unwrap();

        let rows = PackageExclusion::find_excluding(&conn, "com.example.plugin").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.package, "com.example.other");
        assert_eq!(rows[0].1.excluded_version.as_deref(), Some("3.0.0"));
    }

    #[test]
    fn test_pips_and_files() {
        let (_temp, conn) = create_test_db();
        let id = insert_package(&conn, "com.example.plugin", "1.0.0");

        PackagePip::record(&conn, id, "file").unwrap();
        PackagePip::record(&conn, id, "sql").unwrap();
        PackagePip::record(&conn, id, "file").unwrap();
        assert_eq!(PackagePip::find_by_package(&conn, id).unwrap(), vec!["file", "sql"]);

        PackageFile::record(&conn, id, "lib/a.txt").unwrap();
        PackageFile::record(&conn, id, "lib/a.txt").unwrap();
        assert_eq!(PackageFile::find_by_package(&conn, id).unwrap().len(), 1);
        PackageFile::delete_by_package(&conn, id).unwrap();
        assert!(PackageFile::find_by_package(&conn, id).unwrap().is_empty());
    }

    #[test]
    fn test_queue_crud() {
        let (_temp, conn) = create_test_db();

        let process_no = Queue::next_process_no(&conn).unwrap();
        assert_eq!(process_no, 1);

        let mut root = Queue::new(process_no, 1, "com.example.plugin".to_string(), QueueAction::Install);
        root.archive = Some("/tmp/plugin.tar".to_string());
        let root_id = root.insert(&conn).unwrap();

        let mut child = Queue::new(process_no, 1, "com.example.lib".to_string(), QueueAction::Install);
        child.parent_queue_id = root_id;
        child.insert(&conn).unwrap();

        assert_eq!(Queue::next_process_no(&conn).unwrap(), 2);
        assert_eq!(Queue::find_by_process(&conn, process_no).unwrap().len(), 2);
        assert_eq!(Queue::find_children(&conn, root_id).unwrap().len(), 1);

        let active = Queue::find_active_by_package(&conn, "com.example.plugin").unwrap();
        assert_eq!(active.unwrap().id, Some(root_id));

        Queue::mark_done(&conn, root_id).unwrap();
        assert!(Queue::find_by_id(&conn, root_id).unwrap().unwrap().done);
        assert!(Queue::find_active_by_package(&conn, "com.example.plugin").unwrap().is_none());

        assert_eq!(Queue::delete_pending_children(&conn, process_no).unwrap(), 1);
        assert_eq!(Queue::find_by_process(&conn, process_no).unwrap().len(), 1);

        let mut pending = Queue::new(2, 1, "com.example.other".to_string(), QueueAction::Install);
        pending.insert(&conn).unwrap();
        assert_eq!(Queue::delete_pending_by_process(&conn, 2).unwrap(), 1);
        assert_eq!(Queue::delete_pending_by_process(&conn, process_no).unwrap(), 0);
        assert_eq!(Queue::find_by_process(&conn, process_no).unwrap().len(), 1);
    }

    #[test]
    fn test_session_save_and_update() {
        let (_temp, conn) = create_test_db();

        let mut session = SessionState::new(4, 9, Step::Prepare);
        session.save(&conn).unwrap();
        assert_eq!(SessionState::find(&conn, 4).unwrap(), Some(session.clone()));

        session.step = Step::Install;
        session.node = "abc".to_string();
        session.save(&conn).unwrap();
        let found = SessionState::find(&conn, 4).unwrap().unwrap();
        assert_eq!(found.step, Step::Install);
        assert_eq!(found.node, "abc");

        assert_eq!(SessionState::list_pending(&conn).unwrap().len(), 1);
        session.step = Step::Done;
        session.save(&conn).unwrap();
        assert!(SessionState::list_pending(&conn).unwrap().is_empty());

        SessionState::delete(&conn, 4).unwrap();
        assert!(SessionState::find(&conn, 4).unwrap().is_none());
    }
}
