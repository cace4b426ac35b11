// src/install/nodes.rs

//! Node building
//!
//! A process's work is flattened into a linked sequence of nodes. Each node
//! points at its predecessor through `parent_node`; the first node has an
//! empty parent and the empty string doubles as the end-of-sequence sentinel.
//! Bundled requirements become child queues whose nodes are built before the
//! nodes of the queue that needs them, so the sequence is depth-first.
//!
//! Extracted sub-archives live in the work directory only as long as a
//! queue refers to them. Builders hand the paths of archives that lost their
//! queue back to the caller, which removes them once its transaction commits.

use crate::archive::{Instruction, PackageArchive};
use crate::config::EngineConfig;
use crate::db::models::{Node, NodeType, Package, PackagePip, Queue, QueueAction};
use crate::error::{Error, Result};
use crate::resolver::{OpenRequirement, Resolver};
use crate::version::Version;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Payload stored with a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeData {
    /// Create or update the package record of the queue
    Register,
    /// Run an install or update instruction
    Instruction { instruction: Instruction },
    /// Undo what a handler did for the package
    Revert { pip: String },
    /// Delete the package record of the queue
    Unregister,
}

impl NodeData {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Register | NodeData::Unregister => NodeType::Package,
            NodeData::Instruction { .. } | NodeData::Revert { .. } => NodeType::Pip,
        }
    }
}

/// Position while appending nodes to a process
struct Cursor {
    process_no: i64,
    sequence_no: i64,
    last_node: String,
    /// Packages that already have a queue in this process
    planned: BTreeSet<String>,
    /// Sub-archives extracted while building
    extracted: Vec<PathBuf>,
}

/// Opaque token for a node position
fn node_token(process_no: i64, queue_id: i64, sequence_no: i64) -> String {
    let digest = Sha256::digest(format!("{}:{}:{}", process_no, queue_id, sequence_no).as_bytes());
    format!("{:x}", digest)[..40].to_string()
}

pub struct NodeBuilder<'a> {
    conn: &'a Connection,
    config: &'a EngineConfig,
}

impl<'a> NodeBuilder<'a> {
    pub fn new(conn: &'a Connection, config: &'a EngineConfig) -> Self {
        Self { conn, config }
    }

    /// Drop all node state of the queue's process, including unfinished child queues
    ///
    /// Returns the archives of the dropped child queues for [`remove_extracted`].
    pub fn purge_nodes(&self, queue: &Queue) -> Result<Vec<PathBuf>> {
        let stale: Vec<PathBuf> = Queue::find_by_process(self.conn, queue.process_no)?
            .into_iter()
            .filter(|q| q.parent_queue_id != 0 && !q.done)
            .filter_map(|q| q.archive.map(PathBuf::from))
            .collect();

        let nodes = Node::delete_by_process(self.conn, queue.process_no)?;
        let queues = Queue::delete_pending_children(self.conn, queue.process_no)?;
        debug!(
            "Purged {} node(s) and {} child queue(s) of process {}",
            nodes, queues, queue.process_no
        );
        Ok(stale)
    }

    /// Archives extracted for every child queue of a process, finished or not
    pub fn child_archives(&self, process_no: i64) -> Result<Vec<PathBuf>> {
        Ok(Queue::find_by_process(self.conn, process_no)?
            .into_iter()
            .filter(|q| q.parent_queue_id != 0)
            .filter_map(|q| q.archive.map(PathBuf::from))
            .collect())
    }

    /// Build the node sequence for a root queue; returns the number of nodes
    ///
    /// Sub-archives extracted by a failed build are removed before returning.
    pub fn build_nodes(&self, queue: &Queue) -> Result<usize> {
        let mut cursor = Cursor {
            process_no: queue.process_no,
            sequence_no: 0,
            last_node: String::new(),
            planned: BTreeSet::new(),
            extracted: Vec::new(),
        };

        let built = match queue.action {
            QueueAction::Install | QueueAction::Update => {
                cursor.planned.insert(queue.package.clone());
                self.build_install_nodes(queue, &mut cursor)
            }
            QueueAction::Uninstall => self.build_uninstall_nodes(queue, &mut cursor),
        };
        if let Err(e) = built {
            remove_extracted(&self.config.work_dir, &cursor.extracted);
            return Err(e);
        }

        info!(
            "Built {} node(s) for process {}",
            cursor.sequence_no, queue.process_no
        );
        Ok(cursor.sequence_no as usize)
    }

    fn append(&self, cursor: &mut Cursor, queue_id: i64, data: NodeData) -> Result<()> {
        let token = node_token(cursor.process_no, queue_id, cursor.sequence_no);
        let node_data = serde_json::to_string(&data)
            .map_err(|e| Error::InitError(format!("Failed to encode node data: {}", e)))?;

        let mut node = Node {
            id: None,
            process_no: cursor.process_no,
            queue_id,
            sequence_no: cursor.sequence_no,
            node: token.clone(),
            parent_node: cursor.last_node.clone(),
            node_type: data.node_type(),
            node_data,
            done: false,
        };
        node.insert(self.conn)?;

        cursor.sequence_no += 1;
        cursor.last_node = token;
        Ok(())
    }

    fn build_install_nodes(&self, queue: &Queue, cursor: &mut Cursor) -> Result<()> {
        let queue_id = queue.queue_id()?;
        let archive_path = queue
            .archive
            .as_deref()
            .ok_or_else(|| Error::ArchiveNotFound(queue.package.clone()))?;
        let archive = PackageArchive::open(archive_path, &self.config.base_package)?;
        let descriptor = archive.descriptor();

        let resolver = Resolver::new(descriptor, self.conn);
        let mut open = resolver.open_requirements()?;
        for declared in &descriptor.requirements {
            let Some(requirement) = open.remove(&declared.name) else {
                continue;
            };
            if cursor.planned.contains(&requirement.name) {
                continue;
            }

            let Some(file) = &requirement.file else {
                return Err(Error::UnsatisfiedRequirements(Box::new(resolver.report()?)));
            };

            let child = self.create_child_queue(queue, &archive, &requirement, file, cursor)?;
            cursor.planned.insert(requirement.name.clone());
            self.build_install_nodes(&child, cursor)?;
        }

        self.append(cursor, queue_id, NodeData::Register)?;

        let instructions: Vec<Instruction> = match queue.action {
            QueueAction::Update => {
                let installed = self.installed_package(queue)?;
                descriptor
                    .select_update_instructions(&installed.version)?
                    .to_vec()
            }
            _ => descriptor.install_instructions.clone(),
        };

        for instruction in instructions {
            self.append(cursor, queue_id, NodeData::Instruction { instruction })?;
        }

        Ok(())
    }

    fn installed_package(&self, queue: &Queue) -> Result<Package> {
        let package = match queue.package_id {
            Some(id) => Package::find_by_id(self.conn, id)?,
            None => Package::find_latest_by_name(self.conn, &queue.package)?,
        };
        package.ok_or_else(|| Error::PackageNotFound(queue.package.clone()))
    }

    /// Extract a bundled requirement and queue it under `parent`
    fn create_child_queue(
        &self,
        parent: &Queue,
        archive: &PackageArchive,
        requirement: &OpenRequirement,
        file: &str,
        cursor: &mut Cursor,
    ) -> Result<Queue> {
        let name = requirement.name.as_str();
        let extracted = archive.extract_entry_to(file, &self.config.work_dir, self.config.deadline)?;
        cursor.extracted.push(extracted.clone());

        let delivered = PackageArchive::open(&extracted, &self.config.base_package)?;
        let descriptor = delivered.descriptor();

        if descriptor.name != name {
            return Err(Error::MalformedManifest(format!(
                "'{}' delivers '{}' instead of '{}'",
                file, descriptor.name, name
            )));
        }

        if let Some(min_version) = &requirement.min_version {
            if Version::parse(&descriptor.version)? < Version::parse(min_version)? {
                return Err(Error::MalformedManifest(format!(
                    "'{}' delivers {} {}, below the required {}",
                    file, name, descriptor.version, min_version
                )));
            }
        }

        let installed = match requirement.package_id {
            Some(id) => Package::find_by_id(self.conn, id)?,
            None => None,
        };
        let action = match &installed {
            Some(installed) => {
                if !descriptor.is_valid_update(installed)? {
                    return Err(Error::NoApplicableUpdatePath {
                        package: name.to_string(),
                        installed_version: installed.version.clone(),
                    });
                }
                QueueAction::Update
            }
            None => {
                if !descriptor.is_valid_install() {
                    return Err(Error::NoInstallInstructions(name.to_string()));
                }
                QueueAction::Install
            }
        };

        let mut child = Queue::new(parent.process_no, parent.user_id, name.to_string(), action);
        child.package_name = descriptor.localized_name(&self.config.language).to_string();
        child.package_id = installed.and_then(|p| p.id);
        child.archive = Some(path_string(&extracted));
        child.parent_queue_id = parent.queue_id()?;
        child.insert(self.conn)?;

        debug!(
            "Queued delivered requirement {} ({}) under queue {}",
            name,
            action.as_str(),
            child.parent_queue_id
        );
        Ok(child)
    }

    fn build_uninstall_nodes(&self, queue: &Queue, cursor: &mut Cursor) -> Result<()> {
        let queue_id = queue.queue_id()?;
        let package_id = queue
            .package_id
            .ok_or_else(|| Error::PackageNotFound(queue.package.clone()))?;

        let mut pips = PackagePip::find_by_package(self.conn, package_id)?;
        pips.reverse();
        for pip in pips {
            self.append(cursor, queue_id, NodeData::Revert { pip })?;
        }

        self.append(cursor, queue_id, NodeData::Unregister)
    }

    /// Node following `current`, or the first node when `current` is `None`;
    /// the empty string marks the end of the sequence
    pub fn get_next_node(&self, process_no: i64, current: Option<&str>) -> Result<String> {
        let parent = match current {
            Some("") => return Ok(String::new()),
            Some(node) => node,
            None => "",
        };

        Ok(Node::find_child(self.conn, process_no, parent)?
            .map(|node| node.node)
            .unwrap_or_default())
    }

    /// Queue a node belongs to; `None` for the end sentinel
    pub fn get_queue_by_node(&self, process_no: i64, node: &str) -> Result<Option<i64>> {
        if node.is_empty() {
            return Ok(None);
        }

        let found = Node::find(self.conn, process_no, node)?.ok_or_else(|| Error::NodeNotFound {
            process_no,
            node: node.to_string(),
        })?;
        Ok(Some(found.queue_id))
    }

    /// Percentage of the sequence completed once `node` has run
    ///
    /// Stays below 100 for every real node; only the end sentinel yields 100.
    pub fn calculate_progress(&self, process_no: i64, node: &str) -> Result<u8> {
        if node.is_empty() {
            return Ok(100);
        }

        let found = Node::find(self.conn, process_no, node)?.ok_or_else(|| Error::NodeNotFound {
            process_no,
            node: node.to_string(),
        })?;

        let total = Node::count_by_process(self.conn, process_no)?;
        if total == 0 {
            return Ok(0);
        }
        let done = Node::count_up_to(self.conn, process_no, found.sequence_no)?;

        Ok(((done * 100) / total).min(99) as u8)
    }

    /// Label for progress reporting
    pub fn get_package_name_by_queue(&self, queue_id: i64) -> Result<String> {
        let queue = Queue::find_by_id(self.conn, queue_id)?.ok_or(Error::QueueNotFound(queue_id))?;
        if queue.package_name.is_empty() {
            Ok(queue.package)
        } else {
            Ok(queue.package_name)
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Delete extracted sub-archives; paths outside `work_dir` are left alone
pub fn remove_extracted(work_dir: &Path, paths: &[PathBuf]) {
    for path in paths {
        if !path.starts_with(work_dir) {
            debug!("Keeping {} outside the work directory", path.display());
            continue;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed extracted archive {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
