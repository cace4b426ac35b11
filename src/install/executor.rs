// src/install/executor.rs

//! Execution of a single node
//!
//! The executor runs inside the caller's transaction. When it fails, nothing
//! it wrote to the database is kept and the node stays pending, so the same
//! node can be retried.

use crate::archive::PackageArchive;
use crate::config::EngineConfig;
use crate::db::models::{Node, Package, PackageExclusion, PackagePip, PackageRequirement, Queue};
use crate::error::{Error, Result};
use crate::install::handler::{
    HandlerRegistry, InstructionContext, InstructionOutcome, InteractiveDocument,
};
use crate::install::nodes::{NodeBuilder, NodeData};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{debug, info};

/// Result of executing one node
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStep {
    /// Node to execute next; equal to the executed node while awaiting input,
    /// empty at the end of the sequence
    pub next_node: String,
    pub document: Option<InteractiveDocument>,
}

pub struct NodeExecutor<'a> {
    conn: &'a Connection,
    config: &'a EngineConfig,
    handlers: &'a HandlerRegistry,
}

impl<'a> NodeExecutor<'a> {
    pub fn new(conn: &'a Connection, config: &'a EngineConfig, handlers: &'a HandlerRegistry) -> Self {
        Self {
            conn,
            config,
            handlers,
        }
    }

    /// Execute `token` and advance past it
    ///
    /// A node that already ran is not executed again; the call only reports
    /// its successor.
    pub fn execute(&self, process_no: i64, token: &str, input: Option<&Value>) -> Result<NodeStep> {
        let node = Node::find(self.conn, process_no, token)?.ok_or_else(|| Error::NodeNotFound {
            process_no,
            node: token.to_string(),
        })?;
        let queue = Queue::find_by_id(self.conn, node.queue_id)?
            .ok_or(Error::QueueNotFound(node.queue_id))?;
        let queue_id = queue.queue_id()?;

        let builder = NodeBuilder::new(self.conn, self.config);
        if node.done {
            debug!("Node {} already executed, skipping", token);
            return Ok(NodeStep {
                next_node: builder.get_next_node(process_no, Some(token))?,
                document: None,
            });
        }
        if queue.done {
            return Err(Error::QueueAlreadyDone(queue_id));
        }

        let data: NodeData = serde_json::from_str(&node.node_data).map_err(|e| {
            self.failure(&queue, &node, "", format!("corrupt node data: {}", e))
        })?;

        match &data {
            NodeData::Register => self.register_package(&queue)?,
            NodeData::Unregister => self.unregister_package(&queue)?,
            NodeData::Instruction { instruction } => {
                let handler = self.handlers.get(&instruction.pip).ok_or_else(|| {
                    self.failure(&queue, &node, &instruction.pip, "no handler registered".to_string())
                })?;

                let archive = self.open_archive(&queue)?;
                let ctx = self.context(&queue, &node, archive.as_ref(), input);
                let outcome = handler
                    .install(&ctx, instruction)
                    .map_err(|e| self.failure(&queue, &node, &instruction.pip, e.to_string()))?;

                if let InstructionOutcome::AwaitingInput(document) = outcome {
                    info!("Node {} awaits user input", token);
                    return Ok(NodeStep {
                        next_node: token.to_string(),
                        document: Some(document),
                    });
                }

                if let Some(package_id) = queue.package_id {
                    PackagePip::record(self.conn, package_id, &instruction.pip)?;
                }
            }
            NodeData::Revert { pip } => {
                let handler = self.handlers.get(pip).ok_or_else(|| {
                    self.failure(&queue, &node, pip, "no handler registered".to_string())
                })?;

                let ctx = self.context(&queue, &node, None, input);
                handler
                    .uninstall(&ctx)
                    .map_err(|e| self.failure(&queue, &node, pip, e.to_string()))?;
            }
        }

        Node::mark_done(self.conn, process_no, token)?;

        let next_node = builder.get_next_node(process_no, Some(token))?;
        if builder.get_queue_by_node(process_no, &next_node)? != Some(queue_id) {
            Queue::mark_done(self.conn, queue_id)?;
            info!("Queue {} ({}) completed", queue_id, queue.package);
        }

        Ok(NodeStep {
            next_node,
            document: None,
        })
    }

    fn context<'c>(
        &'c self,
        queue: &'c Queue,
        node: &'c Node,
        archive: Option<&'c PackageArchive>,
        input: Option<&'c Value>,
    ) -> InstructionContext<'c> {
        InstructionContext {
            conn: self.conn,
            queue,
            package_id: queue.package_id,
            archive,
            install_root: &self.config.install_root,
            work_dir: &self.config.work_dir,
            deadline: self.config.deadline,
            node: &node.node,
            input,
        }
    }

    fn failure(&self, queue: &Queue, node: &Node, pip: &str, message: String) -> Error {
        Error::InstructionHandlerFailure {
            process_no: node.process_no,
            queue_id: queue.id.unwrap_or_default(),
            node: node.node.clone(),
            pip: pip.to_string(),
            message,
        }
    }

    fn open_archive(&self, queue: &Queue) -> Result<Option<PackageArchive>> {
        queue
            .archive
            .as_deref()
            .map(|path| PackageArchive::open(path, &self.config.base_package))
            .transpose()
    }

    /// Create or update the package record from the queue's archive
    fn register_package(&self, queue: &Queue) -> Result<()> {
        let queue_id = queue.queue_id()?;
        let archive = self
            .open_archive(queue)?
            .ok_or_else(|| Error::ArchiveNotFound(queue.package.clone()))?;
        let descriptor = archive.descriptor();

        let existing = match queue.package_id {
            Some(id) => Package::find_by_id(self.conn, id)?,
            None => None,
        };

        let mut package = existing.unwrap_or_else(|| {
            Package::new(
                descriptor.name.clone(),
                String::new(),
                descriptor.version.clone(),
            )
        });
        package.package_name = descriptor.localized_name(&self.config.language).to_string();
        let description = descriptor.package_description.resolve(&self.config.language);
        package.package_description = (!description.is_empty()).then(|| description.to_string());
        package.version = descriptor.version.clone();
        package.is_application = descriptor.is_application;
        package.package_url = descriptor.package_url.clone();
        package.author = descriptor.author.author.clone();
        package.author_url = descriptor.author.url.clone();
        package.package_date = descriptor.date;

        let package_id = match package.id {
            Some(id) => {
                package.update(self.conn)?;
                info!("Updated package {} to {}", package.package, package.version);
                id
            }
            None => {
                let id = package.insert(self.conn)?;
                info!("Registered package {} {}", package.package, package.version);
                id
            }
        };

        PackageRequirement::delete_by_package(self.conn, package_id)?;
        for requirement in &descriptor.requirements {
            PackageRequirement::new(package_id, requirement.name.clone(), requirement.min_version.clone())
                .insert(self.conn)?;
        }

        PackageExclusion::delete_by_package(self.conn, package_id)?;
        for exclusion in &descriptor.exclusions {
            PackageExclusion::new(package_id, exclusion.name.clone(), exclusion.version.clone())
                .insert(self.conn)?;
        }

        Queue::set_package_id(self.conn, queue_id, package_id)?;
        Ok(())
    }

    fn unregister_package(&self, queue: &Queue) -> Result<()> {
        let package_id = queue
            .package_id
            .ok_or_else(|| Error::PackageNotFound(queue.package.clone()))?;

        Package::delete(self.conn, package_id)?;
        info!("Removed package {}", queue.package);
        Ok(())
    }
}
