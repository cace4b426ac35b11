// src/install/planner.rs

//! Creation of installation and removal processes
//!
//! Planning validates the request and creates the root queue, its nodes and
//! the initial session in one IMMEDIATE transaction. A refused request,
//! including one whose delivered requirements turn out unusable, leaves
//! nothing behind. Unfinished processes can be dropped with
//! [`discard_process`].

use crate::archive::PackageArchive;
use crate::config::EngineConfig;
use crate::db::{
    self,
    models::{Node, Package, PackageRequirement, Queue, QueueAction, SessionState, Step},
};
use crate::error::{Error, Result};
use crate::install::nodes::{self, NodeBuilder};
use crate::resolver::{ResolutionReport, Resolver};
use crate::version::{self, Version};
use rusqlite::{Connection, Transaction};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A freshly created process
#[derive(Debug, Clone)]
pub struct Plan {
    pub process_no: i64,
    pub queue_id: i64,
    pub action: QueueAction,
    pub package: String,
    /// Resolution outcome (install and update only)
    pub report: Option<ResolutionReport>,
    pub session: SessionState,
}

fn ensure_not_busy(tx: &Transaction, package: &str) -> Result<()> {
    if let Some(active) = Queue::find_active_by_package(tx, package)? {
        return Err(Error::PackageBusy {
            package: package.to_string(),
            process_no: active.process_no,
        });
    }
    Ok(())
}

/// Plan the installation or update of a local archive
pub fn plan_install(conn: &mut Connection, config: &EngineConfig, archive_path: &Path) -> Result<Plan> {
    let archive = PackageArchive::open(archive_path, &config.base_package)?;
    let descriptor = archive.descriptor();

    let plan = db::transaction(conn, |tx| {
        let installed = Package::find_latest_by_name(tx, &descriptor.name)?;

        let action = match &installed {
            Some(installed) => {
                if !descriptor.is_valid_update(installed)? {
                    if Version::parse(&descriptor.version)? <= Version::parse(&installed.version)? {
                        return Err(Error::AlreadyInstalled {
                            package: descriptor.name.clone(),
                            version: installed.version.clone(),
                        });
                    }
                    return Err(Error::NoApplicableUpdatePath {
                        package: descriptor.name.clone(),
                        installed_version: installed.version.clone(),
                    });
                }
                QueueAction::Update
            }
            None => {
                if !descriptor.is_valid_install() {
                    return Err(Error::NoInstallInstructions(descriptor.name.clone()));
                }
                if descriptor.is_application {
                    return Err(Error::ApplicationNotInstallableHere(descriptor.name.clone()));
                }
                QueueAction::Install
            }
        };

        ensure_not_busy(tx, &descriptor.name)?;

        let report = Resolver::new(descriptor, &**tx).ensure_installable()?;

        let process_no = Queue::next_process_no(tx)?;
        let mut queue = Queue::new(process_no, config.user_id, descriptor.name.clone(), action);
        queue.package_name = descriptor.localized_name(&config.language).to_string();
        queue.package_id = installed.and_then(|p| p.id);
        queue.archive = Some(archive.path().to_string_lossy().into_owned());
        let queue_id = queue.insert(tx)?;

        // Extracts and checks delivered requirements before anything is committed
        NodeBuilder::new(tx, config).build_nodes(&queue)?;

        let session = SessionState::new(process_no, queue_id, Step::Prepare);
        session.save(tx)?;

        Ok(Plan {
            process_no,
            queue_id,
            action,
            package: descriptor.name.clone(),
            report: Some(report),
            session,
        })
    })
    .inspect_err(|e| warn!("Refused {} {}: {}", descriptor.name, descriptor.version, e.payload()))?;

    info!(
        "Planned {} of {} {} as process {}",
        plan.action.as_str(),
        descriptor.name,
        descriptor.version,
        plan.process_no
    );
    Ok(plan)
}

/// Plan the removal of an installed package, given by identifier or numeric id
pub fn plan_uninstall(conn: &mut Connection, config: &EngineConfig, package: &str) -> Result<Plan> {
    let plan = db::transaction(conn, |tx| {
        let installed = if version::is_valid_package_name(package) {
            Package::find_latest_by_name(tx, package)?
        } else {
            match package.parse::<i64>() {
                Ok(id) => Package::find_by_id(tx, id)?,
                Err(_) => None,
            }
        };
        let installed = installed.ok_or_else(|| Error::PackageNotFound(package.to_string()))?;
        let package_id = installed.id.ok_or_else(|| Error::PackageNotFound(package.to_string()))?;

        if installed.package == config.base_package {
            return Err(Error::CannotUninstall {
                package: installed.package.clone(),
                reason: "the base package cannot be removed".to_string(),
            });
        }

        let dependents: Vec<String> = PackageRequirement::find_dependents(tx, &installed.package)?
            .into_iter()
            .filter(|dependent| dependent.id != installed.id)
            .map(|dependent| dependent.package)
            .collect();
        if !dependents.is_empty() {
            return Err(Error::CannotUninstall {
                package: installed.package.clone(),
                reason: format!("required by {}", dependents.join(", ")),
            });
        }

        ensure_not_busy(tx, &installed.package)?;

        let process_no = Queue::next_process_no(tx)?;
        let mut queue = Queue::new(
            process_no,
            config.user_id,
            installed.package.clone(),
            QueueAction::Uninstall,
        );
        queue.package_name = installed.package_name.clone();
        queue.package_id = Some(package_id);
        let queue_id = queue.insert(tx)?;

        let builder = NodeBuilder::new(tx, config);
        builder.purge_nodes(&queue)?;
        builder.build_nodes(&queue)?;

        let mut session = SessionState::new(process_no, queue_id, Step::Uninstall);
        session.node = builder.get_next_node(process_no, None)?;
        session.save(tx)?;

        Ok(Plan {
            process_no,
            queue_id,
            action: QueueAction::Uninstall,
            package: installed.package,
            report: None,
            session,
        })
    })
    .inspect_err(|e| warn!("Refused uninstall of {}: {}", package, e.payload()))?;

    info!("Planned uninstall of {} as process {}", plan.package, plan.process_no);
    Ok(plan)
}

/// Drop an unfinished process: its nodes, unfinished queues and session
///
/// Nodes that already ran are not reverted; packages they registered stay
/// installed. Extracted sub-archives of the process are removed.
pub fn discard_process(conn: &mut Connection, config: &EngineConfig, process_no: i64) -> Result<()> {
    let archives = db::transaction(conn, |tx| {
        let session =
            SessionState::find(tx, process_no)?.ok_or(Error::SessionNotFound(process_no))?;
        if session.step == Step::Done {
            return Err(Error::QueueAlreadyDone(session.queue_id));
        }

        let builder = NodeBuilder::new(tx, config);
        let mut archives = builder.child_archives(process_no)?;
        archives.extend(
            Queue::find_by_process(tx, process_no)?
                .into_iter()
                .filter(|queue| queue.parent_queue_id == 0 && !queue.done)
                .filter_map(|queue| queue.archive.map(PathBuf::from)),
        );

        let dropped_nodes = Node::delete_by_process(tx, process_no)?;
        let dropped_queues = Queue::delete_pending_by_process(tx, process_no)?;
        SessionState::delete(tx, process_no)?;

        info!(
            "Discarded process {} ({} node(s), {} queue(s))",
            process_no, dropped_nodes, dropped_queues
        );
        Ok(archives)
    })
    .inspect_err(|e| warn!("Refused to discard process {}: {}", process_no, e.payload()))?;

    nodes::remove_extracted(&config.work_dir, &archives);
    Ok(())
}
