// src/install/orchestrator.rs

//! The installation state machine
//!
//! Installs and updates run `prepare -> install -> done`; removals run
//! `uninstall -> done`. Each call to [`Orchestrator::step`] performs one
//! transition inside an IMMEDIATE transaction and persists the resulting
//! `(process_no, queue_id, node, step)` tuple in the same transaction, so a
//! process can be resumed from that tuple alone after a crash or when the
//! CLI is invoked again.

use crate::archive::PackageArchive;
use crate::cache::DerivedCache;
use crate::config::EngineConfig;
use crate::db::{
    self,
    models::{Queue, QueueAction, SessionState, Step},
};
use crate::error::{Error, Result};
use crate::install::executor::NodeExecutor;
use crate::install::handler::{HandlerRegistry, InteractiveDocument};
use crate::install::nodes::{self, NodeBuilder};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

pub const INSTALL_SUCCESS_LABEL: &str = "Installation completed";
pub const UNINSTALL_SUCCESS_LABEL: &str = "Uninstallation completed";

/// Progress after a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// 0 to 100; 100 only once the process has finished
    pub percentage: u8,
    pub label: String,
}

/// Receives progress after every transition
pub trait ProgressSink {
    fn update(&mut self, progress: &Progress);
}

impl<F: FnMut(&Progress)> ProgressSink for F {
    fn update(&mut self, progress: &Progress) {
        self(progress)
    }
}

/// Discards progress updates
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _progress: &Progress) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// More steps follow
    Continue(Progress),
    /// The current node needs user input; call again with [`Orchestrator::with_input`]
    AwaitingInput {
        progress: Progress,
        document: InteractiveDocument,
    },
    /// The process has finished
    Completed(Progress),
}

impl StepResult {
    pub fn progress(&self) -> &Progress {
        match self {
            StepResult::Continue(progress) | StepResult::Completed(progress) => progress,
            StepResult::AwaitingInput { progress, .. } => progress,
        }
    }
}

pub struct Orchestrator<'a> {
    conn: &'a mut Connection,
    config: &'a EngineConfig,
    handlers: &'a HandlerRegistry,
    cache: &'a dyn DerivedCache,
    state: SessionState,
    input: Option<Value>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        conn: &'a mut Connection,
        config: &'a EngineConfig,
        handlers: &'a HandlerRegistry,
        cache: &'a dyn DerivedCache,
        state: SessionState,
    ) -> Self {
        Self {
            conn,
            config,
            handlers,
            cache,
            state,
            input: None,
        }
    }

    /// Rebuild the machine of a process from its persisted session
    pub fn resume(
        conn: &'a mut Connection,
        config: &'a EngineConfig,
        handlers: &'a HandlerRegistry,
        cache: &'a dyn DerivedCache,
        process_no: i64,
    ) -> Result<Self> {
        let state = SessionState::find(conn, process_no)?.ok_or(Error::SessionNotFound(process_no))?;
        debug!(
            "Resuming process {} at step {} (queue {}, node '{}')",
            process_no,
            state.step.as_str(),
            state.queue_id,
            state.node
        );
        Ok(Self::new(conn, config, handlers, cache, state))
    }

    /// Input for a node that returned an interactive document
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Perform one transition
    pub fn step(&mut self) -> Result<StepResult> {
        match self.state.step {
            Step::Prepare => self.prepare(),
            Step::Install | Step::Uninstall => self.advance(),
            Step::Done => self.finalize(),
        }
    }

    /// Step until the process completes or waits for input
    pub fn run(&mut self, sink: &mut dyn ProgressSink) -> Result<StepResult> {
        loop {
            let result = self.step()?;
            sink.update(result.progress());
            match result {
                StepResult::Continue(_) => continue,
                other => return Ok(other),
            }
        }
    }

    fn prepare(&mut self) -> Result<StepResult> {
        let config = self.config;
        let mut state = self.state.clone();

        let (label, stale) = db::transaction(self.conn, |tx| {
            let queue = load_open_queue(tx, state.queue_id)?;

            // Refresh the stored label from the archive
            if let Some(path) = &queue.archive {
                let archive = PackageArchive::open(path, &config.base_package)?;
                let name = archive.descriptor().localized_name(&config.language);
                if !name.is_empty() && name != queue.package_name {
                    Queue::set_package_name(tx, queue.queue_id()?, name)?;
                }
            }

            let builder = NodeBuilder::new(tx, config);
            let stale = builder.purge_nodes(&queue)?;
            builder.build_nodes(&queue)?;

            state.node = builder.get_next_node(state.process_no, None)?;
            state.queue_id = builder
                .get_queue_by_node(state.process_no, &state.node)?
                .unwrap_or(state.queue_id);
            state.step = match queue.action {
                QueueAction::Uninstall => Step::Uninstall,
                _ => Step::Install,
            };
            state.save(tx)?;

            Ok((builder.get_package_name_by_queue(state.queue_id)?, stale))
        })?;
        nodes::remove_extracted(&config.work_dir, &stale);

        info!("Prepared process {}", state.process_no);
        self.state = state;
        Ok(StepResult::Continue(Progress {
            percentage: 0,
            label,
        }))
    }

    fn advance(&mut self) -> Result<StepResult> {
        if self.state.node.is_empty() {
            return self.finish();
        }

        let config = self.config;
        let handlers = self.handlers;
        let input = self.input.clone();
        let mut state = self.state.clone();

        let outcome = db::transaction(self.conn, |tx| {
            let executor = NodeExecutor::new(tx, config, handlers);
            let builder = NodeBuilder::new(tx, config);
            let executed = state.node.clone();

            let node_step = executor.execute(state.process_no, &executed, input.as_ref())?;

            if let Some(document) = node_step.document {
                let progress = Progress {
                    percentage: builder.calculate_progress(state.process_no, &executed)?,
                    label: builder.get_package_name_by_queue(state.queue_id)?,
                };
                return Ok(StepResult::AwaitingInput { progress, document });
            }

            let percentage = builder.calculate_progress(state.process_no, &executed)?;
            state.node = node_step.next_node;
            if let Some(queue_id) = builder.get_queue_by_node(state.process_no, &state.node)? {
                state.queue_id = queue_id;
            }
            state.save(tx)?;

            let label = builder.get_package_name_by_queue(state.queue_id)?;
            Ok(StepResult::Continue(Progress { percentage, label }))
        })?;

        if matches!(outcome, StepResult::AwaitingInput { .. }) {
            return Ok(outcome);
        }

        self.input = None;
        self.state = state;
        if self.state.node.is_empty() {
            return self.finish();
        }
        Ok(outcome)
    }

    /// Past the last node: purge node state, drop extracted sub-archives and
    /// mark the session done
    fn finish(&mut self) -> Result<StepResult> {
        let config = self.config;
        let mut state = self.state.clone();

        let extracted = db::transaction(self.conn, |tx| {
            let builder = NodeBuilder::new(tx, config);
            let mut extracted = builder.child_archives(state.process_no)?;
            if let Some(queue) = Queue::find_by_id(tx, state.queue_id)? {
                extracted.extend(builder.purge_nodes(&queue)?);
            }
            state.step = Step::Done;
            state.save(tx)?;
            Ok(extracted)
        })?;
        nodes::remove_extracted(&config.work_dir, &extracted);

        self.state = state;
        self.finalize()
    }

    /// Invalidate derived caches and report success; safe to repeat
    fn finalize(&mut self) -> Result<StepResult> {
        self.cache.flush_all()?;

        let label = match root_action(self.conn, self.state.process_no)? {
            Some(QueueAction::Uninstall) => UNINSTALL_SUCCESS_LABEL,
            _ => INSTALL_SUCCESS_LABEL,
        };

        info!("Process {} completed", self.state.process_no);
        Ok(StepResult::Completed(Progress {
            percentage: 100,
            label: label.to_string(),
        }))
    }
}

fn load_open_queue(tx: &Transaction, queue_id: i64) -> Result<Queue> {
    let queue = Queue::find_by_id(tx, queue_id)?.ok_or(Error::QueueNotFound(queue_id))?;
    if queue.done {
        return Err(Error::QueueAlreadyDone(queue_id));
    }
    Ok(queue)
}

fn root_action(conn: &Connection, process_no: i64) -> Result<Option<QueueAction>> {
    Ok(Queue::find_by_process(conn, process_no)?
        .into_iter()
        .find(|queue| queue.parent_queue_id == 0)
        .map(|queue| queue.action))
}
