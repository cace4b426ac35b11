// src/install/mod.rs

//! Installation processes
//!
//! - `planner`: validates a request and creates its root queue and session, or
//!   discards an unfinished process
//! - `nodes`: flattens queues into a resumable node sequence
//! - `executor`: runs one node through its instruction handler
//! - `orchestrator`: the stepped state machine driving a process to completion
//! - `handler`, `files`: the instruction handler boundary and the built-in `file` handler

pub mod executor;
pub mod files;
pub mod handler;
pub mod nodes;
pub mod orchestrator;
pub mod planner;

pub use executor::{NodeExecutor, NodeStep};
pub use files::FilesHandler;
pub use handler::{
    HandlerRegistry, InstructionContext, InstructionHandler, InstructionOutcome,
    InteractiveDocument,
};
pub use nodes::{NodeBuilder, NodeData};
pub use orchestrator::{NoProgress, Orchestrator, Progress, ProgressSink, StepResult};
pub use planner::{Plan, discard_process, plan_install, plan_uninstall};
