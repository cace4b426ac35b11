// src/install/handler.rs

//! Instruction handler interface and registry
//!
//! Every instruction carries a `pip` tag naming the handler that performs it.
//! Handlers are registered up front; an instruction whose tag has no handler
//! fails at execution time.

use crate::archive::{Instruction, PackageArchive};
use crate::db::models::Queue;
use crate::error::Result;
use crate::install::files::FilesHandler;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// Everything a handler may touch while executing one node
pub struct InstructionContext<'a> {
    /// Connection inside the node's transaction
    pub conn: &'a Connection,
    pub queue: &'a Queue,
    /// Id of the package record the queue works on
    pub package_id: Option<i64>,
    /// Archive of the queue (install and update only)
    pub archive: Option<&'a PackageArchive>,
    pub install_root: &'a Path,
    pub work_dir: &'a Path,
    /// Extraction of nested archives gives up after this point
    pub deadline: Option<Instant>,
    pub node: &'a str,
    /// User input answering a document returned earlier for this node
    pub input: Option<&'a Value>,
}

/// A document the caller must render before the node can complete
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractiveDocument {
    pub template: String,
    pub variables: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionOutcome {
    Completed,
    /// Stay on the current node until input is supplied
    AwaitingInput(InteractiveDocument),
}

pub trait InstructionHandler {
    /// Perform an install or update instruction
    fn install(&self, ctx: &InstructionContext, instruction: &Instruction)
    -> Result<InstructionOutcome>;

    /// Revert whatever this handler did for the queue's package
    fn uninstall(&self, ctx: &InstructionContext) -> Result<()>;
}

/// Maps `pip` tags to handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn InstructionHandler>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(FilesHandler::PIP, FilesHandler);
        registry
    }

    /// Register `handler` for `pip`, replacing any previous one
    pub fn register(&mut self, pip: impl Into<String>, handler: impl InstructionHandler + 'static) {
        self.handlers.insert(pip.into(), Box::new(handler));
    }

    pub fn get(&self, pip: &str) -> Option<&dyn InstructionHandler> {
        self.handlers.get(pip).map(|handler| handler.as_ref())
    }

    pub fn contains(&self, pip: &str) -> bool {
        self.handlers.contains_key(pip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl InstructionHandler for Noop {
        fn install(&self, _ctx: &InstructionContext, _instruction: &Instruction) -> Result<InstructionOutcome> {
            Ok(InstructionOutcome::Completed)
        }

        fn uninstall(&self, _ctx: &InstructionContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::with_defaults();
        assert!(registry.contains("file"));
        assert!(registry.get("sql").is_none());

        registry.register("sql", Noop);
        assert!(registry.get("sql").is_some());
    }
}
