// src/install/files.rs

//! The `file` instruction handler
//!
//! The instruction value names a tar entry of the package archive. Its
//! contents are unpacked below the install root (or below the directory given
//! by a `dir` attribute, relative to the root) and every placed file is
//! recorded for the package so uninstall can remove it again.

use crate::archive::{self, Instruction};
use crate::db::models::PackageFile;
use crate::error::{Error, Result};
use crate::install::handler::{InstructionContext, InstructionHandler, InstructionOutcome};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

pub struct FilesHandler;

impl FilesHandler {
    pub const PIP: &'static str = "file";

    fn target_dir(ctx: &InstructionContext, instruction: &Instruction) -> Result<(PathBuf, PathBuf)> {
        let relative = match instruction.attributes.get("dir") {
            Some(dir) => sanitize(Path::new(dir)).ok_or_else(|| {
                Error::InitError(format!("invalid target directory '{}'", dir))
            })?,
            None => PathBuf::new(),
        };
        Ok((ctx.install_root.join(&relative), relative))
    }
}

/// Relative path without `..`, root or prefix components
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(clean)
}

impl InstructionHandler for FilesHandler {
    fn install(&self, ctx: &InstructionContext, instruction: &Instruction) -> Result<InstructionOutcome> {
        let archive = ctx
            .archive
            .ok_or_else(|| Error::ArchiveNotFound(ctx.queue.package.clone()))?;
        let package_id = ctx
            .package_id
            .ok_or_else(|| Error::PackageNotFound(ctx.queue.package.clone()))?;

        let (target, relative) = Self::target_dir(ctx, instruction)?;
        fs::create_dir_all(&target)?;

        let extracted = archive.extract_entry_to(&instruction.value, ctx.work_dir, ctx.deadline)?;
        let result = (|| -> Result<usize> {
            let mut tar = archive::open_tar(&extracted)?;
            let mut placed = 0;
            for entry in tar.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.into_owned();
                let Some(clean) = sanitize(&path) else {
                    warn!("Skipping unsafe entry {}", path.display());
                    continue;
                };
                if clean.as_os_str().is_empty() {
                    continue;
                }

                let is_file = entry.header().entry_type().is_file();
                if !entry.unpack_in(&target)? {
                    warn!("Skipping unsafe entry {}", path.display());
                    continue;
                }

                if is_file {
                    let recorded = relative.join(&clean);
                    PackageFile::record(ctx.conn, package_id, &recorded.to_string_lossy())?;
                    placed += 1;
                }
            }
            Ok(placed)
        })();
        let _ = fs::remove_file(&extracted);

        let placed = result?;
        info!(
            "Placed {} file(s) from {} for {}",
            placed, instruction.value, ctx.queue.package
        );
        Ok(InstructionOutcome::Completed)
    }

    fn uninstall(&self, ctx: &InstructionContext) -> Result<()> {
        let Some(package_id) = ctx.package_id else {
            return Ok(());
        };

        for path in PackageFile::find_by_package(ctx.conn, package_id)? {
            let full = ctx.install_root.join(&path);
            match fs::remove_file(&full) {
                Ok(()) => debug!("Removed {}", full.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("File already gone: {}", full.display());
                }
                Err(e) => return Err(e.into()),
            }
        }

        PackageFile::delete_by_package(ctx.conn, package_id)?;
        Ok(())
    }
}
