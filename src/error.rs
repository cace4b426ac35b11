// src/error.rs

use crate::resolver::{ConflictingPackage, ResolutionReport};
use serde_json::{Value, json};
use thiserror::Error;

/// Core error types for Packforge
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),

    /// Remote archive could not be fetched
    #[error("Download failed: {0}")]
    DownloadError(String),

    /// A caller-supplied deadline passed before the operation finished
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Package archive does not exist
    #[error("Unable to find package archive '{0}'")]
    ArchiveNotFound(String),

    /// The archive has no manifest entry
    #[error("Package manifest '{entry}' not found in '{archive}'")]
    ManifestMissing { archive: String, entry: String },

    /// A named entry is missing from the archive
    #[error("Entry '{entry}' not found in '{archive}'")]
    EntryNotFound { archive: String, entry: String },

    /// The manifest is not a well-formed tree or lacks a required node
    #[error("Malformed package manifest: {0}")]
    MalformedManifest(String),

    /// Identifier does not match the package name grammar
    #[error("'{0}' is not a valid package name")]
    InvalidPackageName(String),

    /// Manifest version does not match the version grammar
    #[error("Package version '{0}' is invalid")]
    InvalidVersion(String),

    /// A version segment could not be tokenized
    #[error("Cannot compare version '{0}': unrecognized segment")]
    InvalidVersionFormat(String),

    #[error("Package '{package}' provides no update instructions for installed version {installed_version}")]
    NoApplicableUpdatePath {
        package: String,
        installed_version: String,
    },

    #[error("Package '{0}' provides no installation instructions")]
    NoInstallInstructions(String),

    /// Requirements that cannot be satisfied locally
    #[error("Package '{}' has {} missing requirement(s)", .0.package, .0.missing_packages)]
    UnsatisfiedRequirements(Box<ResolutionReport>),

    /// Installed packages conflict with the archive
    #[error(
        "Package '{package}' conflicts with {} excluding and {} excluded package(s)",
        .excluding.len(),
        .excluded.len()
    )]
    ExclusionConflict {
        package: String,
        excluding: Vec<ConflictingPackage>,
        excluded: Vec<ConflictingPackage>,
    },

    #[error("Package '{package}' is already installed in version {version}")]
    AlreadyInstalled { package: String, version: String },

    #[error("Package '{0}' is an application and cannot be installed here")]
    ApplicationNotInstallableHere(String),

    /// An instruction handler failed; the node stays pending so it can be retried
    #[error("Instruction '{pip}' failed at node {node} (process {process_no}, queue {queue_id}): {message}")]
    InstructionHandlerFailure {
        process_no: i64,
        queue_id: i64,
        node: String,
        pip: String,
        message: String,
    },

    #[error("Package '{0}' is not installed")]
    PackageNotFound(String),

    /// Another unfinished process already works on this package
    #[error("Package '{package}' is being processed by process {process_no}")]
    PackageBusy { package: String, process_no: i64 },

    #[error("Package '{package}' cannot be uninstalled: {reason}")]
    CannotUninstall { package: String, reason: String },

    #[error("Installation queue {0} not found")]
    QueueNotFound(i64),

    #[error("Installation queue {0} has already been completed")]
    QueueAlreadyDone(i64),

    #[error("Node '{node}' not found in process {process_no}")]
    NodeNotFound { process_no: i64, node: String },

    #[error("No installation session for process {0}")]
    SessionNotFound(i64),
}

impl Error {
    /// Stable identifier for outer layers to pick a localized message
    pub fn code(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::InitError(_) => "init",
            Error::DatabaseNotFound(_) => "databaseNotFound",
            Error::DownloadError(_) => "download",
            Error::Timeout(_) => "timeout",
            Error::ArchiveNotFound(_) => "notFound",
            Error::ManifestMissing { .. } => "manifestMissing",
            Error::EntryNotFound { .. } => "entryNotFound",
            Error::MalformedManifest(_) => "malformedManifest",
            Error::InvalidPackageName(_) => "invalidPackageName",
            Error::InvalidVersion(_) => "invalidVersion",
            Error::InvalidVersionFormat(_) => "invalidVersionFormat",
            Error::NoApplicableUpdatePath { .. } => "noValidUpdate",
            Error::NoInstallInstructions(_) => "noValidInstall",
            Error::UnsatisfiedRequirements(_) => "missingPackages",
            Error::ExclusionConflict { .. } => "exclusionConflict",
            Error::AlreadyInstalled { .. } => "uniqueAlreadyInstalled",
            Error::ApplicationNotInstallableHere(_) => "installIsApplication",
            Error::InstructionHandlerFailure { .. } => "instructionFailed",
            Error::PackageNotFound(_) => "packageNotFound",
            Error::PackageBusy { .. } => "packageBusy",
            Error::CannotUninstall { .. } => "invalidUninstallation",
            Error::QueueNotFound(_) => "queueNotFound",
            Error::QueueAlreadyDone(_) => "queueDone",
            Error::NodeNotFound { .. } => "nodeNotFound",
            Error::SessionNotFound(_) => "sessionNotFound",
        }
    }

    /// Machine-readable failure payload: `{ "error": code, "parameters": {...} }`
    pub fn payload(&self) -> Value {
        let parameters = match self {
            Error::ManifestMissing { archive, entry } | Error::EntryNotFound { archive, entry } => {
                json!({ "archive": archive, "entry": entry })
            }
            Error::ArchiveNotFound(file) => json!({ "file": file }),
            Error::InvalidPackageName(name) => json!({ "name": name }),
            Error::InvalidVersion(version) | Error::InvalidVersionFormat(version) => {
                json!({ "version": version })
            }
            Error::NoApplicableUpdatePath {
                package,
                installed_version,
            } => json!({ "package": package, "installedVersion": installed_version }),
            Error::NoInstallInstructions(package)
            | Error::ApplicationNotInstallableHere(package)
            | Error::PackageNotFound(package) => json!({ "package": package }),
            Error::UnsatisfiedRequirements(report) => {
                serde_json::to_value(report.as_ref()).unwrap_or(Value::Null)
            }
            Error::ExclusionConflict {
                package,
                excluding,
                excluded,
            } => json!({
                "package": package,
                "excludingPackages": excluding,
                "excludedPackages": excluded,
            }),
            Error::AlreadyInstalled { package, version } => {
                json!({ "package": package, "version": version })
            }
            Error::InstructionHandlerFailure {
                process_no,
                queue_id,
                node,
                pip,
                message,
            } => json!({
                "processNo": process_no,
                "queueID": queue_id,
                "node": node,
                "pip": pip,
                "message": message,
            }),
            Error::PackageBusy {
                package,
                process_no,
            } => json!({ "package": package, "processNo": process_no }),
            Error::CannotUninstall { package, reason } => {
                json!({ "package": package, "reason": reason })
            }
            Error::QueueNotFound(queue_id) | Error::QueueAlreadyDone(queue_id) => {
                json!({ "queueID": queue_id })
            }
            Error::NodeNotFound { process_no, node } => {
                json!({ "processNo": process_no, "node": node })
            }
            Error::SessionNotFound(process_no) => json!({ "processNo": process_no }),
            other => json!({ "message": other.to_string() }),
        };

        json!({ "error": self.code(), "parameters": parameters })
    }
}

/// Result type alias using Packforge's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_handler_context() {
        let err = Error::InstructionHandlerFailure {
            process_no: 3,
            queue_id: 7,
            node: "abc".to_string(),
            pip: "file".to_string(),
            message: "disk full".to_string(),
        };

        let payload = err.payload();
        assert_eq!(payload["error"], "instructionFailed");
        assert_eq!(payload["parameters"]["processNo"], 3);
        assert_eq!(payload["parameters"]["queueID"], 7);
        assert_eq!(payload["parameters"]["node"], "abc");
    }

    #[test]
    fn test_payload_for_plain_errors() {
        let err = Error::InvalidPackageName("bad name".to_string());
        let payload = err.payload();
        assert_eq!(payload["error"], "invalidPackageName");
        assert_eq!(payload["parameters"]["name"], "bad name");
    }
}
