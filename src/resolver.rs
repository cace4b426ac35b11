// src/resolver.rs

//! Requirement and conflict resolution against the installed package set
//!
//! Given a parsed manifest, the resolver works out which requirements are
//! already satisfied, which must be installed or updated first, and which
//! installed packages conflict with the archive through exclusion
//! declarations (in either direction).

use crate::archive::PackageDescriptor;
use crate::db::models::{Package, PackageExclusion, QueueAction};
use crate::error::{Error, Result};
use crate::version::{self, Version};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Read access to installed packages
pub trait PackageLookup {
    /// Every installed record of a package identifier
    fn installed_versions(&self, package: &str) -> Result<Vec<Package>>;

    /// Installed packages that declare `package` as excluded, with the declaration
    fn excluding_packages(&self, package: &str) -> Result<Vec<(Package, PackageExclusion)>>;

    /// Installed applications sharing an abbreviation
    fn applications_with_abbreviation(&self, abbreviation: &str) -> Result<i64>;
}

impl PackageLookup for Connection {
    fn installed_versions(&self, package: &str) -> Result<Vec<Package>> {
        Package::find_by_name(self, package)
    }

    fn excluding_packages(&self, package: &str) -> Result<Vec<(Package, PackageExclusion)>> {
        PackageExclusion::find_excluding(self, package)
    }

    fn applications_with_abbreviation(&self, abbreviation: &str) -> Result<i64> {
        Package::count_applications_with_abbreviation(self, abbreviation)
    }
}

/// A requirement that must be installed or updated before the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequirement {
    pub name: String,
    pub min_version: Option<String>,
    /// Bundled sub-archive that satisfies the requirement
    pub file: Option<String>,
    pub action: QueueAction,
    pub existing_version: Option<String>,
    #[serde(rename = "packageID")]
    pub package_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RequirementStatus {
    Installed,
    /// Not installed and not bundled
    Missing,
    /// Installed below `minversion` and not bundled
    MissingVersion,
    /// Open, but a bundled sub-archive satisfies it
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementReport {
    pub name: String,
    pub min_version: Option<String>,
    pub file: Option<String>,
    pub status: RequirementStatus,
    pub action: Option<QueueAction>,
    pub existing_version: Option<String>,
}

/// An installed package taking part in an exclusion conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictingPackage {
    #[serde(rename = "packageID")]
    pub package_id: i64,
    pub package: String,
    pub package_name: String,
    pub version: String,
    pub excluded_version: Option<String>,
}

impl ConflictingPackage {
    fn new(package: &Package, excluded_version: Option<String>) -> Self {
        Self {
            package_id: package.id.unwrap_or_default(),
            package: package.package.clone(),
            package_name: package.package_name.clone(),
            version: package.version.clone(),
            excluded_version,
        }
    }
}

/// Outcome of resolving an archive against the installed packages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub package: String,
    pub requirements: Vec<RequirementReport>,
    /// Requirements that block installation
    pub missing_packages: usize,
    pub excluding_packages: Vec<ConflictingPackage>,
    pub excluded_packages: Vec<ConflictingPackage>,
}

impl ResolutionReport {
    /// Nothing prevents installation
    pub fn is_clear(&self) -> bool {
        self.missing_packages == 0
            && self.excluding_packages.is_empty()
            && self.excluded_packages.is_empty()
    }
}

pub struct Resolver<'a, L: PackageLookup + ?Sized> {
    descriptor: &'a PackageDescriptor,
    lookup: &'a L,
}

impl<'a, L: PackageLookup + ?Sized> Resolver<'a, L> {
    pub fn new(descriptor: &'a PackageDescriptor, lookup: &'a L) -> Self {
        Self { descriptor, lookup }
    }

    /// Highest installed record of `package`
    fn latest_installed(&self, package: &str) -> Result<Option<Package>> {
        Package::latest(self.lookup.installed_versions(package)?)
    }

    /// Whether any version of the archive's package is installed
    pub fn is_already_installed(&self) -> Result<bool> {
        Ok(!self
            .lookup
            .installed_versions(&self.descriptor.name)?
            .is_empty())
    }

    /// Whether no other installed application uses the archive's abbreviation
    ///
    /// Always true for non-applications.
    pub fn has_unique_abbreviation(&self) -> Result<bool> {
        if !self.descriptor.is_application {
            return Ok(true);
        }

        let abbreviation = version::abbreviation(&self.descriptor.name);
        Ok(self.lookup.applications_with_abbreviation(abbreviation)? == 0)
    }

    /// Highest installed record for each declared requirement, ignoring `minversion`
    pub fn existing_requirements(&self) -> Result<BTreeMap<String, Package>> {
        let mut existing = BTreeMap::new();
        for requirement in &self.descriptor.requirements {
            if let Some(package) = self.latest_installed(&requirement.name)? {
                existing.insert(requirement.name.clone(), package);
            }
        }
        Ok(existing)
    }

    /// Requirements that are not installed, or installed below their `minversion`
    pub fn open_requirements(&self) -> Result<BTreeMap<String, OpenRequirement>> {
        let existing = self.existing_requirements()?;

        let mut open = BTreeMap::new();
        for requirement in &self.descriptor.requirements {
            let entry = match existing.get(&requirement.name) {
                Some(installed) => {
                    let Some(min_version) = &requirement.min_version else {
                        continue;
                    };
                    if Version::parse(&installed.version)? >= Version::parse(min_version)? {
                        continue;
                    }

                    OpenRequirement {
                        name: requirement.name.clone(),
                        min_version: requirement.min_version.clone(),
                        file: requirement.file.clone(),
                        action: QueueAction::Update,
                        existing_version: Some(installed.version.clone()),
                        package_id: installed.id,
                    }
                }
                None => OpenRequirement {
                    name: requirement.name.clone(),
                    min_version: requirement.min_version.clone(),
                    file: requirement.file.clone(),
                    action: QueueAction::Install,
                    existing_version: None,
                    package_id: None,
                },
            };

            open.insert(requirement.name.clone(), entry);
        }

        Ok(open)
    }

    /// Installed packages that exclude the archive
    ///
    /// A declared bound lifts the exclusion for archive versions below it.
    pub fn conflicted_excluding_packages(&self) -> Result<Vec<ConflictingPackage>> {
        let archive_version = Version::parse(&self.descriptor.version)?;

        let mut conflicts: BTreeMap<i64, ConflictingPackage> = BTreeMap::new();
        for (package, exclusion) in self.lookup.excluding_packages(&self.descriptor.name)? {
            let bound = exclusion.excluded_version.filter(|v| !v.is_empty());
            if let Some(bound) = &bound {
                if archive_version < Version::parse(bound)? {
                    continue;
                }
            }

            conflicts.insert(
                package.id.unwrap_or_default(),
                ConflictingPackage::new(&package, bound),
            );
        }

        Ok(conflicts.into_values().collect())
    }

    /// Installed packages the archive excludes
    ///
    /// A declared version makes the conflict fire only for installed versions
    /// at or above it.
    pub fn conflicted_excluded_packages(&self) -> Result<Vec<ConflictingPackage>> {
        // Later declarations of the same package replace earlier ones
        let mut declared: BTreeMap<&str, Option<&str>> = BTreeMap::new();
        for exclusion in &self.descriptor.exclusions {
            declared.insert(
                exclusion.name.as_str(),
                exclusion.version.as_deref().filter(|v| !v.is_empty()),
            );
        }

        let mut conflicts: BTreeMap<i64, ConflictingPackage> = BTreeMap::new();
        for (name, bound) in declared {
            for package in self.lookup.installed_versions(name)? {
                if let Some(bound) = bound {
                    if Version::parse(&package.version)? < Version::parse(bound)? {
                        continue;
                    }
                }

                conflicts.insert(
                    package.id.unwrap_or_default(),
                    ConflictingPackage::new(&package, bound.map(str::to_string)),
                );
            }
        }

        Ok(conflicts.into_values().collect())
    }

    /// Status of every requirement plus both conflict lists
    pub fn report(&self) -> Result<ResolutionReport> {
        let open = self.open_requirements()?;

        let mut missing_packages = 0;
        let mut requirements = Vec::with_capacity(self.descriptor.requirements.len());
        for requirement in &self.descriptor.requirements {
            let report = match open.get(&requirement.name) {
                None => RequirementReport {
                    name: requirement.name.clone(),
                    min_version: requirement.min_version.clone(),
                    file: requirement.file.clone(),
                    status: RequirementStatus::Installed,
                    action: None,
                    existing_version: None,
                },
                Some(entry) => {
                    let status = match (&entry.file, entry.action) {
                        (Some(_), _) => RequirementStatus::Delivered,
                        (None, QueueAction::Update) => RequirementStatus::MissingVersion,
                        (None, _) => RequirementStatus::Missing,
                    };
                    if entry.file.is_none() {
                        missing_packages += 1;
                    }

                    RequirementReport {
                        name: requirement.name.clone(),
                        min_version: requirement.min_version.clone(),
                        file: requirement.file.clone(),
                        status,
                        action: Some(entry.action),
                        existing_version: entry.existing_version.clone(),
                    }
                }
            };
            requirements.push(report);
        }

        Ok(ResolutionReport {
            package: self.descriptor.name.clone(),
            requirements,
            missing_packages,
            excluding_packages: self.conflicted_excluding_packages()?,
            excluded_packages: self.conflicted_excluded_packages()?,
        })
    }

    /// Resolve and refuse when requirements are missing or packages conflict
    pub fn ensure_installable(&self) -> Result<ResolutionReport> {
        let report = self.report()?;
        debug!(
            "Resolved {}: {} missing, {} excluding, {} excluded",
            report.package,
            report.missing_packages,
            report.excluding_packages.len(),
            report.excluded_packages.len()
        );

        if report.missing_packages > 0 {
            return Err(Error::UnsatisfiedRequirements(Box::new(report)));
        }

        if !report.excluding_packages.is_empty() || !report.excluded_packages.is_empty() {
            return Err(Error::ExclusionConflict {
                package: report.package,
                excluding: report.excluding_packages,
                excluded: report.excluded_packages,
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use tempfile::NamedTempFile;

    const BASE: &str = "com.packforge.core";

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn install(conn: &Connection, name: &str, version: &str) -> i64 {
        Package::new(name.to_string(), name.to_string(), version.to_string())
            .insert(conn)
            .unwrap()
    }

    fn descriptor(version: &str, body: &str) -> PackageDescriptor {
        let xml = format!(
            r#"<package name="com.example.plugin">
                <packageinformation><version>{}</version></packageinformation>
                {}
                <instructions type="install"><instruction type="file">files.tar</instruction></instructions>
            </package>"#,
            version, body
        );
        PackageDescriptor::parse(&xml, BASE).unwrap()
    }

    #[test]
    fn test_clean_store_marks_every_requirement_install() {
        let (_temp, conn) = create_test_db();
        let descriptor = descriptor(
            "1.0.0",
            r#"<requiredpackages>
                <requiredpackage>com.example.lib</requiredpackage>
                <requiredpackage minversion="2.0.0">com.example.util</requiredpackage>
            </requiredpackages>"#,
        );

        let resolver = Resolver::new(&descriptor, &conn);
        let open = resolver.open_requirements().unwrap();
        assert_eq!(open.len(), 3);
        assert!(open.values().all(|r| r.action == QueueAction::Install));
        assert!(open.contains_key(BASE));
        assert!(!resolver.is_already_installed().unwrap());
    }

    #[test]
    fn test_min_version_update_and_satisfied() {
        let (_temp, conn) = create_test_db();
        install(&conn, BASE, "1.0.0");
        let lib = install(&conn, "com.example.lib", "1.5");

        let descriptor = descriptor(
            "1.0.0",
            r#"<requiredpackages><requiredpackage minversion="2.0">com.example.lib</requiredpackage></requiredpackages>"#,
        );
        let resolver = Resolver::new(&descriptor, &conn);

        let open = resolver.open_requirements().unwrap();
        assert_eq!(open.len(), 1);
        let entry = &open["com.example.lib"];
        assert_eq!(entry.action, QueueAction::Update);
        assert_eq!(entry.existing_version.as_deref(), Some("1.5"));
        assert_eq!(entry.package_id, Some(lib));

        let report = resolver.report().unwrap();
        assert_eq!(report.missing_packages, 1);
        assert_eq!(report.requirements[0].status, RequirementStatus::MissingVersion);

        // A second, newer install satisfies the requirement
        install(&conn, "com.example.lib", "2.1");
        let open = resolver.open_requirements().unwrap();
        assert!(open.is_empty());
        assert_eq!(
            resolver.existing_requirements().unwrap()["com.example.lib"].version,
            "2.1"
        );
    }

    #[test]
    fn test_delivered_requirement_does_not_block() {
        let (_temp, conn) = create_test_db();
        install(&conn, BASE, "1.0.0");

        let descriptor = descriptor(
            "1.0.0",
            r#"<requiredpackages><requiredpackage file="requirements/lib.tar">com.example.lib</requiredpackage></requiredpackages>"#,
        );
        let resolver = Resolver::new(&descriptor, &conn);

        let report = resolver.ensure_installable().unwrap();
        assert_eq!(report.missing_packages, 0);
        assert_eq!(report.requirements[0].status, RequirementStatus::Delivered);
        assert_eq!(report.requirements[1].status, RequirementStatus::Installed);
    }

    #[test]
    fn test_missing_requirement_is_refused_with_report() {
        let (_temp, conn) = create_test_db();
        let descriptor = descriptor("1.0.0", "");

        let err = Resolver::new(&descriptor, &conn).ensure_installable().unwrap_err();
        match err {
            Error::UnsatisfiedRequirements(report) => {
                assert_eq!(report.missing_packages, 1);
                assert_eq!(report.requirements[0].name, BASE);
                assert_eq!(report.requirements[0].status, RequirementStatus::Missing);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_excluded_package_bound() {
        let (_temp, conn) = create_test_db();
        install(&conn, BASE, "1.0.0");
        let legacy = install(&conn, "com.example.legacy", "2.9");

        let descriptor = descriptor(
            "1.0.0",
            r#"<excludedpackages><excludedpackage version="3.0">com.example.legacy</excludedpackage></excludedpackages>"#,
        );
        let resolver = Resolver::new(&descriptor, &conn);
        assert!(resolver.conflicted_excluded_packages().unwrap().is_empty());

        Package::delete(&conn, legacy).unwrap();
        install(&conn, "com.example.legacy", "3.0");
        let conflicts = resolver.conflicted_excluded_packages().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].excluded_version.as_deref(), Some("3.0"));

        match resolver.ensure_installable().unwrap_err() {
            Error::ExclusionConflict { excluded, excluding, .. } => {
                assert_eq!(excluded.len(), 1);
                assert!(excluding.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unbounded_exclusion_always_conflicts() {
        let (_temp, conn) = create_test_db();
        install(&conn, "com.example.legacy", "0.1.0");

        let descriptor = descriptor(
            "1.0.0",
            r#"<excludedpackages><excludedpackage>com.example.legacy</excludedpackage></excludedpackages>"#,
        );
        let conflicts = Resolver::new(&descriptor, &conn)
            .conflicted_excluded_packages()
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].excluded_version, None);
    }

    #[test]
    fn test_excluding_package_bound() {
        let (_temp, conn) = create_test_db();
        install(&conn, BASE, "1.0.0");
        let other = install(&conn, "com.example.other", "1.0.0");
        PackageExclusion::new(other, "com.example.plugin".to_string(), Some("3.0".to_string()))
            .insert(&conn)
            .unwrap();

        // Archive below the bound: no conflict
        let below = descriptor("2.9.0", "");
        assert!(Resolver::new(&below, &conn)
            .conflicted_excluding_packages()
            .unwrap()
            .is_empty());

        // Archive at the bound: conflict
        let at = descriptor("3.0.0", "");
        let conflicts = Resolver::new(&at, &conn)
            .conflicted_excluding_packages()
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].package, "com.example.other");
    }

    #[test]
    fn test_unique_abbreviation() {
        let (_temp, conn) = create_test_db();
        let mut app = Package::new(
            "org.other.plugin".to_string(),
            "Other".to_string(),
            "1.0.0".to_string(),
        );
        app.is_application = true;
        app.insert(&conn).unwrap();

        let mut descriptor = descriptor("1.0.0", "");
        assert!(Resolver::new(&descriptor, &conn).has_unique_abbreviation().unwrap());

        descriptor.is_application = true;
        assert!(!Resolver::new(&descriptor, &conn).has_unique_abbreviation().unwrap());
    }

    #[test]
    fn test_report_serializes_for_payload() {
        let (_temp, conn) = create_test_db();
        let descriptor = descriptor("1.0.0", "");
        let err = Resolver::new(&descriptor, &conn).ensure_installable().unwrap_err();

        let payload = err.payload();
        assert_eq!(payload["error"], "missingPackages");
        assert_eq!(payload["parameters"]["missingPackages"], 1);
        assert_eq!(payload["parameters"]["requirements"][0]["status"], "missing");
    }
}
