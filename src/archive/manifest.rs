// src/archive/manifest.rs

//! Package manifest (`package.xml`) parsing
//!
//! The manifest is a `package` root element with a `name` attribute and the
//! children `packageinformation`, `authorinformation`, `requiredpackages`,
//! `optionalpackages`, `excludedpackages` and one or more `instructions`
//! blocks. An `instructions` block has a `type` of `install` or `update`;
//! update blocks additionally carry a `fromversion` selector.

use crate::archive::xml::Element;
use crate::db::models::Package;
use crate::error::{Error, Result};
use crate::version::{self, Version, VersionRange};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Language key used when a localized element has no `language` attribute
pub const DEFAULT_LANGUAGE: &str = "default";

/// Text given in several languages, in document order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalizedText {
    entries: Vec<(String, String)>,
}

impl LocalizedText {
    /// Set the text for a language; a repeated language replaces the earlier text
    pub fn insert(&mut self, language: impl Into<String>, text: impl Into<String>) {
        let language = language.into();
        let text = text.into();
        match self.entries.iter_mut().find(|(lang, _)| *lang == language) {
            Some(entry) => entry.1 = text,
            None => self.entries.push((language, text)),
        }
    }

    /// Text for `language`, falling back to `default`, then to the first
    /// available value, then to the empty string
    pub fn resolve(&self, language: &str) -> &str {
        self.get(language)
            .or_else(|| self.get(DEFAULT_LANGUAGE))
            .or_else(|| self.entries.first().map(|(_, text)| text.as_str()))
            .unwrap_or("")
    }

    pub fn get(&self, language: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(lang, _)| lang == language)
            .map(|(_, text)| text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorInfo {
    pub author: Option<String>,
    pub email: Option<String>,
    pub url: Option<String>,
}

/// A declared requirement on another package
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub name: String,
    pub min_version: Option<String>,
    /// Bundled sub-archive that satisfies this requirement
    pub file: Option<String>,
    /// All attributes as declared
    pub attributes: BTreeMap<String, String>,
}

impl Requirement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_version: None,
            file: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// An optional or excluded package declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageReference {
    pub name: String,
    pub version: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// One executable step, dispatched by its `pip` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub pip: String,
    pub value: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Update instructions applicable when the installed version matches `from_version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBlock {
    pub from_version: String,
    pub instructions: Vec<Instruction>,
}

/// Parsed manifest of a package archive
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    pub is_application: bool,
    pub package_url: String,
    pub package_name: LocalizedText,
    pub package_description: LocalizedText,
    pub readme: LocalizedText,
    pub license: LocalizedText,
    /// Release date as a UTC timestamp
    pub date: Option<i64>,
    pub author: AuthorInfo,
    /// Unique by name, in declaration order
    pub requirements: Vec<Requirement>,
    pub optionals: Vec<PackageReference>,
    pub exclusions: Vec<PackageReference>,
    pub install_instructions: Vec<Instruction>,
    /// Unique by `from_version`, in declaration order
    pub update_blocks: Vec<UpdateBlock>,
}

impl PackageDescriptor {
    /// Parse a manifest document
    ///
    /// A requirement on `base_package` is added unless it is declared already
    /// or the manifest describes `base_package` itself.
    pub fn parse(xml: &str, base_package: &str) -> Result<Self> {
        let root = Element::parse(xml)?;
        if root.name != "package" {
            return Err(Error::MalformedManifest(format!(
                "expected root element 'package', found '{}'",
                root.name
            )));
        }

        let name = root
            .attr("name")
            .ok_or_else(|| Error::MalformedManifest("package name is missing".to_string()))?;
        if !version::is_valid_package_name(name) {
            return Err(Error::InvalidPackageName(name.to_string()));
        }

        let mut descriptor = Self {
            name: name.to_string(),
            version: String::new(),
            is_application: false,
            package_url: String::new(),
            package_name: LocalizedText::default(),
            package_description: LocalizedText::default(),
            readme: LocalizedText::default(),
            license: LocalizedText::default(),
            date: None,
            author: AuthorInfo::default(),
            requirements: Vec::new(),
            optionals: Vec::new(),
            exclusions: Vec::new(),
            install_instructions: Vec::new(),
            update_blocks: Vec::new(),
        };

        let info = root.child("packageinformation").ok_or_else(|| {
            Error::MalformedManifest("packageinformation block is missing".to_string())
        })?;
        descriptor.read_package_information(info)?;
        if descriptor.version.is_empty() {
            return Err(Error::MalformedManifest(
                "package version is missing".to_string(),
            ));
        }

        if let Some(author) = root.child("authorinformation") {
            for element in &author.children {
                let value = Some(element.text().to_string());
                match element.name.as_str() {
                    "author" => descriptor.author.author = value,
                    "authoremail" => descriptor.author.email = value,
                    "authorurl" => descriptor.author.url = value,
                    _ => {}
                }
            }
        }

        if let Some(required) = root.child("requiredpackages") {
            for element in required.children_named("requiredpackage") {
                let reference = read_reference(element)?;
                let requirement = Requirement {
                    min_version: reference.attributes.get("minversion").cloned(),
                    file: reference.attributes.get("file").cloned(),
                    name: reference.name,
                    attributes: reference.attributes,
                };
                descriptor.add_requirement(requirement);
            }
        }

        if let Some(optionals) = root.child("optionalpackages") {
            for element in optionals.children_named("optionalpackage") {
                descriptor.optionals.push(read_reference(element)?);
            }
        }

        if let Some(excluded) = root.child("excludedpackages") {
            for element in excluded.children_named("excludedpackage") {
                descriptor.exclusions.push(read_reference(element)?);
            }
        }

        let mut has_instructions = false;
        for block in root.children_named("instructions") {
            has_instructions = true;
            let instructions = block
                .children_named("instruction")
                .map(read_instruction)
                .collect::<Result<Vec<_>>>()?;

            match block.attr("type") {
                Some("install") => descriptor.install_instructions = instructions,
                Some("update") => {
                    let from_version = block.attr("fromversion").ok_or_else(|| {
                        Error::MalformedManifest(
                            "update instructions without fromversion".to_string(),
                        )
                    })?;
                    VersionRange::parse(from_version).map_err(|_| {
                        Error::MalformedManifest(format!(
                            "invalid fromversion expression '{}'",
                            from_version
                        ))
                    })?;
                    descriptor.add_update_block(from_version, instructions);
                }
                other => {
                    return Err(Error::MalformedManifest(format!(
                        "unknown instructions type '{}'",
                        other.unwrap_or("")
                    )));
                }
            }
        }

        if !has_instructions {
            return Err(Error::MalformedManifest(
                "instructions block is missing".to_string(),
            ));
        }

        if descriptor.name != base_package
            && !descriptor.requirements.iter().any(|r| r.name == base_package)
        {
            descriptor.requirements.push(Requirement::new(base_package));
        }

        debug!(
            "Parsed manifest of {} {} ({} requirements)",
            descriptor.name,
            descriptor.version,
            descriptor.requirements.len()
        );

        Ok(descriptor)
    }

    fn read_package_information(&mut self, info: &Element) -> Result<()> {
        for element in &info.children {
            let text = element.text();
            match element.name.as_str() {
                "packagename" | "packagedescription" | "readme" | "license" => {
                    let language = element.attr("language").unwrap_or(DEFAULT_LANGUAGE);
                    let target = match element.name.as_str() {
                        "packagename" => &mut self.package_name,
                        "packagedescription" => &mut self.package_description,
                        "readme" => &mut self.readme,
                        _ => &mut self.license,
                    };
                    target.insert(language, text);
                }
                "isapplication" => {
                    self.is_application = matches!(text, "true")
                        || text.parse::<i64>().map(|v| v != 0).unwrap_or(false);
                }
                "packageurl" => self.package_url = text.to_string(),
                "version" => {
                    if !version::is_valid_version(text) {
                        return Err(Error::InvalidVersion(text.to_string()));
                    }
                    self.version = text.to_string();
                }
                "date" => {
                    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| {
                        Error::MalformedManifest(format!("invalid date '{}'", text))
                    })?;
                    self.date = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn add_requirement(&mut self, requirement: Requirement) {
        match self
            .requirements
            .iter_mut()
            .find(|r| r.name == requirement.name)
        {
            Some(existing) => *existing = requirement,
            None => self.requirements.push(requirement),
        }
    }

    fn add_update_block(&mut self, from_version: &str, instructions: Vec<Instruction>) {
        match self
            .update_blocks
            .iter_mut()
            .find(|b| b.from_version == from_version)
        {
            Some(existing) => existing.instructions = instructions,
            None => self.update_blocks.push(UpdateBlock {
                from_version: from_version.to_string(),
                instructions,
            }),
        }
    }

    /// Display name in the given language
    pub fn localized_name(&self, language: &str) -> &str {
        self.package_name.resolve(language)
    }

    /// Instructions of the first update block whose `fromversion` matches the
    /// installed version; empty when no block applies
    pub fn select_update_instructions(&self, installed_version: &str) -> Result<&[Instruction]> {
        let installed = Version::parse(installed_version)?;
        for block in &self.update_blocks {
            if VersionRange::parse(&block.from_version)?.contains(&installed) {
                debug!(
                    "Selected update block '{}' for installed version {}",
                    block.from_version, installed_version
                );
                return Ok(&block.instructions);
            }
        }

        Ok(&[])
    }

    /// The archive can be installed from scratch
    pub fn is_valid_install(&self) -> bool {
        !self.install_instructions.is_empty()
    }

    /// The archive is a newer version of `installed` and provides an update path from it
    pub fn is_valid_update(&self, installed: &Package) -> Result<bool> {
        if self.name != installed.package {
            return Ok(false);
        }

        if Version::parse(&self.version)? <= Version::parse(&installed.version)? {
            return Ok(false);
        }

        Ok(!self.select_update_instructions(&installed.version)?.is_empty())
    }

    /// Requirement declared for `name`, if any
    pub fn requirement(&self, name: &str) -> Option<&Requirement> {
        self.requirements.iter().find(|r| r.name == name)
    }
}

fn read_reference(element: &Element) -> Result<PackageReference> {
    let name = element.text();
    if !version::is_valid_package_name(name) {
        return Err(Error::InvalidPackageName(name.to_string()));
    }

    let attributes: BTreeMap<String, String> = element.attributes.iter().cloned().collect();
    Ok(PackageReference {
        name: name.to_string(),
        version: attributes.get("version").cloned(),
        attributes,
    })
}

fn read_instruction(element: &Element) -> Result<Instruction> {
    let pip = element
        .attr("type")
        .filter(|pip| !pip.is_empty())
        .ok_or_else(|| Error::MalformedManifest("instruction without type".to_string()))?;

    Ok(Instruction {
        pip: pip.to_string(),
        value: element.text().to_string(),
        attributes: element.attributes.iter().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "com.packforge.core";

    fn manifest(body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package name="com.example.plugin">
    <packageinformation>
        <packagename>Example Plugin</packagename>
        <packagename language="de">Beispiel</packagename>
        <version>2.1.0</version>
        <date>2024-03-01</date>
    </packageinformation>
    <authorinformation>
        <author>Example Ltd</author>
        <authorurl>https://example.com</authorurl>
    </authorinformation>
    {}
</package>"#,
            body
        )
    }

    #[test]
    fn test_parse_full_manifest() {
        let xml = manifest(
            r#"<requiredpackages>
                <requiredpackage minversion="1.0.0">com.example.lib</requiredpackage>
                <requiredpackage file="requirements/helper.tar">com.example.helper</requiredpackage>
            </requiredpackages>
            <optionalpackages>
                <optionalpackage file="optionals/extra.tar">com.example.extra</optionalpackage>
            </optionalpackages>
            <excludedpackages>
                <excludedpackage version="3.0.0">com.example.legacy</excludedpackage>
            </excludedpackages>
            <instructions type="install">
                <instruction type="file" application="wcf">files.tar</instruction>
                <instruction type="sql">install.sql</instruction>
            </instructions>
            <instructions type="update" fromversion="2.0.*">
                <instruction type="file">files_update.tar</instruction>
            </instructions>"#,
        );

        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();
        assert_eq!(descriptor.name, "com.example.plugin");
        assert_eq!(descriptor.version, "2.1.0");
        assert!(!descriptor.is_application);
        assert_eq!(descriptor.package_url, "");
        assert_eq!(descriptor.date, Some(1709251200));
        assert_eq!(descriptor.author.author.as_deref(), Some("Example Ltd"));
        assert_eq!(descriptor.author.url.as_deref(), Some("https://example.com"));

        let names: Vec<_> = descriptor.requirements.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["com.example.lib", "com.example.helper", BASE]);
        assert_eq!(descriptor.requirements[0].min_version.as_deref(), Some("1.0.0"));
        assert!(descriptor.requirement("com.example.extra").is_none());
        assert_eq!(
            descriptor.requirements[1].file.as_deref(),
            Some("requirements/helper.tar")
        );

        assert_eq!(descriptor.optionals.len(), 1);
        assert_eq!(descriptor.exclusions[0].version.as_deref(), Some("3.0.0"));

        assert!(descriptor.is_valid_install());
        assert_eq!(descriptor.install_instructions.len(), 2);
        assert_eq!(descriptor.install_instructions[0].pip, "file");
        assert_eq!(descriptor.install_instructions[0].value, "files.tar");
        assert_eq!(
            descriptor.install_instructions[0].attributes.get("application").map(String::as_str),
            Some("wcf")
        );
        assert_eq!(descriptor.update_blocks.len(), 1);
    }

    #[test]
    fn test_localized_resolution_order() {
        let mut text = LocalizedText::default();
        assert_eq!(text.resolve("en"), "");

        text.insert("fr", "Bonjour");
        text.insert("de", "Hallo");
        assert_eq!(text.resolve("en"), "Bonjour");

        text.insert(DEFAULT_LANGUAGE, "Hello");
        assert_eq!(text.resolve("en"), "Hello");
        assert_eq!(text.resolve("de"), "Hallo");
        assert_eq!(text.get("it"), None);

        let descriptor = PackageDescriptor::parse(&manifest(INSTALL_ONLY), BASE).unwrap();
        assert_eq!(descriptor.localized_name("de"), "Beispiel");
        assert_eq!(descriptor.localized_name("en"), "Example Plugin");
    }

    const INSTALL_ONLY: &str =
        r#"<instructions type="install"><instruction type="file">files.tar</instruction></instructions>"#;

    #[test]
    fn test_update_selection_takes_first_matching_block() {
        let xml = manifest(
            r#"<instructions type="update" fromversion="1.0.0">
                <instruction type="sql">from_1_0.sql</instruction>
            </instructions>
            <instructions type="update" fromversion="2.0.0">
                <instruction type="sql">from_2_0.sql</instruction>
            </instructions>
            <instructions type="update" fromversion="*">
                <instruction type="sql">any.sql</instruction>
            </instructions>"#,
        );
        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();

        let selected = descriptor.select_update_instructions("1.0.0").unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].value, "from_1_0.sql");

        let selected = descriptor.select_update_instructions("2.0.0").unwrap();
        assert_eq!(selected[0].value, "from_2_0.sql");

        let selected = descriptor.select_update_instructions("1.5.0").unwrap();
        assert_eq!(selected[0].value, "any.sql");
    }

    #[test]
    fn test_no_matching_update_block() {
        let xml = manifest(
            r#"<instructions type="update" fromversion="1.0.0">
                <instruction type="sql">from_1_0.sql</instruction>
            </instructions>"#,
        );
        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();
        assert!(descriptor.select_update_instructions("1.5.0").unwrap().is_empty());
        assert!(!descriptor.is_valid_install());
    }

    #[test]
    fn test_is_valid_update() {
        let xml = manifest(
            r#"<instructions type="update" fromversion="2.0.0">
                <instruction type="sql">update.sql</instruction>
            </instructions>"#,
        );
        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();

        let installed = |name: &str, version: &str| {
            Package::new(name.to_string(), name.to_string(), version.to_string())
        };

        assert!(descriptor.is_valid_update(&installed("com.example.plugin", "2.0.0")).unwrap());
        // Not newer than the installed version
        assert!(!descriptor.is_valid_update(&installed("com.example.plugin", "2.1.0")).unwrap());
        // Different package
        assert!(!descriptor.is_valid_update(&installed("com.example.other", "2.0.0")).unwrap());
        // No update path from 1.0.0
        assert!(!descriptor.is_valid_update(&installed("com.example.plugin", "1.0.0")).unwrap());
    }

    #[test]
    fn test_base_package_requirement() {
        let descriptor = PackageDescriptor::parse(&manifest(INSTALL_ONLY), BASE).unwrap();
        assert_eq!(descriptor.requirements.len(), 1);
        assert_eq!(descriptor.requirements[0].name, BASE);

        // Declared explicitly: kept as declared, not duplicated
        let xml = manifest(&format!(
            r#"<requiredpackages><requiredpackage minversion="2.0.0">{}</requiredpackage></requiredpackages>{}"#,
            BASE, INSTALL_ONLY
        ));
        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();
        assert_eq!(descriptor.requirements.len(), 1);
        assert_eq!(descriptor.requirements[0].min_version.as_deref(), Some("2.0.0"));

        // The base package does not require itself
        let xml = manifest(INSTALL_ONLY).replace("com.example.plugin", BASE);
        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();
        assert!(descriptor.requirements.is_empty());
    }

    #[test]
    fn test_invalid_manifests() {
        let xml = manifest(INSTALL_ONLY).replace("com.example.plugin", "plugin");
        assert!(matches!(
            PackageDescriptor::parse(&xml, BASE),
            Err(Error::InvalidPackageName(_))
        ));

        let xml = manifest(INSTALL_ONLY).replace("2.1.0", "2.1");
        assert!(matches!(
            PackageDescriptor::parse(&xml, BASE),
            Err(Error::InvalidVersion(_))
        ));

        let xml = manifest("");
        assert!(matches!(
            PackageDescriptor::parse(&xml, BASE),
            Err(Error::MalformedManifest(_))
        ));

        let xml = manifest(&format!(
            "<requiredpackages><requiredpackage>not valid</requiredpackage></requiredpackages>{}",
            INSTALL_ONLY
        ));
        assert!(matches!(
            PackageDescriptor::parse(&xml, BASE),
            Err(Error::InvalidPackageName(_))
        ));

        assert!(matches!(
            PackageDescriptor::parse("<package name=\"com.example.plugin\">", BASE),
            Err(Error::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_version_with_qualifier_is_accepted() {
        let xml = manifest(INSTALL_ONLY).replace("2.1.0", "2.1.0 Beta 1");
        let descriptor = PackageDescriptor::parse(&xml, BASE).unwrap();
        assert_eq!(descriptor.version, "2.1.0 Beta 1");
    }
}
