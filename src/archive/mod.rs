// src/archive/mod.rs

//! Package archive access
//!
//! A package archive is a tar file, optionally compressed with gzip, xz or
//! zstd, that carries a `package.xml` manifest plus the files referenced by
//! its instructions (including nested sub-archives for bundled requirements).
//! Compression is detected from the file's magic bytes.

pub mod fetch;
pub mod manifest;
pub mod xml;

pub use manifest::{
    AuthorInfo, Instruction, LocalizedText, PackageDescriptor, PackageReference, Requirement,
    UpdateBlock,
};

use crate::config::MANIFEST_ENTRY;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tar::Archive;
use tracing::{debug, info};
use xz2::read::XzDecoder;

static SUB_ARCHIVE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\.(?:tar\.gz|tgz|tar))$").expect("suffix pattern is valid"));

/// Compression formats supported for package archives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    None,
    Gzip,
    Xz,
    Zstd,
}

/// Detect the compression of a file from its leading bytes
pub fn detect_compression(path: &Path) -> Result<CompressionFormat> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 6];
    let mut len = 0;
    while len < magic.len() {
        let n = file.read(&mut magic[len..])?;
        if n == 0 {
            break;
        }
        len += n;
    }
    let magic = &magic[..len];

    let format = if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
        CompressionFormat::Zstd
    } else if magic.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
        CompressionFormat::Xz
    } else if magic.starts_with(&[0x1F, 0x8B]) {
        CompressionFormat::Gzip
    } else {
        CompressionFormat::None
    };

    Ok(format)
}

/// Open a tar archive, decompressing on the fly
pub(crate) fn open_tar(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let compression = detect_compression(path)?;
    let file = File::open(path)?;

    let reader: Box<dyn Read> = match compression {
        CompressionFormat::Zstd => Box::new(zstd::Decoder::new(file)?),
        CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
        CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
        CompressionFormat::None => Box::new(file),
    };

    Ok(Archive::new(reader))
}

/// Entry name without leading `./` or `/`
fn normalize_entry_name(name: &str) -> &str {
    let mut name = name;
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else {
            return name;
        }
    }
}

fn check_deadline(deadline: Option<Instant>, what: &str) -> Result<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout(what.to_string())),
        _ => Ok(()),
    }
}

/// Time left until `deadline`, or `None` when there is no deadline
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Copy `reader` into `writer`, giving up once `deadline` passes
pub(crate) fn copy_with_deadline<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    deadline: Option<Instant>,
    what: &str,
) -> Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        check_deadline(deadline, what)?;
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Where a package archive comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    Local(PathBuf),
    Remote(String),
}

impl ArchiveSource {
    /// Classify a user-supplied location
    pub fn parse(location: &str) -> Self {
        let lower = location.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ArchiveSource::Remote(location.to_string())
        } else {
            ArchiveSource::Local(PathBuf::from(location))
        }
    }

    /// Make the archive available as a local file
    ///
    /// Remote archives are downloaded into `work_dir`; local ones must exist.
    pub fn materialize(
        &self,
        work_dir: &Path,
        http_timeout: Duration,
        deadline: Option<Instant>,
    ) -> Result<PathBuf> {
        match self {
            ArchiveSource::Local(path) => {
                if !path.is_file() {
                    return Err(Error::ArchiveNotFound(path.display().to_string()));
                }
                Ok(path.clone())
            }
            ArchiveSource::Remote(url) => {
                fetch::download_archive(url, work_dir, http_timeout, deadline)
            }
        }
    }
}

/// An opened package archive with its parsed manifest
#[derive(Debug, Clone)]
pub struct PackageArchive {
    path: PathBuf,
    descriptor: PackageDescriptor,
}

impl PackageArchive {
    /// Open an archive and parse its manifest
    pub fn open(path: impl AsRef<Path>, base_package: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::ArchiveNotFound(path.display().to_string()));
        }

        debug!("Opening package archive {}", path.display());

        let manifest = match Self::read_entry_from(path, MANIFEST_ENTRY)? {
            Some(bytes) => bytes,
            None => {
                return Err(Error::ManifestMissing {
                    archive: path.display().to_string(),
                    entry: MANIFEST_ENTRY.to_string(),
                });
            }
        };

        let xml = String::from_utf8(manifest)
            .map_err(|e| Error::MalformedManifest(format!("manifest is not UTF-8: {}", e)))?;
        let descriptor = PackageDescriptor::parse(&xml, base_package)?;

        Ok(Self {
            path: path.to_path_buf(),
            descriptor,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &PackageDescriptor {
        &self.descriptor
    }

    /// Read a whole entry into memory
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        Self::read_entry_from(&self.path, name)?.ok_or_else(|| Error::EntryNotFound {
            archive: self.path.display().to_string(),
            entry: name.to_string(),
        })
    }

    fn read_entry_from(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let wanted = normalize_entry_name(name);
        let mut archive = open_tar(path)?;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.to_string_lossy().into_owned();
            if normalize_entry_name(&entry_path) == wanted {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                return Ok(Some(content));
            }
        }

        Ok(None)
    }

    /// Whether the archive contains an entry
    pub fn has_entry(&self, name: &str) -> Result<bool> {
        let wanted = normalize_entry_name(name);
        let mut archive = open_tar(&self.path)?;

        for entry in archive.entries()? {
            let entry = entry?;
            if normalize_entry_name(&entry.path()?.to_string_lossy()) == wanted {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Extract a nested entry into a new file in `dir`
    ///
    /// The file outlives this call; it keeps the entry's `.tar`, `.tar.gz` or
    /// `.tgz` suffix. A partially written file is removed when the deadline
    /// passes.
    pub fn extract_entry_to(
        &self,
        name: &str,
        dir: &Path,
        deadline: Option<Instant>,
    ) -> Result<PathBuf> {
        let wanted = normalize_entry_name(name);
        let suffix = SUB_ARCHIVE_SUFFIX
            .captures(wanted)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        fs::create_dir_all(dir)?;
        let mut archive = open_tar(&self.path)?;

        for entry in archive.entries()? {
            let mut entry = entry?;
            if normalize_entry_name(&entry.path()?.to_string_lossy()) != wanted {
                continue;
            }

            let temp = tempfile::Builder::new()
                .prefix("package_")
                .suffix(&suffix)
                .tempfile_in(dir)?;
            let (mut file, target) = temp.keep().map_err(|e| Error::Io(e.error))?;

            if let Err(e) = copy_with_deadline(&mut entry, &mut file, deadline, name) {
                drop(file);
                let _ = fs::remove_file(&target);
                return Err(e);
            }

            info!("Extracted {} to {}", name, target.display());
            return Ok(target);
        }

        Err(Error::EntryNotFound {
            archive: self.path.display().to_string(),
            entry: name.to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Build a tar in memory from `(name, content)` pairs
    pub(crate) fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    const MANIFEST: &str = r#"<?xml version="1.0"?>
<package name="com.example.plugin">
    <packageinformation>
        <packagename>Example Plugin</packagename>
        <version>1.2.0</version>
    </packageinformation>
    <instructions type="install">
        <instruction type="file">files.tar</instruction>
    </instructions>
</package>"#;

    fn write_archive(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_open_plain_and_gzip_archives() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_bytes(&[("package.xml", MANIFEST.as_bytes())]);

        let plain = write_archive(dir.path(), "plain.tar", &tar);
        let archive = PackageArchive::open(&plain, "com.packforge.core").unwrap();
        assert_eq!(archive.descriptor().name, "com.example.plugin");
        assert_eq!(detect_compression(&plain).unwrap(), CompressionFormat::None);

        let gz = write_archive(dir.path(), "archive.bin", &gzip(&tar));
        assert_eq!(detect_compression(&gz).unwrap(), CompressionFormat::Gzip);
        let archive = PackageArchive::open(&gz, "com.packforge.core").unwrap();
        assert_eq!(archive.descriptor().version, "1.2.0");
    }

    #[test]
    fn test_open_zstd_archive() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_bytes(&[("./package.xml", MANIFEST.as_bytes())]);
        let compressed = zstd::encode_all(&tar[..], 3).unwrap();

        let path = write_archive(dir.path(), "plugin.tar.zst", &compressed);
        assert_eq!(detect_compression(&path).unwrap(), CompressionFormat::Zstd);
        let archive = PackageArchive::open(&path, "com.packforge.core").unwrap();
        assert_eq!(archive.descriptor().name, "com.example.plugin");
    }

    #[test]
    fn test_manifest_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_archive(dir.path(), "empty.tar", &tar_bytes(&[("readme.txt", b"hi".as_slice())]));

        let err = PackageArchive::open(&path, "com.packforge.core").unwrap_err();
        assert!(matches!(err, Error::ManifestMissing { .. }));
    }

    #[test]
    fn test_archive_not_found() {
        let err = PackageArchive::open("/nonexistent/plugin.tar", "com.packforge.core").unwrap_err();
        assert!(matches!(err, Error::ArchiveNotFound(_)));

        let source = ArchiveSource::parse("/nonexistent/plugin.tar");
        let err = source
            .materialize(Path::new("/tmp"), Duration::from_secs(1), None)
            .unwrap_err();
        assert!(matches!(err, Error::ArchiveNotFound(_)));
    }

    #[test]
    fn test_extract_sub_archive() {
        let dir = tempfile::tempdir().unwrap();
        let nested = gzip(&tar_bytes(&[("a.txt", b"a".as_slice())]));
        let tar = tar_bytes(&[
            ("package.xml", MANIFEST.as_bytes()),
            ("requirements/lib.tar.gz", nested.as_slice()),
        ]);
        let path = write_archive(dir.path(), "plugin.tar", &tar);
        let archive = PackageArchive::open(&path, "com.packforge.core").unwrap();

        assert!(archive.has_entry("requirements/lib.tar.gz").unwrap());
        assert_eq!(archive.read_entry("./requirements/lib.tar.gz").unwrap(), nested);
        let work = dir.path().join("work");
        let extracted = archive
            .extract_entry_to("requirements/lib.tar.gz", &work, None)
            .unwrap();
        assert!(extracted.to_string_lossy().ends_with(".tar.gz"));
        assert_eq!(detect_compression(&extracted).unwrap(), CompressionFormat::Gzip);

        let err = archive.extract_entry_to("missing.tar", &work, None).unwrap_err();
        assert!(matches!(err, Error::EntryNotFound { .. }));
    }

    #[test]
    fn test_extract_respects_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_bytes(&[("package.xml", MANIFEST.as_bytes()), ("files.tar", b"data".as_slice())]);
        let path = write_archive(dir.path(), "plugin.tar", &tar);
        let archive = PackageArchive::open(&path, "com.packforge.core").unwrap();

        let work = dir.path().join("work");
        let err = archive
            .extract_entry_to("files.tar", &work, Some(Instant::now()))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn test_source_classification() {
        assert_eq!(
            ArchiveSource::parse("https://example.com/plugin.tar"),
            ArchiveSource::Remote("https://example.com/plugin.tar".to_string())
        );
        assert_eq!(
            ArchiveSource::parse("plugin.tar"),
            ArchiveSource::Local(PathBuf::from("plugin.tar"))
        );
    }
}
