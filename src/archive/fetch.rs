// src/archive/fetch.rs

//! Download of remote package archives
//!
//! Every download gets a fresh file in the work directory. The file is only
//! kept once the body is complete, so an interrupted download leaves nothing
//! behind and a repeated download never replaces an archive that an
//! unfinished process still points to.

use crate::archive::{copy_with_deadline, remaining};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Maximum number of attempts per download
const MAX_RETRIES: u32 = 3;

/// Delay between retries (grows with each attempt)
const RETRY_DELAY_MS: u64 = 1000;

/// Last URL path segment, used as the suffix of the downloaded file
fn file_name_for(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or("archive.tar")
}

/// A new, uniquely named file in `work_dir` for the body of `url`
fn download_target(work_dir: &Path, url: &str) -> Result<NamedTempFile> {
    let suffix = format!("_{}", file_name_for(url));
    let file = tempfile::Builder::new()
        .prefix("package_")
        .suffix(&suffix)
        .tempfile_in(work_dir)?;
    Ok(file)
}

/// Download `url` into `work_dir` and return the local path
///
/// Each request is bounded by `http_timeout` and by whatever is left of
/// `deadline`. When the deadline passes no file is left behind.
pub fn download_archive(
    url: &str,
    work_dir: &Path,
    http_timeout: Duration,
    deadline: Option<Instant>,
) -> Result<PathBuf> {
    fs::create_dir_all(work_dir)?;

    info!("Downloading {} into {}", url, work_dir.display());

    let mut attempt = 0;
    loop {
        attempt += 1;

        let timeout = match remaining(deadline) {
            Some(left) if left.is_zero() => {
                return Err(Error::Timeout(format!("download of {}", url)));
            }
            Some(left) => left.min(http_timeout),
            None => http_timeout,
        };

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {}", e)))?;

        match client.get(url).send() {
            Ok(mut response) => {
                if !response.status().is_success() {
                    return Err(Error::DownloadError(format!(
                        "HTTP {} from {}",
                        response.status(),
                        url
                    )));
                }

                // Dropped, and thereby deleted, unless the copy completes
                let mut target = download_target(work_dir, url)?;
                copy_with_deadline(&mut response, &mut target, deadline, url)?;
                let (_, dest_path) = target.keep().map_err(|e| Error::Io(e.error))?;

                info!("Successfully downloaded to {}", dest_path.display());
                return Ok(dest_path);
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(Error::DownloadError(format!(
                        "Failed to download {} after {} attempts: {}",
                        url, attempt, e
                    )));
                }

                let delay = Duration::from_millis(RETRY_DELAY_MS * attempt as u64);
                if let Some(left) = remaining(deadline) {
                    if left <= delay {
                        return Err(Error::Timeout(format!("download of {}", url)));
                    }
                }

                warn!("Download attempt {} failed: {}, retrying...", attempt, e);
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_for_url() {
        assert_eq!(
            file_name_for("https://example.com/packages/plugin.tar.gz"),
            "plugin.tar.gz"
        );
        assert_eq!(file_name_for("https://example.com/get?id=5"), "get");
        assert_eq!(file_name_for("https://example.com/"), "archive.tar");
    }

    #[test]
    fn test_repeated_downloads_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://example.com/packages/plugin.tar.gz";

        let first = download_target(dir.path(), url).unwrap();
        let second = download_target(dir.path(), url).unwrap();
        assert_ne!(first.path(), second.path());
        for target in [&first, &second] {
            let name = target.path().file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("package_"));
            assert!(name.ends_with("_plugin.tar.gz"));
        }

        // An incomplete download is removed with its handle
        let (_, kept) = first.keep().unwrap();
        drop(second);
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(remaining, vec![kept]);
    }

    #[test]
    fn test_expired_deadline_fails_before_request() {
        let dir = tempfile::tempdir().unwrap();
        let err = download_archive(
            "http://127.0.0.1:9/plugin.tar",
            dir.path(),
            Duration::from_secs(5),
            Some(Instant::now()),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
