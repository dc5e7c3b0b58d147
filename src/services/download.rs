//! Fetching deployment artifacts into the run's working directory.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use retry::{delay, retry_with_index};

use super::CommandRunner;
use crate::{
    error::{Error, Result},
    utils::quote,
};

/// Brings an artifact referenced by URL onto the host.
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest_dir` and return the local path. When
    /// `decompress` is set, compressed artifacts are unpacked and the path of
    /// the uncompressed file is returned.
    fn fetch(&self, url: &str, dest_dir: &Path, decompress: bool) -> Result<PathBuf>;
}

/// [`Downloader`] copying local files (plain paths or `file://` URLs) and
/// fetching everything else with `curl`.
pub struct ShellDownloader {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    tries: usize,
}
impl ShellDownloader {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        ShellDownloader {
            runner,
            timeout: Duration::from_secs(1800),
            tries: 3,
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let command = format!("curl -fsSL -o {} {}", quote(&dest.to_string_lossy()), quote(url));
        let result = retry_with_index(
            delay::Fixed::from_millis(2000).take(self.tries.saturating_sub(1)),
            |index| {
                debug!("download attempt {} of {}", index, url);
                self.runner.run(&command, false, self.timeout)
            },
        );
        match result {
            Ok(_) => Ok(()),
            Err(retry::Error::Operation { error, tries, .. }) => {
                info!("giving up on {} after {} tries", url, tries);
                Err(error)
            }
            Err(retry::Error::Internal(reason)) => Err(Error::CommandFailed {
                command: format!("{} ({})", command, reason),
                code: None,
            }),
        }
    }

    fn decompress(&self, path: PathBuf) -> Result<PathBuf> {
        let tool = match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => "gzip",
            Some("xz") => "xz",
            Some("bz2") => "bzip2",
            _ => return Ok(path),
        };
        let command = format!("{} -df {}", tool, quote(&path.to_string_lossy()));
        self.runner.run(&command, false, self.timeout)?;
        Ok(path.with_extension(""))
    }
}
impl Downloader for ShellDownloader {
    fn fetch(&self, url: &str, dest_dir: &Path, decompress: bool) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(file_name(url));
        info!("fetching {} -> {}", url, dest.display());

        match local_path(url) {
            Some(source) => {
                if source != dest {
                    fs::copy(&source, &dest)?;
                }
            }
            None => self.download(url, &dest)?,
        }

        if decompress {
            self.decompress(dest)
        } else {
            Ok(dest)
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.contains("://") {
        None
    } else {
        Some(PathBuf::from(url))
    }
}

/// The last path segment of `url`, without query or fragment.
fn file_name(url: &str) -> String {
    let path = url.split(|c| c == '?' || c == '#').next().unwrap_or(url);
    match path.trim_end_matches('/').rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "download".to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn file_names_from_urls() {
    assert_eq!(file_name("http://host/images/boot.img.gz"), "boot.img.gz");
    assert_eq!(file_name("https://host/a/system.img?token=1"), "system.img");
    assert_eq!(file_name("/srv/images/userdata.img"), "userdata.img");
    assert_eq!(file_name("http://host/"), "host");
}

#[test]
fn local_files_are_copied() {
    use crate::testing::RecordingRunner;

    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let image = src.path().join("boot.img");
    fs::write(&image, b"ANDROID!").unwrap();

    let runner = RecordingRunner::new();
    let downloader = ShellDownloader::new(runner.clone());
    let url = format!("file://{}", image.display());
    let local = downloader.fetch(&url, dest.path(), true).unwrap();

    assert_eq!(local, dest.path().join("boot.img"));
    assert_eq!(fs::read(&local).unwrap(), b"ANDROID!");
    assert!(runner.commands().is_empty());
}

#[test]
fn remote_files_are_fetched_and_decompressed() {
    use crate::testing::RecordingRunner;

    let dest = tempfile::tempdir().unwrap();
    let runner = RecordingRunner::new();
    let downloader = ShellDownloader::new(runner.clone());
    let local = downloader
        .fetch("http://images/system.img.xz", dest.path(), true)
        .unwrap();

    assert_eq!(local, dest.path().join("system.img"));
    let commands = runner.commands();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].starts_with("curl -fsSL -o "));
    assert!(commands[0].ends_with("http://images/system.img.xz"));
    assert!(commands[1].starts_with("xz -df "));
}

#[test]
fn failed_downloads_are_retried() {
    use crate::testing::RecordingRunner;

    let dest = tempfile::tempdir().unwrap();
    let runner = RecordingRunner::new();
    runner.fail_on("curl");
    let mut downloader = ShellDownloader::new(runner.clone());
    downloader.tries = 2;

    let result = downloader.fetch("http://images/boot.img", dest.path(), false);
    assert!(matches!(result, Err(Error::CommandFailed { .. })));
    assert_eq!(runner.count("curl"), 2);
}
