//! Test doubles for the external services.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tempfile::TempDir;

use crate::{
    error::{Error, Result},
    services::{
        check_status, CommandRunner, CommandStatus, Downloader, RamdiskTool, ResultLog,
        SerialConnector, Services, SessionHandle,
    },
    settings::DeviceConfigBuilder,
};

/// One command seen by a [`RecordingRunner`].
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub command: String,
    pub started: Instant,
    pub finished: Instant,
}

/// A [`CommandRunner`] that records every command instead of running it.
/// Commands containing one of the `fail_on` patterns exit with status 1.
#[derive(Debug, Default)]
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<Vec<String>>,
    work: Duration,
}
impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingRunner::default())
    }

    /// Every command takes `work` to complete.
    pub fn with_work(work: Duration) -> Arc<Self> {
        Arc::new(RecordingRunner {
            work,
            ..RecordingRunner::default()
        })
    }

    pub fn fail_on(&self, pattern: &str) {
        self.failing.lock().unwrap().push(pattern.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.command).collect()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }

    fn fails(&self, command: &str) -> bool {
        self.failing
            .lock()
            .unwrap()
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
    }

    fn record(&self, command: &str) {
        let started = Instant::now();
        if !self.work.is_zero() {
            thread::sleep(self.work);
        }
        self.calls.lock().unwrap().push(Call {
            command: command.to_string(),
            started,
            finished: Instant::now(),
        });
    }
}
impl CommandRunner for RecordingRunner {
    fn run(&self, command: &str, allow_failure: bool, timeout: Duration) -> Result<CommandStatus> {
        self.record(command);
        let code = if self.fails(command) { 1 } else { 0 };
        check_status(command, CommandStatus::exited(code), allow_failure, timeout)
    }

    fn spawn(&self, command: &str) -> Result<SessionHandle> {
        self.record(command);
        if self.fails(command) {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                code: Some(1),
            });
        }
        Ok(SessionHandle::detached(command))
    }
}

/// A [`Downloader`] returning where the artifact would have landed.
#[derive(Debug, Default)]
pub(crate) struct FakeDownloader {
    fetched: Mutex<Vec<(String, PathBuf, bool)>>,
}
impl FakeDownloader {
    pub fn urls(&self) -> Vec<String> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _, _)| url.clone())
            .collect()
    }

    pub fn destinations(&self) -> Vec<PathBuf> {
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, dir, _)| dir.clone())
            .collect()
    }
}
impl Downloader for FakeDownloader {
    fn fetch(&self, url: &str, dest_dir: &Path, decompress: bool) -> Result<PathBuf> {
        self.fetched
            .lock()
            .unwrap()
            .push((url.to_string(), dest_dir.to_owned(), decompress));
        let name = url.rsplit('/').next().unwrap_or(url);
        let name = if decompress {
            name.trim_end_matches(".gz")
        } else {
            name
        };
        Ok(dest_dir.join(name))
    }
}

/// A [`RamdiskTool`] recording the operations it was asked to do.
#[derive(Debug, Default)]
pub(crate) struct FakeRamdisk {
    ops: Mutex<Vec<String>>,
}
impl FakeRamdisk {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}
impl RamdiskTool for FakeRamdisk {
    fn extract(&self, ramdisk: &Path, work_dir: &Path) -> Result<PathBuf> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("extract {}", ramdisk.display()));
        Ok(work_dir.join("ramdisk"))
    }

    fn inject_modules(&self, modules: &Path, extracted: &Path) -> Result<()> {
        self.ops.lock().unwrap().push(format!(
            "inject {} {}",
            modules.display(),
            extracted.display()
        ));
        Ok(())
    }

    fn repack(&self, extracted: &Path, work_dir: &Path) -> Result<PathBuf> {
        self.ops
            .lock()
            .unwrap()
            .push(format!("repack {}", extracted.display()));
        Ok(work_dir.join("ramdisk.repacked.cpio.gz"))
    }
}

/// A [`SerialConnector`] handing out detached sessions, or the session
/// given to [`FakeSerial::hand_out`].
#[derive(Debug, Default)]
pub(crate) struct FakeSerial {
    commands: Mutex<Vec<String>>,
    next: Mutex<Option<SessionHandle>>,
}
impl FakeSerial {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// The next `connect` returns `session`.
    pub fn hand_out(&self, session: SessionHandle) {
        *self.next.lock().unwrap() = Some(session);
    }
}
impl SerialConnector for FakeSerial {
    fn connect(&self, connection_command: &str) -> Result<SessionHandle> {
        self.commands
            .lock()
            .unwrap()
            .push(connection_command.to_string());
        match self.next.lock().unwrap().take() {
            Some(session) => Ok(session),
            None => Ok(SessionHandle::detached(connection_command)),
        }
    }
}

/// All doubles wired together, plus a temporary directory for lock files and
/// scratch space.
pub(crate) struct TestRig {
    pub runner: Arc<RecordingRunner>,
    pub downloader: Arc<FakeDownloader>,
    pub ramdisk: Arc<FakeRamdisk>,
    pub serial: Arc<FakeSerial>,
    pub results: Arc<ResultLog>,
    pub dir: TempDir,
}
impl TestRig {
    pub fn new() -> Self {
        TestRig {
            runner: RecordingRunner::new(),
            downloader: Arc::new(FakeDownloader::default()),
            ramdisk: Arc::new(FakeRamdisk::default()),
            serial: Arc::new(FakeSerial::default()),
            results: Arc::new(ResultLog::new()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            runner: self.runner.clone(),
            downloader: self.downloader.clone(),
            ramdisk: self.ramdisk.clone(),
            serial: self.serial.clone(),
            results: self.results.clone(),
        }
    }

    /// A device that never sleeps and locks inside the rig's directory.
    pub fn device(&self) -> DeviceConfigBuilder {
        DeviceConfigBuilder::new()
            .fastboot_command("fastboot")
            .adb_command("adb")
            .settle_delay(Duration::ZERO)
            .lock_file(self.dir.path().join("fastboot.lck"))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }
}
