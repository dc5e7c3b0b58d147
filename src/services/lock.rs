//! Host-wide serialization of flashing tool invocations.
//!
//! The flashing tool addresses devices by USB enumeration order, so two
//! invocations running at the same time, even for different devices, can
//! corrupt each other. Every invocation therefore holds an exclusive
//! `flock(2)` on a well known lock file for its whole duration, including
//! its own timeout.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::trace;
use nix::fcntl::{Flock, FlockArg};

use super::{CommandRunner, CommandStatus, SessionHandle};
use crate::error::Result;

/// A named, filesystem visible mutual exclusion lock.
#[derive(Debug, Clone)]
pub struct FlashLock {
    path: PathBuf,
}
impl FlashLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FlashLock { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held. The lock is released when the returned
    /// guard is dropped.
    ///
    /// Each call opens the file again, so the lock also excludes other
    /// threads of this process and not only other processes.
    pub fn acquire(&self) -> Result<Flock<File>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        trace!("waiting for {}", self.path.display());
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        trace!("holding {}", self.path.display());
        Ok(guard)
    }
}

/// A [`CommandRunner`] proxy running every command while holding a
/// [`FlashLock`].
#[derive(Clone)]
pub struct LockedRunner {
    inner: Arc<dyn CommandRunner>,
    lock: FlashLock,
}
impl LockedRunner {
    pub fn new(inner: Arc<dyn CommandRunner>, lock: FlashLock) -> Self {
        LockedRunner { inner, lock }
    }

    pub fn lock(&self) -> &FlashLock {
        &self.lock
    }
}
impl CommandRunner for LockedRunner {
    fn run(&self, command: &str, allow_failure: bool, timeout: Duration) -> Result<CommandStatus> {
        let _guard = self.lock.acquire()?;
        self.inner.run(command, allow_failure, timeout)
    }

    /// Spawned sessions run without the lock.
    fn spawn(&self, command: &str) -> Result<SessionHandle> {
        self.inner.spawn(command)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn concurrent_runs_never_interleave() {
    use crate::testing::RecordingRunner;
    use std::thread;

    let dir = tempfile::tempdir().unwrap();
    let recorder = RecordingRunner::with_work(Duration::from_millis(40));
    let lock = FlashLock::new(dir.path().join("locks/fastboot.lck"));

    let handles: Vec<_> = (0..2)
        .map(|device| {
            let runner = LockedRunner::new(recorder.clone(), lock.clone());
            thread::spawn(move || {
                for partition in &["boot", "system", "userdata"] {
                    let command = format!("fastboot -s dev{} flash {}", device, partition);
                    runner.run(&command, false, Duration::from_secs(5)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut calls = recorder.calls();
    assert_eq!(calls.len(), 6);
    calls.sort_by_key(|call| call.started);
    for pair in calls.windows(2) {
        assert!(
            pair[0].finished <= pair[1].started,
            "`{}` overlapped `{}`",
            pair[0].command,
            pair[1].command
        );
    }
}

#[test]
fn lock_is_released_after_each_command() {
    use crate::testing::RecordingRunner;

    let dir = tempfile::tempdir().unwrap();
    let lock = FlashLock::new(dir.path().join("fastboot.lck"));
    let runner = LockedRunner::new(RecordingRunner::new(), lock.clone());
    runner
        .run("fastboot devices", false, Duration::from_secs(1))
        .unwrap();

    // Would block forever if the previous guard leaked.
    let guard = lock.acquire().unwrap();
    drop(guard);
}
