//! Execution of external command lines with a hard timeout.

use std::{
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};

use super::{SessionHandle, SessionIo};
use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// How an external command terminated.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CommandStatus {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// `true` when the process was killed because its timeout expired.
    pub timed_out: bool,
}
impl CommandStatus {
    pub fn exited(code: i32) -> Self {
        CommandStatus {
            code: Some(code),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.code == Some(0)
    }
}

/// Runs shell command lines on the dispatcher host.
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion, killing it once `timeout` expires.
    ///
    /// A non-zero exit or a timeout is an error unless `allow_failure` is
    /// set, in which case the status is returned for the caller to inspect.
    fn run(&self, command: &str, allow_failure: bool, timeout: Duration) -> Result<CommandStatus>;

    /// Start `command` and hand back the running process without waiting for
    /// it.
    fn spawn(&self, command: &str) -> Result<SessionHandle>;
}

/// Turn a finished command into a result according to `allow_failure`.
pub(crate) fn check_status(
    command: &str,
    status: CommandStatus,
    allow_failure: bool,
    timeout: Duration,
) -> Result<CommandStatus> {
    if status.success() {
        return Ok(status);
    }
    if allow_failure {
        debug!("ignoring failure of `{}`: {:?}", command, status);
        return Ok(status);
    }
    if status.timed_out {
        Err(Error::CommandTimedOut {
            command: command.to_string(),
            timeout,
        })
    } else {
        Err(Error::CommandFailed {
            command: command.to_string(),
            code: status.code,
        })
    }
}

/// [`CommandRunner`] executing command lines with `sh -c`.
///
/// Every command gets its own process group so that the timeout kills the
/// whole pipeline and not just the shell. Spawned sessions are piped unless
/// [`SessionIo::Inherit`] is asked for.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    poll_interval: Duration,
    session_io: SessionIo,
}
impl ShellRunner {
    pub fn new() -> Self {
        ShellRunner {
            poll_interval: Duration::from_millis(50),
            session_io: SessionIo::Piped,
        }
    }

    pub fn with_session_io(mut self, session_io: SessionIo) -> Self {
        self.session_io = session_io;
        self
    }
}
impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}
impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, allow_failure: bool, timeout: Duration) -> Result<CommandStatus> {
        debug!("$ {}", command);
        let mut child = shell(command).stdin(Stdio::null()).spawn()?;

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break CommandStatus {
                    code: status.code(),
                    timed_out: false,
                };
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("`{}` still running after {:?}, killing it", command, timeout);
                kill_group(&mut child);
                child.wait()?;
                break CommandStatus {
                    code: None,
                    timed_out: true,
                };
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        };

        check_status(command, status, allow_failure, timeout)
    }

    fn spawn(&self, command: &str) -> Result<SessionHandle> {
        debug!("$ {} &", command);
        let child = match self.session_io {
            SessionIo::Piped => shell(command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .spawn()?,
            // Stays in the foreground process group to be able to read the
            // terminal.
            SessionIo::Inherit => Command::new("sh").arg("-c").arg(command).spawn()?,
        };
        Ok(SessionHandle::new(command, child))
    }
}

/// Kill the process group led by `child`, falling back to the child alone.
pub(crate) fn kill_group(child: &mut Child) {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(errno) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pgid, errno);
        let _ = child.kill();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn successful_command() {
    let status = ShellRunner::new()
        .run("true", false, Duration::from_secs(5))
        .unwrap();
    assert!(status.success());
}

#[test]
fn failing_command_is_an_error() {
    let result = ShellRunner::new().run("exit 3", false, Duration::from_secs(5));
    assert!(matches!(
        result,
        Err(Error::CommandFailed { code: Some(3), .. })
    ));
}

#[test]
fn tolerated_failure_returns_status() {
    let status = ShellRunner::new()
        .run("exit 3", true, Duration::from_secs(5))
        .unwrap();
    assert_eq!(status, CommandStatus::exited(3));
}

#[test]
fn timeout_kills_the_whole_pipeline() {
    let start = Instant::now();
    let result = ShellRunner::new().run("sleep 30 | cat", false, Duration::from_millis(200));
    assert!(matches!(result, Err(Error::CommandTimedOut { .. })));
    assert!(start.elapsed() < Duration::from_secs(10));
}
