//! Long-lived processes handed to the caller, such as an `adb shell` or a
//! serial console.

use std::{io, process::Child};

use log::debug;

use super::command::kill_group;
use crate::error::Result;

/// How the standard streams of a spawned session are wired.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionIo {
    /// The session shares the terminal of the calling process.
    Inherit,
    /// stdin and stdout are pipes, reachable through
    /// [`SessionHandle::child_mut`].
    Piped,
}

/// An opaque handle on a spawned interactive session.
///
/// The session outlives the driver that created it. Its owner decides when
/// it ends; [`SessionHandle::shutdown`] forcibly terminates it.
#[derive(Debug)]
pub struct SessionHandle {
    command: String,
    child: Option<Child>,
}
impl SessionHandle {
    pub fn new(command: impl Into<String>, child: Child) -> Self {
        SessionHandle {
            command: command.into(),
            child: Some(child),
        }
    }

    /// A handle without a process behind it.
    #[cfg(test)]
    pub(crate) fn detached(command: impl Into<String>) -> Self {
        SessionHandle {
            command: command.into(),
            child: None,
        }
    }

    /// The command line that started the session.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Access to the process, e.g. to talk to its stdin/stdout.
    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Wait for the session to end by itself, returning its exit code.
    ///
    /// A piped stdin is closed and whatever is left on a piped stdout is
    /// discarded, otherwise a chatty session blocks on a full pipe.
    pub fn wait(&mut self) -> Result<Option<i32>> {
        match self.child.take() {
            Some(mut child) => {
                drop(child.stdin.take());
                if let Some(mut stdout) = child.stdout.take() {
                    io::copy(&mut stdout, &mut io::sink())?;
                }
                Ok(child.wait()?.code())
            }
            None => Ok(None),
        }
    }

    /// Kill the session and everything it started. Safe to call more than
    /// once.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            debug!("shutting down `{}`", self.command);
            kill_group(&mut child);
            child.wait()?;
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn shutdown_kills_a_running_session() {
    use super::{CommandRunner, ShellRunner};

    let mut session = ShellRunner::new().spawn("sleep 30").unwrap();
    assert!(session.id().is_some());
    assert_eq!(session.command(), "sleep 30");
    session.shutdown().unwrap();
    assert!(session.id().is_none());
    session.shutdown().unwrap();
}

#[test]
fn wait_drains_a_chatty_session() {
    use super::{CommandRunner, ShellRunner};
    use std::time::{Duration, Instant};

    let start = Instant::now();
    let mut session = ShellRunner::new()
        .spawn("head -c 300000 /dev/zero; echo done")
        .unwrap();
    assert_eq!(session.wait().unwrap(), Some(0));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn inherited_session_reports_its_exit_code() {
    use super::{CommandRunner, ShellRunner};

    let runner = ShellRunner::new().with_session_io(SessionIo::Inherit);
    let mut session = runner.spawn("exit 4").unwrap();
    assert!(session.child_mut().unwrap().stdout.is_none());
    assert_eq!(session.wait().unwrap(), Some(4));
}
