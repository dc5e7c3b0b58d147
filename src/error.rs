//! Error types shared by the flasher, bridge and board driver layers.
//!
//! Every failure carries enough context to name the missing prerequisite or
//! the external command that failed. Use [`Error::kind`] to decide how a
//! failure should be handled instead of matching on individual variants.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::settings::PartitionRole;

/// Result type for all `flashboot` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// A required artifact, address, mapping or command is missing. Always
    /// fatal.
    Configuration,
    /// The hardware did not respond as expected. Recovered by resetting the
    /// device with more force and trying again.
    TransientHardware,
    /// The debug bridge or serial connection could not be established.
    Connection,
    /// The board family does not support the requested operation.
    Unsupported,
    /// An external tool or the host system failed.
    External,
    /// The run was aborted; the cause is attached as the error source.
    Aborted,
}

/// Errors that can occur while deploying to or booting a device.
#[derive(Error, Debug)]
pub enum Error {
    #[error("a {0} image is required")]
    MissingArtifact(&'static str),

    #[error("kernel load address not defined")]
    MissingLoadAddress,

    #[error("no partition mapping for role `{0}`")]
    UnmappedPartition(PartitionRole),

    #[error("the connection_command is not defined")]
    MissingConnectionCommand,

    #[error("board `{board}` only supports {supported} targets, got `{requested}`")]
    UnsupportedTarget {
        board: &'static str,
        supported: &'static str,
        requested: String,
    },

    #[error("deploy must be run before boot")]
    DeployRequired,

    #[error("a {previous} deployment was already made in this run")]
    MixedDeployment { previous: &'static str },

    #[error("board `{board}` does not support {operation}")]
    Unsupported {
        board: &'static str,
        operation: &'static str,
    },

    #[error("unknown board `{0}`")]
    UnknownBoard(String),

    #[error("command `{command}` failed with status {}", exit_status(.code))]
    CommandFailed { command: String, code: Option<i32> },

    #[error("command `{command}` killed after {timeout:?}")]
    CommandTimedOut { command: String, timeout: Duration },

    #[error("device did not enter flash mode after {attempts} attempt(s)")]
    FlashModeUnreachable { attempts: u32 },

    #[error("failed to connect to the device: {reason}")]
    Connect {
        reason: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("invalid device configuration file `{}`", .path.display())]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid device configuration: {0}")]
    ConfigSyntax(#[from] toml::de::Error),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("failed to boot test image")]
    RunAborted(#[source] Box<Error>),
}

impl Error {
    /// Classify this error. See [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingArtifact(_)
            | Error::MissingLoadAddress
            | Error::UnmappedPartition(_)
            | Error::MissingConnectionCommand
            | Error::UnsupportedTarget { .. }
            | Error::DeployRequired
            | Error::MixedDeployment { .. }
            | Error::UnknownBoard(_)
            | Error::ConfigFile { .. }
            | Error::ConfigSyntax(_) => ErrorKind::Configuration,
            Error::FlashModeUnreachable { .. } => ErrorKind::TransientHardware,
            Error::Connect { .. } => ErrorKind::Connection,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::CommandFailed { .. } | Error::CommandTimedOut { .. } | Error::Io(_) => {
                ErrorKind::External
            }
            Error::RunAborted(_) => ErrorKind::Aborted,
        }
    }

    /// `true` when an external command exited with an error or was killed
    /// by its timeout.
    pub fn is_command_failure(&self) -> bool {
        matches!(
            self,
            Error::CommandFailed { .. } | Error::CommandTimedOut { .. }
        )
    }

    pub(crate) fn connect(reason: impl Into<String>, source: Option<Error>) -> Self {
        Error::Connect {
            reason: reason.into(),
            source: source.map(Box::new),
        }
    }
}

fn exit_status(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<signal>".to_string(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn configuration_errors_are_classified() {
    assert_eq!(Error::MissingLoadAddress.kind(), ErrorKind::Configuration);
    assert_eq!(
        Error::UnmappedPartition(PartitionRole::Rootfs).kind(),
        ErrorKind::Configuration
    );
    assert_eq!(Error::MissingArtifact("boot").kind(), ErrorKind::Configuration);
}

#[test]
fn connection_errors_are_distinguished() {
    let err = Error::connect("adb wait-for-device failed", None);
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(!err.is_command_failure());
}

#[test]
fn command_failure_message_names_the_command() {
    let err = Error::CommandFailed {
        command: "fastboot erase boot".into(),
        code: Some(1),
    };
    assert!(err.is_command_failure());
    assert_eq!(
        err.to_string(),
        "command `fastboot erase boot` failed with status 1"
    );
}
