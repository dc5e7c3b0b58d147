//! Typed wrapper around the debug bridge (`adb`).
//!
//! Bridge commands are not serialized through the flash lock: each one is
//! addressed to its own device by the serial number in the configured
//! invocation.

use std::{path::Path, sync::Arc, time::Duration};

use log::info;

use crate::{
    error::{Error, Result},
    services::{CommandRunner, CommandStatus, SessionHandle},
    settings::DeviceConfig,
    utils::quote,
};

#[derive(Clone)]
pub struct AdbClient {
    device: Arc<DeviceConfig>,
    runner: Arc<dyn CommandRunner>,
}
impl AdbClient {
    pub fn new(device: Arc<DeviceConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        AdbClient { device, runner }
    }

    fn command(&self, args: &str) -> String {
        format!("{} {}", self.device.adb_command, args)
    }

    /// Run a bridge command with an explicit timeout.
    pub fn call(&self, args: &str, allow_failure: bool, timeout: Duration) -> Result<CommandStatus> {
        self.runner.run(&self.command(args), allow_failure, timeout)
    }

    /// Run a bridge command with the device's bridge timeout, failing on a
    /// non-zero exit.
    pub fn run(&self, args: &str) -> Result<()> {
        self.call(args, false, self.device.adb_timeout).map(|_| ())
    }

    /// Start a long-lived bridge command.
    pub fn spawn(&self, args: &str) -> Result<SessionHandle> {
        self.runner.spawn(&self.command(args))
    }

    /// Block until the device OS is up and reachable over the bridge.
    pub fn wait_for_device(&self) -> Result<()> {
        info!("waiting for the device to come up over adb");
        self.run("wait-for-device")
            .map_err(|e| Error::connect("device never showed up over adb", Some(e)))
    }

    /// Open an interactive shell on the device.
    pub fn shell(&self) -> Result<SessionHandle> {
        self.spawn("shell")
            .map_err(|e| Error::connect("could not open an adb shell", Some(e)))
    }

    pub fn push(&self, local: &Path, remote: &str) -> Result<()> {
        self.run(&format!(
            "push {} {}",
            quote(&local.to_string_lossy()),
            quote(remote)
        ))
    }

    /// Pull `remote` into `local`. With `allow_failure` a missing remote path
    /// is not an error.
    pub fn pull(&self, remote: &str, local: &Path, allow_failure: bool) -> Result<CommandStatus> {
        self.call(
            &format!("pull {} {}", quote(remote), quote(&local.to_string_lossy())),
            allow_failure,
            self.device.adb_timeout,
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn commands_use_the_configured_invocation() {
    use crate::testing::TestRig;

    let rig = TestRig::new();
    let device = Arc::new(rig.device().adb_command("adb -s 0123ABC").finalize());
    let adb = AdbClient::new(device, rig.runner.clone());

    adb.wait_for_device().unwrap();
    let session = adb.shell().unwrap();
    adb.push(Path::new("/tmp/mnt/local"), "/data/local").unwrap();

    assert_eq!(session.command(), "adb -s 0123ABC shell");
    assert_eq!(
        rig.runner.commands(),
        vec![
            "adb -s 0123ABC wait-for-device",
            "adb -s 0123ABC shell",
            "adb -s 0123ABC push /tmp/mnt/local /data/local",
        ]
    );
}

#[test]
fn wait_for_device_failure_is_a_connection_error() {
    use crate::{error::ErrorKind, testing::TestRig};

    let rig = TestRig::new();
    rig.runner.fail_on("wait-for-device");
    let adb = AdbClient::new(Arc::new(rig.device().finalize()), rig.runner.clone());

    let err = adb.wait_for_device().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[test]
fn tolerated_pull_failure() {
    use crate::testing::TestRig;

    let rig = TestRig::new();
    rig.runner.fail_on("pull");
    let adb = AdbClient::new(Arc::new(rig.device().finalize()), rig.runner.clone());

    let status = adb.pull("/data/missing", Path::new("/tmp/x"), true).unwrap();
    assert!(!status.success());
    assert!(adb.pull("/data/missing", Path::new("/tmp/x"), false).is_err());
}
