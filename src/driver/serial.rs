//! Boards reached through a serial console.
//!
//! The console is opened with the device's connection command. When the
//! board runs Android it is additionally reachable over the debug bridge,
//! and some boards need to see the bridge come up before they count as
//! booted.

use log::{debug, warn};

use super::{BoardDriver, BootMethod, DriverCore, KernelArtifacts, OsImageArtifacts};
use crate::{
    error::{Error, Result},
    fastboot::{EnterOutcome, ResetMethod},
    services::SessionHandle,
    utils::settle,
};

/// Where the boards of the serial family differ from each other.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SerialQuirks {
    /// Kernel deployments are supported.
    pub kernel_deploy: bool,
    /// The boot partition is erased before an OS image is deployed.
    pub erase_boot: bool,
    /// `connect` waits for the bridge when the target is Android.
    pub bridge_on_connect: bool,
    /// `boot` waits for the bridge when the target is Android.
    pub bridge_after_boot: bool,
    /// The first stage bootloader needs the settle delay after a reset
    /// before it accepts commands.
    pub settle_after_enter: bool,
    pub boot: BootMethod,
}

pub struct SerialDriver {
    board: &'static str,
    quirks: SerialQuirks,
    core: DriverCore,
}
impl SerialDriver {
    pub fn new(board: &'static str, quirks: SerialQuirks, core: DriverCore) -> Self {
        SerialDriver {
            board,
            quirks,
            core,
        }
    }

    pub fn quirks(&self) -> SerialQuirks {
        self.quirks
    }

    fn is_android(&self) -> bool {
        self.core.run_config().target_type.is_android()
    }
}
impl BoardDriver for SerialDriver {
    fn board(&self) -> &'static str {
        self.board
    }

    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn connect(&mut self) -> Result<SessionHandle> {
        let mut session = self.core.serial_console()?;
        if self.quirks.bridge_on_connect && self.is_android() {
            if let Err(e) = self.core.wait_for_bridge() {
                if let Err(shutdown) = self.core.finalize(&mut session) {
                    warn!("could not close `{}`: {}", session.command(), shutdown);
                }
                return Err(e);
            }
        }
        Ok(session)
    }

    fn enter_flash_mode(&mut self, method: ResetMethod) -> Result<EnterOutcome> {
        let outcome = self.core.enter(method)?;
        if self.quirks.settle_after_enter {
            settle(
                self.core.device().settle_delay,
                "Waiting for the first stage bootloader",
            );
        }
        Ok(outcome)
    }

    fn in_flash_mode(&mut self) -> bool {
        self.core.in_flash_mode()
    }

    fn deploy_kernel(&mut self, artifacts: &KernelArtifacts) -> Result<()> {
        if !self.quirks.kernel_deploy {
            return Err(Error::Unsupported {
                board: self.board,
                operation: "kernel deployment",
            });
        }
        self.core.deploy_kernel(artifacts)
    }

    fn deploy_os_image(&mut self, artifacts: &OsImageArtifacts) -> Result<()> {
        self.core.check_os_image(artifacts)?;
        self.erase_boot_partition()?;
        self.core.deploy_os_image(artifacts)
    }

    fn boot(&mut self, boot_args: &str) -> Result<()> {
        match self.quirks.boot {
            BootMethod::Tethered => self.core.boot(boot_args)?,
            BootMethod::FlashAndReboot => self.core.flash_boot_and_reboot()?,
        }
        if self.quirks.bridge_after_boot && self.is_android() {
            self.core.wait_for_bridge()?;
        }
        Ok(())
    }

    fn erase_boot_partition(&mut self) -> Result<()> {
        if self.quirks.erase_boot {
            self.core.erase_boot_partition()
        } else {
            debug!("{} does not need the boot partition erased", self.board);
            Ok(())
        }
    }

    fn finalize(&mut self, session: &mut SessionHandle) -> Result<()> {
        self.core.finalize(session)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
const BASE: SerialQuirks = SerialQuirks {
    kernel_deploy: true,
    erase_boot: true,
    bridge_on_connect: true,
    bridge_after_boot: false,
    settle_after_enter: false,
    boot: BootMethod::Tethered,
};

#[cfg(test)]
fn serial_driver(
    rig: &crate::testing::TestRig,
    quirks: SerialQuirks,
    device: crate::settings::DeviceConfigBuilder,
) -> SerialDriver {
    use crate::settings::{RunConfig, TargetType};
    use std::sync::Arc;

    let run = RunConfig::new(TargetType::Android, rig.scratch_dir());
    let core = DriverCore::new(Arc::new(device.finalize()), run, rig.services());
    SerialDriver::new("fastboot_serial", quirks, core)
}

#[test]
fn connect_needs_a_connection_command() {
    let rig = crate::testing::TestRig::new();
    let mut driver = serial_driver(&rig, BASE, rig.device());

    assert!(matches!(
        driver.connect(),
        Err(Error::MissingConnectionCommand)
    ));
    assert!(rig.serial.commands().is_empty());
    assert!(rig.runner.commands().is_empty());
}

#[test]
fn connect_waits_for_android() {
    let rig = crate::testing::TestRig::new();
    let device = rig.device().connection_command("telnet localhost 7001");
    let mut driver = serial_driver(&rig, BASE, device);

    let session = driver.connect().unwrap();
    assert_eq!(session.command(), "telnet localhost 7001");
    assert_eq!(rig.runner.commands(), vec!["adb wait-for-device"]);
}

#[test]
fn console_shutdown_failure_keeps_the_bridge_error() {
    use crate::error::ErrorKind;
    use nix::{sys::wait::waitpid, unistd::Pid};
    use std::process::Command;

    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("wait-for-device");
    // Reaped behind the handle's back: shutting it down fails.
    let child = Command::new("true").spawn().unwrap();
    waitpid(Pid::from_raw(child.id() as i32), None).unwrap();
    rig.serial.hand_out(SessionHandle::new("telnet localhost 7001", child));
    let device = rig.device().connection_command("telnet localhost 7001");
    let mut driver = serial_driver(&rig, BASE, device);

    let err = driver.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(rig.serial.commands(), vec!["telnet localhost 7001"]);
}

#[test]
fn connect_without_bridge_wait() {
    let rig = crate::testing::TestRig::new();
    let device = rig.device().connection_command("telnet localhost 7001");
    let quirks = SerialQuirks {
        bridge_on_connect: false,
        ..BASE
    };
    let mut driver = serial_driver(&rig, quirks, device);

    driver.connect().unwrap();
    assert!(rig.runner.commands().is_empty());
}

#[test]
fn boot_erase_can_be_skipped() {
    let rig = crate::testing::TestRig::new();
    let quirks = SerialQuirks {
        erase_boot: false,
        kernel_deploy: false,
        boot: BootMethod::FlashAndReboot,
        bridge_after_boot: true,
        ..BASE
    };
    let mut driver = serial_driver(&rig, quirks, rig.device());

    driver
        .deploy_os_image(&OsImageArtifacts {
            boot: Some("http://images/boot.img".into()),
            ..OsImageArtifacts::default()
        })
        .unwrap();
    driver.boot("").unwrap();

    assert_eq!(
        rig.runner.commands(),
        vec![
            format!("fastboot flash boot {}", rig.scratch_dir().join("boot.img").display()),
            "fastboot reboot".to_string(),
            "adb wait-for-device".to_string(),
        ]
    );
}

#[test]
fn rejected_kernel_deploy_touches_nothing() {
    let rig = crate::testing::TestRig::new();
    let quirks = SerialQuirks {
        kernel_deploy: false,
        ..BASE
    };
    let mut driver = serial_driver(&rig, quirks, rig.device());

    let err = driver
        .deploy_kernel(&KernelArtifacts {
            kernel: Some("http://images/zImage".into()),
            ramdisk: Some("http://images/initrd.cpio.gz".into()),
            ..KernelArtifacts::default()
        })
        .unwrap_err();

    assert!(matches!(err, Error::Unsupported { .. }));
    assert!(rig.runner.commands().is_empty());
    assert!(rig.downloader.urls().is_empty());
}

#[test]
fn kernel_boot_through_the_base_path() {
    let rig = crate::testing::TestRig::new();
    let device = rig.device().kernel_load_addr("0x10008000");
    let mut driver = serial_driver(&rig, BASE, device);

    driver
        .deploy_kernel(&KernelArtifacts {
            kernel: Some("http://images/Image".into()),
            ..KernelArtifacts::default()
        })
        .unwrap();
    driver.boot("console=ttyAMA0").unwrap();

    assert_eq!(
        rig.runner.commands(),
        vec![format!(
            "fastboot boot -c 'console=ttyAMA0' -b 0x10008000 {}",
            rig.scratch_dir().join("Image").display()
        )]
    );
}
