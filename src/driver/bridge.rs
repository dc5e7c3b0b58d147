//! Boards controlled entirely over the debug bridge.
//!
//! These boards only run Android: kernel deployments are rejected and the
//! connection is an `adb shell`.

use log::info;

use super::{BoardDriver, BootMethod, DriverCore, KernelArtifacts, OsImageArtifacts};
use crate::{
    error::{Error, Result},
    fastboot::{EnterOutcome, ResetMethod},
    services::SessionHandle,
};

/// Where the boards of the bridge family differ from each other.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BridgeQuirks {
    pub boot: BootMethod,
}

pub struct BridgeDriver {
    board: &'static str,
    quirks: BridgeQuirks,
    core: DriverCore,
}
impl BridgeDriver {
    pub fn new(board: &'static str, quirks: BridgeQuirks, core: DriverCore) -> Self {
        BridgeDriver {
            board,
            quirks,
            core,
        }
    }

    pub fn quirks(&self) -> BridgeQuirks {
        self.quirks
    }
}
impl BoardDriver for BridgeDriver {
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
        let target = &self.core.run_config().target_type;
        if !target.is_android() {
            return Err(Error::UnsupportedTarget {
                board: self.board,
                supported: "android",
                requested: target.to_string(),
            });
        }
        self.core.bridge_shell()
    }

    fn enter_flash_mode(&mut self, method: ResetMethod) -> Result<EnterOutcome> {
        self.core.enter(method)
    }

    fn in_flash_mode(&mut self) -> bool {
        self.core.in_flash_mode()
    }

    fn deploy_kernel(&mut self, _artifacts: &KernelArtifacts) -> Result<()> {
        Err(Error::Unsupported {
            board: self.board,
            operation: "kernel deployment",
        })
    }

    fn deploy_os_image(&mut self, artifacts: &OsImageArtifacts) -> Result<()> {
        self.core.check_os_image(artifacts)?;
        self.erase_boot_partition()?;
        self.core.deploy_os_image(artifacts)
    }

    fn boot(&mut self, boot_args: &str) -> Result<()> {
        match self.quirks.boot {
            BootMethod::Tethered => self.core.boot(boot_args),
            BootMethod::FlashAndReboot => {
                info!("flashing the boot image before rebooting");
                self.core.flash_boot_and_reboot()
            }
        }
    }

    fn erase_boot_partition(&mut self) -> Result<()> {
        self.core.erase_boot_partition()
    }

    fn finalize(&mut self, session: &mut SessionHandle) -> Result<()> {
        self.core.finalize(session)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn bridge_driver(
    rig: &crate::testing::TestRig,
    boot: BootMethod,
    target: crate::settings::TargetType,
) -> BridgeDriver {
    use crate::settings::RunConfig;
    use std::sync::Arc;

    let device = Arc::new(rig.device().board("nexus10").finalize());
    let core = DriverCore::new(device, RunConfig::new(target, rig.scratch_dir()), rig.services());
    BridgeDriver::new("nexus10", BridgeQuirks { boot }, core)
}

#[test]
fn kernel_deploy_is_rejected_untouched() {
    use crate::{error::ErrorKind, settings::TargetType};

    let rig = crate::testing::TestRig::new();
    let mut driver = bridge_driver(&rig, BootMethod::FlashAndReboot, TargetType::Android);

    let err = driver
        .deploy_kernel(&KernelArtifacts {
            kernel: Some("http://images/zImage".into()),
            ..KernelArtifacts::default()
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(rig.runner.commands().is_empty());
    assert!(rig.downloader.urls().is_empty());
}

#[test]
fn os_image_deploy_erases_boot_first() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let mut driver = bridge_driver(&rig, BootMethod::FlashAndReboot, TargetType::Android);

    driver
        .deploy_os_image(&OsImageArtifacts {
            boot: Some("http://images/img1".into()),
            system: Some("http://images/img2".into()),
            userdata: None,
        })
        .unwrap();
    driver.boot("").unwrap();

    let scratch = rig.scratch_dir();
    assert_eq!(
        rig.runner.commands(),
        vec![
            "fastboot erase boot".to_string(),
            format!("fastboot flash system {}", scratch.join("img2").display()),
            format!("fastboot flash boot {}", scratch.join("img1").display()),
            "fastboot reboot".to_string(),
        ]
    );
}

#[test]
fn missing_boot_image_erases_nothing() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let mut driver = bridge_driver(&rig, BootMethod::Tethered, TargetType::Android);

    let err = driver
        .deploy_os_image(&OsImageArtifacts {
            system: Some("http://images/system.img".into()),
            ..OsImageArtifacts::default()
        })
        .unwrap_err();

    assert!(matches!(err, Error::MissingArtifact("boot")));
    assert!(rig.runner.commands().is_empty());
}

#[test]
fn tethered_boot_sends_the_image() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let mut driver = bridge_driver(&rig, BootMethod::Tethered, TargetType::Android);

    driver
        .deploy_os_image(&OsImageArtifacts {
            boot: Some("http://images/boot.img".into()),
            ..OsImageArtifacts::default()
        })
        .unwrap();
    driver.boot("").unwrap();

    let commands = rig.runner.commands();
    assert_eq!(
        commands[1..],
        [
            "fastboot reboot".to_string(),
            format!("fastboot boot {}", rig.scratch_dir().join("boot.img").display()),
        ]
    );
}

#[test]
fn connect_opens_a_shell() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let mut driver = bridge_driver(&rig, BootMethod::Tethered, TargetType::Android);

    let session = driver.connect().unwrap();
    assert_eq!(session.command(), "adb shell");
    assert_eq!(rig.runner.commands(), vec!["adb wait-for-device", "adb shell"]);
}

#[test]
fn connect_rejects_other_targets() {
    use crate::{error::ErrorKind, settings::TargetType};

    let rig = crate::testing::TestRig::new();
    let mut driver = bridge_driver(&rig, BootMethod::Tethered, TargetType::Other("ubuntu".into()));

    let err = driver.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("ubuntu"));
    assert!(rig.runner.commands().is_empty());
}
