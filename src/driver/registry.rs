//! Board registry: maps the board name of a device to its driver.

use std::sync::Arc;

use log::info;

use super::{
    BoardDriver, BootMethod, BridgeDriver, BridgeQuirks, DriverCore, SerialDriver, SerialQuirks,
};
use crate::{
    error::{Error, Result},
    services::Services,
    settings::{DeviceConfig, RunConfig},
};

/// A supported board.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BoardInfo {
    pub name: &'static str,
    /// `bridge` or `serial`.
    pub family: &'static str,
    pub description: &'static str,
}

/// Every board a driver can be opened for.
pub fn available_boards() -> Vec<BoardInfo> {
    BOARDS
        .iter()
        .map(|board| BoardInfo {
            name: board.name,
            family: match board.quirks {
                Quirks::Bridge(_) => "bridge",
                Quirks::Serial(_) => "serial",
            },
            description: board.description,
        })
        .collect()
}

/// Create the driver for the board configured in `device`, for one run.
pub fn open_driver(
    device: Arc<DeviceConfig>,
    run: RunConfig,
    services: Services,
) -> Result<Box<dyn BoardDriver>> {
    let board = BOARDS
        .iter()
        .find(|board| board.name == device.board.trim())
        .ok_or_else(|| Error::UnknownBoard(device.board.clone()))?;
    info!("opening `{}` driver for a {} run", board.name, run.target_type);

    let core = DriverCore::new(device, run, services);
    Ok(match board.quirks {
        Quirks::Bridge(quirks) => Box::new(BridgeDriver::new(board.name, quirks, core)),
        Quirks::Serial(quirks) => Box::new(SerialDriver::new(board.name, quirks, core)),
    })
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Copy, Clone)]
enum Quirks {
    Bridge(BridgeQuirks),
    Serial(SerialQuirks),
}

struct Board {
    name: &'static str,
    description: &'static str,
    quirks: Quirks,
}

const BOARDS: &[Board] = &[
    Board {
        name: "fastboot",
        description: "Generic Android device, boot image sent over USB",
        quirks: Quirks::Bridge(BridgeQuirks {
            boot: BootMethod::Tethered,
        }),
    },
    Board {
        name: "nexus10",
        description: "Nexus 10, boot image flashed then rebooted",
        quirks: Quirks::Bridge(BridgeQuirks {
            boot: BootMethod::FlashAndReboot,
        }),
    },
    Board {
        name: "fastboot_serial",
        description: "Generic board with a serial console, kernel or Android",
        quirks: Quirks::Serial(SerialQuirks {
            kernel_deploy: true,
            erase_boot: true,
            bridge_on_connect: true,
            bridge_after_boot: false,
            settle_after_enter: false,
            boot: BootMethod::Tethered,
        }),
    },
    Board {
        name: "capri",
        description: "Broadcom Capri, Android only",
        quirks: Quirks::Serial(SerialQuirks {
            kernel_deploy: false,
            erase_boot: false,
            bridge_on_connect: true,
            bridge_after_boot: false,
            settle_after_enter: false,
            boot: BootMethod::FlashAndReboot,
        }),
    },
    Board {
        name: "pxa1928dkb",
        description: "Marvell PXA1928 DKB, Android only",
        quirks: Quirks::Serial(SerialQuirks {
            kernel_deploy: false,
            erase_boot: false,
            bridge_on_connect: false,
            bridge_after_boot: true,
            settle_after_enter: false,
            boot: BootMethod::FlashAndReboot,
        }),
    },
    Board {
        name: "k3v2",
        description: "HiSilicon K3V2, Android only",
        quirks: Quirks::Serial(SerialQuirks {
            kernel_deploy: false,
            erase_boot: true,
            bridge_on_connect: true,
            bridge_after_boot: false,
            settle_after_enter: true,
            boot: BootMethod::FlashAndReboot,
        }),
    },
];

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn every_board_opens() {
    use crate::{settings::TargetType, testing::TestRig};

    let rig = TestRig::new();
    for info in available_boards() {
        let device = Arc::new(rig.device().board(info.name).finalize());
        let run = RunConfig::new(TargetType::Android, rig.scratch_dir());
        let driver = open_driver(device, run, rig.services()).unwrap();
        assert_eq!(driver.board(), info.name);
    }
    assert_eq!(available_boards().len(), 6);
}

#[test]
fn unknown_board() {
    use crate::{settings::TargetType, testing::TestRig};

    let rig = TestRig::new();
    let device = Arc::new(rig.device().board("beaglebone").finalize());
    let run = RunConfig::new(TargetType::Android, rig.scratch_dir());

    match open_driver(device, run, rig.services()) {
        Err(Error::UnknownBoard(board)) => assert_eq!(board, "beaglebone"),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("opened a driver for an unknown board"),
    }
}

#[test]
fn only_fastboot_serial_deploys_kernels() {
    use crate::{
        driver::KernelArtifacts, error::ErrorKind, settings::TargetType, testing::TestRig,
    };

    for info in available_boards() {
        let rig = TestRig::new();
        let device = Arc::new(rig.device().board(info.name).finalize());
        let run = RunConfig::new(TargetType::Other("linux".into()), rig.scratch_dir());
        let mut driver = open_driver(device, run, rig.services()).unwrap();

        let result = driver.deploy_kernel(&KernelArtifacts {
            kernel: Some("http://images/zImage".into()),
            ..KernelArtifacts::default()
        });
        if info.name == "fastboot_serial" {
            assert!(result.is_ok());
        } else {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Unsupported);
            assert!(rig.runner.commands().is_empty());
        }
    }
}

#[test]
fn boards_without_boot_erase() {
    use crate::{driver::OsImageArtifacts, settings::TargetType, testing::TestRig};

    for info in available_boards() {
        let rig = TestRig::new();
        let device = Arc::new(rig.device().board(info.name).finalize());
        let run = RunConfig::new(TargetType::Android, rig.scratch_dir());
        let mut driver = open_driver(device, run, rig.services()).unwrap();

        driver
            .deploy_os_image(&OsImageArtifacts {
                boot: Some("http://images/boot.img".into()),
                ..OsImageArtifacts::default()
            })
            .unwrap();
        let erased = rig.runner.count("fastboot erase boot") == 1;
        assert_eq!(erased, !matches!(info.name, "capri" | "pxa1928dkb"));
    }
}

#[test]
fn k3v2_settles_after_entering_flash_mode() {
    use crate::{fastboot::ResetMethod, settings::TargetType, testing::TestRig};
    use std::time::{Duration, Instant};

    let delay = Duration::from_millis(200);
    for &(board, settles) in &[("k3v2", true), ("fastboot_serial", false)] {
        let rig = TestRig::new();
        let device = Arc::new(rig.device().board(board).settle_delay(delay).finalize());
        let run = RunConfig::new(TargetType::Android, rig.scratch_dir());
        let mut driver = open_driver(device, run, rig.services()).unwrap();

        let start = Instant::now();
        driver.enter_flash_mode(ResetMethod::Soft).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(elapsed >= delay, settles, "{} took {:?}", board, elapsed);
        assert_eq!(rig.runner.commands(), vec!["adb reboot bootloader"]);
    }
}
