//! Typed wrapper around the flashing tool (`fastboot`).
//!
//! Every invocation goes through a [`LockedRunner`], so flashing operations
//! from concurrent runs on the same host are strictly serialized, and is
//! killed once its timeout expires (600s by default, much shorter for the
//! liveness probe).

use std::{path::Path, sync::Arc, time::Duration};

use log::{debug, error, info, warn};

use crate::{
    adb::AdbClient,
    error::Result,
    services::{CommandRunner, CommandStatus, FlashLock, LockedRunner},
    settings::{DeviceConfig, PartitionRole},
    utils::{quote, quote_always, settle},
};

// =============================================================================
// Public Interface
// =============================================================================

/// How forcefully a device is pushed into flash mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResetMethod {
    /// Ask the running OS to reboot into the bootloader over the bridge,
    /// falling back to a hard reset when the bridge command fails.
    Soft,
    /// Power cycle the board with the configured hard reset command.
    Hard,
}
impl ResetMethod {
    /// The method to use after this one failed.
    pub fn escalate(self) -> Self {
        ResetMethod::Hard
    }
}

/// What a reset attempt actually did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnterOutcome {
    SoftReset,
    HardReset,
    /// No hard reset command is configured; someone has to reset the device
    /// by hand.
    ManualInterventionRequired,
}

#[derive(Clone)]
pub struct FastbootClient {
    device: Arc<DeviceConfig>,
    runner: Arc<dyn CommandRunner>,
    locked: LockedRunner,
    bridge: AdbClient,
}
impl FastbootClient {
    /// `runner` executes the commands; flashing tool invocations are wrapped
    /// with the device's lock file, the hard reset command is not.
    pub fn new(device: Arc<DeviceConfig>, runner: Arc<dyn CommandRunner>, bridge: AdbClient) -> Self {
        let locked = LockedRunner::new(runner.clone(), FlashLock::new(device.lock_file.clone()));
        FastbootClient {
            device,
            runner,
            locked,
            bridge,
        }
    }

    /// Invoke the flashing tool with `args`.
    pub fn call(&self, args: &str, allow_failure: bool, timeout: Duration) -> Result<CommandStatus> {
        let command = format!("{} {}", self.device.fastboot_command, args);
        self.locked.run(&command, allow_failure, timeout)
    }

    /// Invoke the flashing tool with the default timeout, failing on a
    /// non-zero exit.
    pub fn run(&self, args: &str) -> Result<()> {
        self.call(args, false, self.device.flash_timeout).map(|_| ())
    }

    /// Push the device into flash mode, gently first.
    ///
    /// The soft reset asks the running OS to reboot into the bootloader. If
    /// that command fails the device is probably hung and gets hard reset.
    pub fn enter(&self) -> Result<EnterOutcome> {
        match self.bridge.run(&self.device.soft_boot_cmd) {
            Ok(()) => Ok(EnterOutcome::SoftReset),
            Err(e) if e.is_command_failure() => {
                warn!("soft reset failed: {}", e);
                self.hard_reset()
            }
            Err(e) => Err(e),
        }
    }

    /// Power cycle the device with the configured hard reset command.
    pub fn hard_reset(&self) -> Result<EnterOutcome> {
        match &self.device.hard_reset_command {
            Some(command) => {
                debug!("Will hard reset the device");
                self.runner.run(command, false, self.device.flash_timeout)?;
                Ok(EnterOutcome::HardReset)
            }
            None => {
                error!("Hard reset command not configured. Please reset the device manually.");
                Ok(EnterOutcome::ManualInterventionRequired)
            }
        }
    }

    /// `true` when the device answers in flash mode.
    pub fn probe(&self) -> bool {
        settle(
            self.device.settle_delay,
            "Waiting for the connection to settle",
        );
        match self.call("getvar all", false, self.device.probe_timeout) {
            Ok(_) => true,
            Err(e) => {
                debug!("flash mode probe failed: {}", e);
                false
            }
        }
    }

    pub fn erase(&self, role: PartitionRole) -> Result<()> {
        let partition = self.device.partitions.get(role)?;
        info!("erasing {} ({})", partition, role);
        self.run(&format!("erase {}", partition))
    }

    pub fn flash(&self, role: PartitionRole, image: &Path) -> Result<()> {
        let partition = self.device.partitions.get(role)?;
        info!("flashing {} to {} ({})", image.display(), partition, role);
        self.run(&format!(
            "flash {} {}",
            partition,
            quote(&image.to_string_lossy())
        ))
    }

    pub fn reboot(&self) -> Result<()> {
        self.run("reboot")
    }

    /// Boot `image` without flashing it.
    ///
    /// Reboots into the bootloader first and gives it time to settle; some
    /// boards booted straight away end up in charging mode.
    pub fn boot_partition(&self, image: &Path) -> Result<()> {
        self.reboot()?;
        settle(self.device.settle_delay, "Waiting for the bootloader");
        self.run(&format!("boot {}", quote(&image.to_string_lossy())))
    }

    /// Boot a kernel (and optional ramdisk) loaded at `load_addr`.
    pub fn boot_kernel(
        &self,
        boot_args: &str,
        load_addr: &str,
        kernel: &Path,
        ramdisk: Option<&Path>,
    ) -> Result<()> {
        let mut args = format!(
            "boot -c {} -b {} {}",
            quote_always(boot_args),
            load_addr,
            quote(&kernel.to_string_lossy())
        );
        if let Some(ramdisk) = ramdisk {
            args.push(' ');
            args.push_str(&quote(&ramdisk.to_string_lossy()));
        }
        self.run(&args)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn client(rig: &crate::testing::TestRig, device: DeviceConfig) -> FastbootClient {
    let device = Arc::new(device);
    let bridge = AdbClient::new(device.clone(), rig.runner.clone());
    FastbootClient::new(device, rig.runner.clone(), bridge)
}

#[test]
fn soft_reset_goes_through_the_bridge() {
    let rig = crate::testing::TestRig::new();
    let fastboot = client(&rig, rig.device().hard_reset_command("pdu reboot 4").finalize());

    assert_eq!(fastboot.enter().unwrap(), EnterOutcome::SoftReset);
    assert_eq!(rig.runner.commands(), vec!["adb reboot bootloader"]);
}

#[test]
fn failed_soft_reset_falls_back_to_one_hard_reset() {
    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("reboot bootloader");
    let fastboot = client(&rig, rig.device().hard_reset_command("pdu reboot 4").finalize());

    assert_eq!(fastboot.enter().unwrap(), EnterOutcome::HardReset);
    assert_eq!(rig.runner.count("pdu reboot 4"), 1);
}

#[test]
fn missing_hard_reset_needs_manual_intervention() {
    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("reboot bootloader");
    let fastboot = client(&rig, rig.device().finalize());

    assert_eq!(
        fastboot.enter().unwrap(),
        EnterOutcome::ManualInterventionRequired
    );
    assert_eq!(rig.runner.commands(), vec!["adb reboot bootloader"]);
}

#[test]
fn probe_reports_instead_of_failing() {
    let rig = crate::testing::TestRig::new();
    let fastboot = client(&rig, rig.device().finalize());
    assert!(fastboot.probe());

    rig.runner.fail_on("getvar");
    assert!(!fastboot.probe());
    assert_eq!(rig.runner.count("fastboot getvar all"), 2);
}

#[test]
fn partitions_are_mapped() {
    let rig = crate::testing::TestRig::new();
    let device = rig
        .device()
        .partition(PartitionRole::Rootfs, "mmcblk0p9")
        .finalize();
    let fastboot = client(&rig, device);

    fastboot.erase(PartitionRole::Boot).unwrap();
    fastboot
        .flash(PartitionRole::Rootfs, Path::new("/w/rootfs.img"))
        .unwrap();
    assert_eq!(
        rig.runner.commands(),
        vec!["fastboot erase boot", "fastboot flash mmcblk0p9 /w/rootfs.img"]
    );
}

#[test]
fn unmapped_partition_runs_nothing() {
    use crate::{error::Error, settings::PartitionMap};

    let rig = crate::testing::TestRig::new();
    let fastboot = client(&rig, rig.device().partitions(PartitionMap::empty()).finalize());

    assert!(matches!(
        fastboot.erase(PartitionRole::Boot),
        Err(Error::UnmappedPartition(PartitionRole::Boot))
    ));
    assert!(rig.runner.commands().is_empty());
}

#[test]
fn partition_boot_reboots_first() {
    let rig = crate::testing::TestRig::new();
    let fastboot = client(&rig, rig.device().finalize());

    fastboot.boot_partition(Path::new("/w/boot.img")).unwrap();
    assert_eq!(
        rig.runner.commands(),
        vec!["fastboot reboot", "fastboot boot /w/boot.img"]
    );
}

#[test]
fn kernel_boot_command_line() {
    let rig = crate::testing::TestRig::new();
    let fastboot = client(&rig, rig.device().finalize());

    fastboot
        .boot_kernel(
            "console=ttyS0 root=/dev/ram0",
            "0x80208000",
            Path::new("/w/zImage"),
            Some(Path::new("/w/ramdisk.cpio.gz")),
        )
        .unwrap();
    fastboot
        .boot_kernel("", "0x80208000", Path::new("/w/zImage"), None)
        .unwrap();
    assert_eq!(
        rig.runner.commands(),
        vec![
            "fastboot boot -c 'console=ttyS0 root=/dev/ram0' -b 0x80208000 /w/zImage /w/ramdisk.cpio.gz",
            "fastboot boot -c '' -b 0x80208000 /w/zImage",
        ]
    );
}
