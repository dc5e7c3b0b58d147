//! Behavior shared by every board family.
//!
//! [`DriverCore`] holds the state of a single run (working directory,
//! deployed artifacts, boot profile) together with the flasher and bridge
//! clients. Family drivers call into it for everything they do not do
//! differently.

use std::{
    fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use tempfile::TempDir;

use super::{BootTarget, KernelArtifacts, OsImageArtifacts};
use crate::{
    adb::AdbClient,
    error::{Error, Result},
    fastboot::{EnterOutcome, FastbootClient, ResetMethod},
    services::{Services, SessionHandle},
    settings::{BootProfile, DeviceConfig, PartitionRole, RunConfig},
};

// =============================================================================
// Public Interface
// =============================================================================

pub struct DriverCore {
    device: Arc<DeviceConfig>,
    run: RunConfig,
    services: Services,
    fastboot: FastbootClient,
    adb: AdbClient,
    working_dir: Option<TempDir>,
    boot_target: Option<BootTarget>,
    profile: BootProfile,
}
impl DriverCore {
    pub fn new(device: Arc<DeviceConfig>, run: RunConfig, services: Services) -> Self {
        let adb = AdbClient::new(device.clone(), services.runner.clone());
        let fastboot = FastbootClient::new(device.clone(), services.runner.clone(), adb.clone());
        DriverCore {
            device,
            run,
            services,
            fastboot,
            adb,
            working_dir: None,
            boot_target: None,
            profile: BootProfile::Ramdisk,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn fastboot(&self) -> &FastbootClient {
        &self.fastboot
    }

    pub fn adb(&self) -> &AdbClient {
        &self.adb
    }

    /// What the device will boot, once something was deployed.
    pub fn boot_target(&self) -> Option<&BootTarget> {
        self.boot_target.as_ref()
    }

    pub fn boot_profile(&self) -> BootProfile {
        self.profile
    }

    /// Directory holding the downloads and staging areas of this run.
    ///
    /// With a shared working directory configured, a unique directory is
    /// created inside it on first use and removed when the driver is
    /// dropped. Otherwise the run's scratch directory is used.
    pub fn working_dir(&mut self) -> Result<PathBuf> {
        let shared = match self.device.shared_working_directory() {
            Some(shared) => shared.to_owned(),
            None => {
                fs::create_dir_all(&self.run.scratch_dir)?;
                return Ok(self.run.scratch_dir.clone());
            }
        };
        let dir = match self.working_dir.take() {
            Some(dir) => dir,
            None => {
                fs::create_dir_all(&shared)?;
                let dir = tempfile::Builder::new()
                    .prefix("flashboot-")
                    .tempdir_in(&shared)?;
                debug!("working directory {}", dir.path().display());
                dir
            }
        };
        let path = dir.path().to_owned();
        self.working_dir = Some(dir);
        Ok(path)
    }

    /// Download `url` into the working directory.
    pub fn fetch(&mut self, url: &str, decompress: bool) -> Result<PathBuf> {
        let dir = self.working_dir()?;
        self.services.downloader.fetch(url, &dir, decompress)
    }

    /// Reset the device towards flash mode.
    pub fn enter(&self, method: ResetMethod) -> Result<EnterOutcome> {
        match method {
            ResetMethod::Soft => self.fastboot.enter(),
            ResetMethod::Hard => self.fastboot.hard_reset(),
        }
    }

    pub fn in_flash_mode(&self) -> bool {
        if self.fastboot.probe() {
            debug!("Device is in fastboot mode - no need to hard reset");
            true
        } else {
            false
        }
    }

    /// Download the kernel, the optional ramdisk (with modules injected) and
    /// flash the optional root filesystem. The device then boots the kernel.
    pub fn deploy_kernel(&mut self, artifacts: &KernelArtifacts) -> Result<()> {
        if let Some(BootTarget::Image(_)) = self.boot_target {
            return Err(Error::MixedDeployment {
                previous: "OS image",
            });
        }
        let kernel_url = artifacts
            .kernel
            .as_deref()
            .ok_or(Error::MissingArtifact("kernel"))?;

        let kernel = self.fetch(kernel_url, true)?;
        let ramdisk = match &artifacts.ramdisk {
            Some(url) => Some(self.prepare_ramdisk(url, artifacts.modules.as_deref())?),
            None => None,
        };
        if let Some(url) = &artifacts.rootfs {
            let rootfs = self.fetch(url, true)?;
            self.fastboot.flash(PartitionRole::Rootfs, &rootfs)?;
            self.profile = BootProfile::Rootfs;
        }

        info!("boot target: kernel {}", kernel.display());
        self.boot_target = Some(BootTarget::Kernel { kernel, ramdisk });
        Ok(())
    }

    /// Download the boot image and flash the optional system and userdata
    /// images. The device then boots the boot image.
    ///
    /// Erasing the boot partition is left to the family driver.
    pub fn deploy_os_image(&mut self, artifacts: &OsImageArtifacts) -> Result<()> {
        self.check_os_image(artifacts)?;
        let boot_url = artifacts
            .boot
            .as_deref()
            .ok_or(Error::MissingArtifact("boot"))?;

        let boot = self.fetch(boot_url, true)?;
        if let Some(url) = &artifacts.system {
            let system = self.fetch(url, true)?;
            self.fastboot.flash(PartitionRole::System, &system)?;
        }
        if let Some(url) = &artifacts.userdata {
            let userdata = self.fetch(url, true)?;
            self.fastboot.flash(PartitionRole::Userdata, &userdata)?;
        }

        info!("boot target: {}", boot.display());
        self.boot_target = Some(BootTarget::Image(boot));
        Ok(())
    }

    /// Check that an OS image deployment may start, before anything touches
    /// the device.
    pub fn check_os_image(&self, artifacts: &OsImageArtifacts) -> Result<()> {
        if let Some(BootTarget::Kernel { .. }) = self.boot_target {
            return Err(Error::MixedDeployment { previous: "kernel" });
        }
        match artifacts.boot {
            Some(_) => Ok(()),
            None => Err(Error::MissingArtifact("boot")),
        }
    }

    pub fn erase_boot_partition(&self) -> Result<()> {
        self.fastboot.erase(PartitionRole::Boot)
    }

    /// Boot the deployed artifacts: a kernel directly from memory, or the
    /// boot image without flashing it.
    pub fn boot(&self, boot_args: &str) -> Result<()> {
        match self.boot_target.as_ref().ok_or(Error::DeployRequired)? {
            BootTarget::Kernel { kernel, ramdisk } => {
                let load_addr = self
                    .device
                    .fastboot_kernel_load_addr
                    .as_deref()
                    .ok_or(Error::MissingLoadAddress)?;
                self.fastboot
                    .boot_kernel(boot_args, load_addr, kernel, ramdisk.as_deref())
            }
            BootTarget::Image(image) => self.fastboot.boot_partition(image),
        }
    }

    /// Flash the boot image to the boot partition and reboot into it.
    pub fn flash_boot_and_reboot(&self) -> Result<()> {
        let image = self.boot_image()?;
        self.fastboot.flash(PartitionRole::Boot, image)?;
        self.fastboot.reboot()
    }

    /// The kernel command line for this run: the run override, otherwise the
    /// device's string for the current boot profile, otherwise nothing.
    pub fn boot_args(&self) -> String {
        self.run
            .boot_cmds
            .as_deref()
            .or_else(|| self.device.boot_cmds(self.profile))
            .unwrap_or_default()
            .to_string()
    }

    /// Where the partition playing `role` is mounted on a running Android.
    pub fn mount_point(&self, role: PartitionRole) -> Result<&'static str> {
        match role {
            PartitionRole::Data => Ok("/data"),
            PartitionRole::System => Ok("/system"),
            other => Err(Error::UnmappedPartition(other)),
        }
    }

    /// Work on a local copy of `directory` below the mount point of `role`.
    ///
    /// The remote directory is pulled into a staging directory (it may not
    /// exist yet), `f` gets the staging path, and the staging directory is
    /// pushed back to the device afterwards, also when `f` fails or panics.
    pub fn with_bridge_file_system<T, F>(
        &mut self,
        role: PartitionRole,
        directory: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let mount_point = self.mount_point(role)?;
        let directory = directory.trim_matches('/');
        let host_dir = self.working_dir()?.join("mnt").join(directory);
        let target_dir = format!("{}/{}", mount_point, directory);

        fs::create_dir_all(&host_dir)?;
        self.adb.pull(&target_dir, &host_dir, true)?;

        let result = panic::catch_unwind(AssertUnwindSafe(|| f(&host_dir)));
        let pushed = self.adb.push(&host_dir, &target_dir);
        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                if let Err(push_error) = pushed {
                    warn!("could not push {} back: {}", target_dir, push_error);
                }
                panic::resume_unwind(payload)
            }
        };
        match (result, pushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(push_error)) => {
                warn!("could not push {} back: {}", target_dir, push_error);
                Err(e)
            }
            (Ok(_), Err(push_error)) => Err(push_error),
        }
    }

    pub fn wait_for_bridge(&self) -> Result<()> {
        self.adb.wait_for_device()
    }

    /// Wait for the device and open a bridge shell on it.
    pub fn bridge_shell(&self) -> Result<SessionHandle> {
        self.adb.wait_for_device()?;
        self.adb.shell()
    }

    /// Open the serial console of the board.
    pub fn serial_console(&self) -> Result<SessionHandle> {
        let command = self
            .device
            .connection_command
            .as_deref()
            .ok_or(Error::MissingConnectionCommand)?;
        self.services
            .serial
            .connect(command)
            .map_err(|e| Error::connect("could not open the serial console", Some(e)))
    }

    pub fn finalize(&self, session: &mut SessionHandle) -> Result<()> {
        session.shutdown()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

impl DriverCore {
    /// Download the ramdisk, and unpack it to add `modules` when given.
    ///
    /// The ramdisk stays compressed: the bootloader takes it as is and the
    /// ramdisk tool expects a gzip'ed archive.
    fn prepare_ramdisk(&mut self, url: &str, modules: Option<&str>) -> Result<PathBuf> {
        let ramdisk = self.fetch(url, false)?;
        let modules = match modules {
            Some(modules) => self.fetch(modules, false)?,
            None => return Ok(ramdisk),
        };
        let work_dir = self.working_dir()?;
        let tool = &self.services.ramdisk;
        let extracted = tool.extract(&ramdisk, &work_dir)?;
        tool.inject_modules(&modules, &extracted)?;
        tool.repack(&extracted, &work_dir)
    }

    fn boot_image(&self) -> Result<&Path> {
        match self.boot_target.as_ref().ok_or(Error::DeployRequired)? {
            BootTarget::Image(image) => Ok(image),
            BootTarget::Kernel { .. } => Err(Error::MixedDeployment { previous: "kernel" }),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn driver_core(rig: &crate::testing::TestRig, device: DeviceConfig) -> DriverCore {
    use crate::settings::TargetType;

    let run = RunConfig::new(TargetType::Android, rig.scratch_dir());
    DriverCore::new(Arc::new(device), run, rig.services())
}

#[test]
fn kernel_deploy_requires_a_kernel() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().finalize());

    let err = core.deploy_kernel(&KernelArtifacts::default()).unwrap_err();
    assert!(matches!(err, Error::MissingArtifact("kernel")));
    assert!(rig.downloader.urls().is_empty());
    assert!(core.boot_target().is_none());
}

#[test]
fn modules_are_injected_into_the_booted_ramdisk() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().kernel_load_addr("0x80208000").finalize());

    core.deploy_kernel(&KernelArtifacts {
        kernel: Some("http://images/zImage".into()),
        ramdisk: Some("http://images/initrd.cpio.gz".into()),
        modules: Some("http://images/modules.tgz".into()),
        rootfs: None,
    })
    .unwrap();
    core.boot("console=ttyS0").unwrap();

    let scratch = rig.scratch_dir();
    assert_eq!(
        rig.ramdisk.ops(),
        vec![
            format!("extract {}", scratch.join("initrd.cpio.gz").display()),
            format!(
                "inject {} {}",
                scratch.join("modules.tgz").display(),
                scratch.join("ramdisk").display()
            ),
            format!("repack {}", scratch.join("ramdisk").display()),
        ]
    );
    let boot = rig.runner.commands().pop().unwrap();
    assert!(boot.contains("-b 0x80208000"));
    assert!(boot.ends_with(&format!(
        "{} {}",
        scratch.join("zImage").display(),
        scratch.join("ramdisk.repacked.cpio.gz").display()
    )));
    assert!(!boot.contains("initrd.cpio.gz"));
}

#[test]
fn kernel_boot_without_load_address_runs_nothing() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().finalize());

    core.deploy_kernel(&KernelArtifacts {
        kernel: Some("http://images/zImage".into()),
        ..KernelArtifacts::default()
    })
    .unwrap();
    let err = core.boot("").unwrap_err();

    assert!(matches!(err, Error::MissingLoadAddress));
    assert_eq!(rig.runner.count("fastboot"), 0);
}

#[test]
fn rootfs_switches_the_boot_profile() {
    let rig = crate::testing::TestRig::new();
    let device = rig
        .device()
        .boot_cmds_ramdisk("root=/dev/ram0")
        .boot_cmds_rootfs("root=/dev/mmcblk0p9 rw")
        .finalize();
    let mut core = driver_core(&rig, device);
    assert_eq!(core.boot_args(), "root=/dev/ram0");

    core.deploy_kernel(&KernelArtifacts {
        kernel: Some("http://images/zImage".into()),
        rootfs: Some("http://images/rootfs.img.gz".into()),
        ..KernelArtifacts::default()
    })
    .unwrap();

    assert_eq!(core.boot_profile(), BootProfile::Rootfs);
    assert_eq!(core.boot_args(), "root=/dev/mmcblk0p9 rw");
    assert_eq!(
        rig.runner.commands(),
        vec![format!(
            "fastboot flash userdata {}",
            rig.scratch_dir().join("rootfs.img").display()
        )]
    );
}

#[test]
fn run_boot_cmds_override_the_profiles() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let device = Arc::new(rig.device().boot_cmds_ramdisk("root=/dev/ram0").finalize());
    let run = RunConfig::new(TargetType::Android, rig.scratch_dir()).with_boot_cmds("quiet");
    let core = DriverCore::new(device, run, rig.services());

    assert_eq!(core.boot_args(), "quiet");
}

#[test]
fn os_image_deploy_flashes_what_is_given() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().finalize());

    core.deploy_os_image(&OsImageArtifacts {
        boot: Some("http://images/img1".into()),
        system: Some("http://images/img2".into()),
        userdata: None,
    })
    .unwrap();

    let scratch = rig.scratch_dir();
    assert_eq!(
        rig.runner.commands(),
        vec![format!("fastboot flash system {}", scratch.join("img2").display())]
    );
    assert_eq!(rig.runner.count("userdata"), 0);
    assert_eq!(
        core.boot_target(),
        Some(&BootTarget::Image(scratch.join("img1")))
    );
}

#[test]
fn deployment_kinds_do_not_mix() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().finalize());

    core.deploy_os_image(&OsImageArtifacts {
        boot: Some("http://images/boot.img".into()),
        ..OsImageArtifacts::default()
    })
    .unwrap();
    let err = core
        .deploy_kernel(&KernelArtifacts {
            kernel: Some("http://images/zImage".into()),
            ..KernelArtifacts::default()
        })
        .unwrap_err();

    assert!(matches!(err, Error::MixedDeployment { .. }));
    assert_eq!(rig.downloader.urls(), vec!["http://images/boot.img"]);
}

#[test]
fn boot_before_deploy_fails() {
    let rig = crate::testing::TestRig::new();
    let core = driver_core(&rig, rig.device().finalize());

    assert!(matches!(core.boot(""), Err(Error::DeployRequired)));
    assert!(matches!(
        core.flash_boot_and_reboot(),
        Err(Error::DeployRequired)
    ));
    assert!(rig.runner.commands().is_empty());
}

#[test]
fn shared_working_directory_gets_a_private_subdirectory() {
    let rig = crate::testing::TestRig::new();
    let shared = rig.dir.path().join("shared");
    let mut core = driver_core(&rig, rig.device().shared_working_directory(&shared).finalize());

    let first = core.working_dir().unwrap();
    assert!(first.starts_with(&shared));
    assert_ne!(first, shared);
    assert!(first.is_dir());
    assert_eq!(core.working_dir().unwrap(), first);

    drop(core);
    assert!(!first.exists());
}

#[test]
fn downloads_land_in_the_shared_working_directory() {
    let rig = crate::testing::TestRig::new();
    let shared = rig.dir.path().join("shared");
    let mut core = driver_core(&rig, rig.device().shared_working_directory(&shared).finalize());

    core.deploy_os_image(&OsImageArtifacts {
        boot: Some("http://images/boot.img".into()),
        system: Some("http://images/system.img.gz".into()),
        ..OsImageArtifacts::default()
    })
    .unwrap();

    let working_dir = core.working_dir().unwrap();
    assert!(working_dir.starts_with(&shared));
    assert_eq!(
        rig.downloader.destinations(),
        vec![working_dir.clone(), working_dir]
    );
}

#[test]
fn blank_shared_working_directory_uses_scratch() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().shared_working_directory("  ").finalize());

    assert_eq!(core.working_dir().unwrap(), rig.scratch_dir());
}

#[test]
fn mount_points() {
    let rig = crate::testing::TestRig::new();
    let core = driver_core(&rig, rig.device().finalize());

    assert_eq!(core.mount_point(PartitionRole::Data).unwrap(), "/data");
    assert_eq!(core.mount_point(PartitionRole::System).unwrap(), "/system");
    assert!(matches!(
        core.mount_point(PartitionRole::Boot),
        Err(Error::UnmappedPartition(PartitionRole::Boot))
    ));
}

#[test]
fn bridge_file_system_round_trip() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().finalize());

    let staged = core
        .with_bridge_file_system(PartitionRole::Data, "local/tmp", |dir| {
            fs::write(dir.join("result.txt"), "ok")?;
            Ok(dir.to_owned())
        })
        .unwrap();

    assert_eq!(staged, rig.scratch_dir().join("mnt/local/tmp"));
    assert!(staged.join("result.txt").is_file());
    assert_eq!(
        rig.runner.commands(),
        vec![
            format!("adb pull /data/local/tmp {}", staged.display()),
            format!("adb push {} /data/local/tmp", staged.display()),
        ]
    );
}

#[test]
fn bridge_file_system_pushes_back_on_failure() {
    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("pull");
    let mut core = driver_core(&rig, rig.device().finalize());

    let result: Result<()> = core.with_bridge_file_system(PartitionRole::System, "etc", |dir| {
        fs::write(dir.join("hosts"), "127.0.0.1 localhost")?;
        Err(Error::MissingArtifact("hosts"))
    });

    assert!(matches!(result, Err(Error::MissingArtifact("hosts"))));
    assert_eq!(rig.runner.count("adb push"), 1);
    assert!(rig.runner.commands()[1].ends_with(" /system/etc"));
}

#[test]
fn bridge_file_system_pushes_back_on_panic() {
    let rig = crate::testing::TestRig::new();
    let mut core = driver_core(&rig, rig.device().finalize());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        core.with_bridge_file_system(PartitionRole::Data, "local/tmp", |_| -> Result<()> {
            panic!("test body blew up")
        })
    }));

    assert!(outcome.is_err());
    assert_eq!(
        rig.runner.commands(),
        vec![
            format!(
                "adb pull /data/local/tmp {}",
                rig.scratch_dir().join("mnt/local/tmp").display()
            ),
            format!(
                "adb push {} /data/local/tmp",
                rig.scratch_dir().join("mnt/local/tmp").display()
            ),
        ]
    );
}

#[test]
fn serial_console_requires_a_command() {
    let rig = crate::testing::TestRig::new();
    let core = driver_core(&rig, rig.device().finalize());
    assert!(matches!(
        core.serial_console(),
        Err(Error::MissingConnectionCommand)
    ));

    let core = driver_core(&rig, rig.device().connection_command("telnet localhost 7001").finalize());
    let session = core.serial_console().unwrap();
    assert_eq!(session.command(), "telnet localhost 7001");
    assert_eq!(rig.serial.commands(), vec!["telnet localhost 7001"]);
}
