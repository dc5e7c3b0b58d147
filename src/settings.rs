//! Settings related to the device under test and to a single deploy/boot run.
//!
//! The device configuration is read once when the dispatcher starts and is
//! shared, read-only, by every run on that device. Use the
//! [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values, or load them from a TOML device
//! file with [`DeviceConfig::load`].
//!
//! **Example** - A device file:
//! ```toml
//! board = "nexus10"
//! fastboot_command = "fastboot -s R32D102YBDF"
//! adb_command = "adb -s R32D102YBDF"
//! hard_reset_command = "pduclient --hostname pdu01 --port 4 --command reboot"
//! fastboot_kernel_load_addr = "0x80208000"
//!
//! [partitions]
//! rootfs = "userdata"
//! ```

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

// Partitions ==================================================================

/// Logical role of a device partition. Each board maps roles to its own
/// physical partition names through a [`PartitionMap`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PartitionRole {
    Boot,
    System,
    Userdata,
    Rootfs,
    Data,
}
impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionRole::Boot => "boot",
            PartitionRole::System => "system",
            PartitionRole::Userdata => "userdata",
            PartitionRole::Rootfs => "rootfs",
            PartitionRole::Data => "data",
        };
        f.write_str(name)
    }
}

/// Immutable mapping from [`PartitionRole`] to physical partition name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartitionMap {
    names: BTreeMap<PartitionRole, String>,
}
impl PartitionMap {
    /// A map with no role mapped at all.
    pub fn empty() -> Self {
        PartitionMap {
            names: BTreeMap::new(),
        }
    }

    /// Returns a copy of this map with `role` mapped to `name`.
    pub fn with(mut self, role: PartitionRole, name: impl Into<String>) -> Self {
        self.names.insert(role, name.into());
        self
    }

    /// The physical partition name for `role`.
    pub fn get(&self, role: PartitionRole) -> Result<&str> {
        self.names
            .get(&role)
            .map(String::as_str)
            .ok_or(Error::UnmappedPartition(role))
    }
}
impl Default for PartitionMap {
    /// The Android defaults: the root filesystem and the data role both live
    /// on `userdata`.
    fn default() -> Self {
        PartitionMap::empty()
            .with(PartitionRole::Boot, "boot")
            .with(PartitionRole::System, "system")
            .with(PartitionRole::Userdata, "userdata")
            .with(PartitionRole::Rootfs, "userdata")
            .with(PartitionRole::Data, "userdata")
    }
}

// Boot profiles ===============================================================

/// Which of the device boot command strings applies by default. Switches to
/// `Rootfs` once a root filesystem has been flashed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BootProfile {
    Ramdisk,
    Rootfs,
}

// Device configuration ========================================================

/// Groups all settings of one physical device and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceConfig {
    /// Board family used to select the driver in the registry.
    pub board: String,
    /// Invocation of the flashing tool, including device selection flags.
    pub fastboot_command: String,
    /// Invocation of the debug bridge, including device selection flags.
    pub adb_command: String,
    /// Bridge arguments asking a running device to reboot into flash mode.
    pub soft_boot_cmd: String,
    /// Out-of-band power cycle command. Optional.
    pub hard_reset_command: Option<String>,
    /// Command opening the serial console of the board. Optional.
    pub connection_command: Option<String>,
    /// Load address passed to the flashing tool when booting a kernel
    /// directly. Required for the kernel boot path only.
    pub fastboot_kernel_load_addr: Option<String>,
    pub partitions: PartitionMap,
    /// When set (and not blank), each run gets its own unique working
    /// directory inside it; otherwise the run's scratch directory is used.
    pub shared_working_directory: Option<PathBuf>,
    /// Boot arguments used with a kernel and ramdisk.
    pub boot_cmds_ramdisk: Option<String>,
    /// Boot arguments used once a root filesystem has been flashed.
    pub boot_cmds_rootfs: Option<String>,
    /// Lock file serializing every flashing tool invocation on the host.
    pub lock_file: PathBuf,
    /// Hard timeout of a flashing tool invocation.
    pub flash_timeout: Duration,
    /// Hard timeout of the flash mode liveness probe.
    pub probe_timeout: Duration,
    /// Hard timeout of a debug bridge invocation.
    pub adb_timeout: Duration,
    /// Time given to the USB bus to settle after a reboot.
    pub settle_delay: Duration,
    /// How many times flash mode is attempted, escalating from soft to hard
    /// reset, before giving up.
    pub flash_mode_attempts: u32,

    /// Restrict creation of `DeviceConfig` instances unless through the
    /// `DeviceConfigBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}
impl DeviceConfig {
    /// Read and parse a TOML device file.
    pub fn load(path: impl AsRef<Path>) -> Result<DeviceConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let file: DeviceFile = toml::from_str(&text).map_err(|source| Error::ConfigFile {
            path: path.to_owned(),
            source,
        })?;
        Ok(file.into_config())
    }

    /// Parse a TOML device description.
    pub fn from_toml_str(text: &str) -> Result<DeviceConfig> {
        let file: DeviceFile = toml::from_str(text)?;
        Ok(file.into_config())
    }

    /// The boot arguments configured for `profile`, if any.
    pub fn boot_cmds(&self, profile: BootProfile) -> Option<&str> {
        match profile {
            BootProfile::Ramdisk => self.boot_cmds_ramdisk.as_deref(),
            BootProfile::Rootfs => self.boot_cmds_rootfs.as_deref(),
        }
    }

    /// The shared working directory, ignoring a blank setting.
    pub fn shared_working_directory(&self) -> Option<&Path> {
        self.shared_working_directory
            .as_deref()
            .filter(|dir| !dir.as_os_str().to_string_lossy().trim().is_empty())
    }
}

/// The builder for the `DeviceConfig` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let config = DeviceConfigBuilder::new()
///     .board("capri")
///     .fastboot_command("fastboot -s 0123")
///     .connection_command("telnet localhost 7001")
///     .finalize();
/// ```
pub struct DeviceConfigBuilder {
    config: DeviceConfig,
}
impl DeviceConfigBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        DeviceConfigBuilder {
            config: DeviceConfig {
                board: "fastboot".into(),
                fastboot_command: "fastboot".into(),
                adb_command: "adb".into(),
                soft_boot_cmd: "reboot bootloader".into(),
                hard_reset_command: None,
                connection_command: None,
                fastboot_kernel_load_addr: None,
                partitions: PartitionMap::default(),
                shared_working_directory: None,
                boot_cmds_ramdisk: None,
                boot_cmds_rootfs: None,
                lock_file: PathBuf::from("/var/lock/flashboot-fastboot.lck"),
                flash_timeout: Duration::from_secs(600),
                probe_timeout: Duration::from_secs(2),
                adb_timeout: Duration::from_secs(600),
                settle_delay: Duration::from_secs(10),
                flash_mode_attempts: 2,
                _private_use_builder: (),
            },
        }
    }

    pub fn board(mut self, board: impl Into<String>) -> Self {
        self.config.board = board.into();
        self
    }

    pub fn fastboot_command(mut self, command: impl Into<String>) -> Self {
        self.config.fastboot_command = command.into();
        self
    }

    pub fn adb_command(mut self, command: impl Into<String>) -> Self {
        self.config.adb_command = command.into();
        self
    }

    pub fn soft_boot_cmd(mut self, command: impl Into<String>) -> Self {
        self.config.soft_boot_cmd = command.into();
        self
    }

    /// Set the hard reset command. A blank command leaves it unset.
    pub fn hard_reset_command(mut self, command: impl Into<String>) -> Self {
        self.config.hard_reset_command = non_blank(command.into());
        self
    }

    /// Set the serial console command. A blank command leaves it unset.
    pub fn connection_command(mut self, command: impl Into<String>) -> Self {
        self.config.connection_command = non_blank(command.into());
        self
    }

    pub fn kernel_load_addr(mut self, address: impl Into<String>) -> Self {
        self.config.fastboot_kernel_load_addr = non_blank(address.into());
        self
    }

    pub fn partitions(mut self, partitions: PartitionMap) -> Self {
        self.config.partitions = partitions;
        self
    }

    /// Map a single partition role, keeping the other mappings.
    pub fn partition(mut self, role: PartitionRole, name: impl Into<String>) -> Self {
        self.config.partitions = self.config.partitions.with(role, name);
        self
    }

    pub fn shared_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.shared_working_directory = Some(dir.into());
        self
    }

    pub fn boot_cmds_ramdisk(mut self, args: impl Into<String>) -> Self {
        self.config.boot_cmds_ramdisk = Some(args.into());
        self
    }

    pub fn boot_cmds_rootfs(mut self, args: impl Into<String>) -> Self {
        self.config.boot_cmds_rootfs = Some(args.into());
        self
    }

    pub fn lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.lock_file = path.into();
        self
    }

    pub fn flash_timeout(mut self, timeout: Duration) -> Self {
        self.config.flash_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn adb_timeout(mut self, timeout: Duration) -> Self {
        self.config.adb_timeout = timeout;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    /// Set the number of flash mode attempts. At least one attempt is
    /// always made.
    pub fn flash_mode_attempts(mut self, attempts: u32) -> Self {
        self.config.flash_mode_attempts = attempts.max(1);
        self
    }

    pub fn finalize(self) -> DeviceConfig {
        self.config
    }
}
impl Default for DeviceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Run configuration ===========================================================

/// Operating system family being deployed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TargetType {
    Android,
    Other(String),
}
impl TargetType {
    pub fn is_android(&self) -> bool {
        *self == TargetType::Android
    }
}
impl FromStr for TargetType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "android" => TargetType::Android,
            other => TargetType::Other(other.to_string()),
        })
    }
}
impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Android => f.write_str("android"),
            TargetType::Other(name) => f.write_str(name),
        }
    }
}

/// Everything a single run needs beyond the device configuration. Passed to
/// the driver when it is created and never changed afterwards.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunConfig {
    pub target_type: TargetType,
    pub scratch_dir: PathBuf,
    /// Boot arguments overriding the device boot profiles.
    pub boot_cmds: Option<String>,
}
impl RunConfig {
    pub fn new(target_type: TargetType, scratch_dir: impl Into<PathBuf>) -> Self {
        RunConfig {
            target_type,
            scratch_dir: scratch_dir.into(),
            boot_cmds: None,
        }
    }

    pub fn with_boot_cmds(mut self, boot_cmds: impl Into<String>) -> Self {
        self.boot_cmds = Some(boot_cmds.into());
        self
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// On-disk layout of a device file. Everything except the tool invocations
/// falls back to the builder defaults.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceFile {
    board: Option<String>,
    fastboot_command: String,
    adb_command: String,
    soft_boot_cmd: Option<String>,
    hard_reset_command: Option<String>,
    connection_command: Option<String>,
    fastboot_kernel_load_addr: Option<String>,
    shared_working_directory: Option<PathBuf>,
    boot_cmds_ramdisk: Option<String>,
    boot_cmds_rootfs: Option<String>,
    lock_file: Option<PathBuf>,
    flash_timeout: Option<u64>,
    probe_timeout: Option<u64>,
    adb_timeout: Option<u64>,
    settle_delay: Option<u64>,
    flash_mode_attempts: Option<u32>,
    #[serde(default)]
    partitions: PartitionFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartitionFile {
    boot: Option<String>,
    system: Option<String>,
    userdata: Option<String>,
    rootfs: Option<String>,
    data: Option<String>,
}

impl DeviceFile {
    fn into_config(self) -> DeviceConfig {
        let mut builder = DeviceConfigBuilder::new()
            .fastboot_command(self.fastboot_command)
            .adb_command(self.adb_command);

        if let Some(board) = self.board {
            builder = builder.board(board);
        }
        if let Some(cmd) = self.soft_boot_cmd {
            builder = builder.soft_boot_cmd(cmd);
        }
        if let Some(cmd) = self.hard_reset_command {
            builder = builder.hard_reset_command(cmd);
        }
        if let Some(cmd) = self.connection_command {
            builder = builder.connection_command(cmd);
        }
        if let Some(addr) = self.fastboot_kernel_load_addr {
            builder = builder.kernel_load_addr(addr);
        }
        if let Some(dir) = self.shared_working_directory {
            builder = builder.shared_working_directory(dir);
        }
        if let Some(args) = self.boot_cmds_ramdisk {
            builder = builder.boot_cmds_ramdisk(args);
        }
        if let Some(args) = self.boot_cmds_rootfs {
            builder = builder.boot_cmds_rootfs(args);
        }
        if let Some(path) = self.lock_file {
            builder = builder.lock_file(path);
        }
        if let Some(secs) = self.flash_timeout {
            builder = builder.flash_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.probe_timeout {
            builder = builder.probe_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.adb_timeout {
            builder = builder.adb_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.settle_delay {
            builder = builder.settle_delay(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.flash_mode_attempts {
            builder = builder.flash_mode_attempts(attempts);
        }

        let parts = self.partitions;
        let overrides = [
            (PartitionRole::Boot, parts.boot),
            (PartitionRole::System, parts.system),
            (PartitionRole::Userdata, parts.userdata),
            (PartitionRole::Rootfs, parts.rootfs),
            (PartitionRole::Data, parts.data),
        ];
        for (role, name) in overrides {
            if let Some(name) = name {
                builder = builder.partition(role, name);
            }
        }

        builder.finalize()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let config = DeviceConfigBuilder::new().finalize();
    assert_eq!(config.board, "fastboot");
    assert_eq!(config.soft_boot_cmd, "reboot bootloader");
    assert_eq!(config.hard_reset_command, None);
    assert_eq!(config.flash_timeout, Duration::from_secs(600));
    assert_eq!(config.probe_timeout, Duration::from_secs(2));
    assert_eq!(config.settle_delay, Duration::from_secs(10));
    assert_eq!(config.flash_mode_attempts, 2);
    assert_eq!(config.partitions, PartitionMap::default());
}

#[test]
fn blank_commands_stay_unset() {
    let config = DeviceConfigBuilder::new()
        .hard_reset_command("   ")
        .connection_command("")
        .finalize();
    assert_eq!(config.hard_reset_command, None);
    assert_eq!(config.connection_command, None);
}

#[test]
fn hard_reset_command() {
    let config = DeviceConfigBuilder::new()
        .hard_reset_command("pduclient --port 3 --command reboot")
        .finalize();
    assert_eq!(
        config.hard_reset_command.unwrap(),
        "pduclient --port 3 --command reboot"
    );
}

#[test]
fn flash_mode_attempts_at_least_one() {
    let config = DeviceConfigBuilder::new().flash_mode_attempts(0).finalize();
    assert_eq!(config.flash_mode_attempts, 1);
}

#[test]
fn partition_lookup() {
    let map = PartitionMap::default().with(PartitionRole::Rootfs, "mmcblk0p9");
    assert_eq!(map.get(PartitionRole::Rootfs).unwrap(), "mmcblk0p9");
    assert_eq!(map.get(PartitionRole::Boot).unwrap(), "boot");
    assert!(matches!(
        PartitionMap::empty().get(PartitionRole::Boot),
        Err(Error::UnmappedPartition(PartitionRole::Boot))
    ));
}

#[test]
fn blank_shared_working_directory_is_ignored() {
    let config = DeviceConfigBuilder::new()
        .shared_working_directory(" ")
        .finalize();
    assert_eq!(config.shared_working_directory(), None);
}

#[test]
fn boot_profiles() {
    let config = DeviceConfigBuilder::new()
        .boot_cmds_ramdisk("console=ttyS0")
        .finalize();
    assert_eq!(config.boot_cmds(BootProfile::Ramdisk), Some("console=ttyS0"));
    assert_eq!(config.boot_cmds(BootProfile::Rootfs), None);
}

#[test]
fn target_type_parsing() {
    assert_eq!("Android".parse::<TargetType>().unwrap(), TargetType::Android);
    assert_eq!(
        "ubuntu".parse::<TargetType>().unwrap(),
        TargetType::Other("ubuntu".into())
    );
}

#[test]
fn toml_device_file() {
    let config = DeviceConfig::from_toml_str(
        r#"
        board = "k3v2"
        fastboot_command = "fastboot -s 42"
        adb_command = "adb -s 42"
        connection_command = "telnet localhost 7001"
        fastboot_kernel_load_addr = "0x80208000"
        settle_delay = 0
        flash_mode_attempts = 3

        [partitions]
        rootfs = "mmcblk0p9"
        "#,
    )
    .unwrap();
    assert_eq!(config.board, "k3v2");
    assert_eq!(config.fastboot_command, "fastboot -s 42");
    assert_eq!(config.connection_command.as_deref(), Some("telnet localhost 7001"));
    assert_eq!(config.fastboot_kernel_load_addr.as_deref(), Some("0x80208000"));
    assert_eq!(config.settle_delay, Duration::ZERO);
    assert_eq!(config.flash_mode_attempts, 3);
    assert_eq!(config.partitions.get(PartitionRole::Rootfs).unwrap(), "mmcblk0p9");
    assert_eq!(config.partitions.get(PartitionRole::System).unwrap(), "system");
}

#[test]
fn toml_device_file_requires_tools() {
    let result = DeviceConfig::from_toml_str("board = \"capri\"");
    assert!(matches!(result, Err(Error::ConfigSyntax(_))));
}

#[test]
fn toml_device_file_rejects_unknown_keys() {
    let result = DeviceConfig::from_toml_str(
        "fastboot_command = \"fastboot\"\nadb_command = \"adb\"\nbaud_rate = 115200\n",
    );
    assert!(result.is_err());
}
