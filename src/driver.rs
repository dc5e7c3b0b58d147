//! Board drivers.
//!
//! Every supported board family implements [`BoardDriver`]. The behavior
//! shared by all boards lives in [`DriverCore`]; a family implementation
//! owns a core and delegates to it explicitly, deviating only where the
//! family needs to. Two families exist:
//!
//!  * [`BridgeDriver`]: boards controlled entirely over the debug bridge,
//!    Android only,
//!  * [`SerialDriver`]: boards with a serial console, optionally also
//!    reachable over the debug bridge once Android is up.
//!
//! Use [`open_driver`] to get the driver for a configured board.

mod base;
mod bridge;
mod registry;
mod serial;

use std::path::PathBuf;

use crate::{
    error::Result,
    fastboot::{EnterOutcome, ResetMethod},
    services::SessionHandle,
};

pub use base::DriverCore;
pub use bridge::{BridgeDriver, BridgeQuirks};
pub use registry::{available_boards, open_driver, BoardInfo};
pub use serial::{SerialDriver, SerialQuirks};

// =============================================================================
// Public Interface
// =============================================================================

/// Artifacts of a kernel deployment, as URLs or local paths. Only the
/// kernel is mandatory.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct KernelArtifacts {
    pub kernel: Option<String>,
    pub ramdisk: Option<String>,
    /// Modules tarball, unpacked into the ramdisk. Ignored without a
    /// ramdisk.
    pub modules: Option<String>,
    pub rootfs: Option<String>,
}

/// Artifacts of an operating system image deployment, as URLs or local
/// paths. Only the boot image is mandatory.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct OsImageArtifacts {
    pub boot: Option<String>,
    pub system: Option<String>,
    pub userdata: Option<String>,
}

/// What the device boots once the deployment is done.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BootTarget {
    /// Boot a kernel, and optionally a ramdisk, loaded straight into memory.
    Kernel {
        kernel: PathBuf,
        ramdisk: Option<PathBuf>,
    },
    /// Boot an Android boot image.
    Image(PathBuf),
}

/// How a board boots an Android boot image.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BootMethod {
    /// Send the image over USB and boot it without flashing it.
    Tethered,
    /// Flash the image to the boot partition and reboot.
    FlashAndReboot,
}

/// The capabilities of a board driver.
///
/// A driver is created for a single run and dropped at its end.
pub trait BoardDriver {
    /// Board family name, as used in the device configuration.
    fn board(&self) -> &'static str;

    fn core(&self) -> &DriverCore;

    fn core_mut(&mut self) -> &mut DriverCore;

    /// Bring up the connection to the booted device and return the live
    /// session.
    fn connect(&mut self) -> Result<SessionHandle>;

    /// Reset the device into flash mode using `method`.
    fn enter_flash_mode(&mut self, method: ResetMethod) -> Result<EnterOutcome>;

    /// `true` when the device answers in flash mode.
    fn in_flash_mode(&mut self) -> bool;

    fn deploy_kernel(&mut self, artifacts: &KernelArtifacts) -> Result<()>;

    fn deploy_os_image(&mut self, artifacts: &OsImageArtifacts) -> Result<()>;

    /// Boot the deployed artifacts with `boot_args` as kernel command line.
    fn boot(&mut self, boot_args: &str) -> Result<()>;

    fn erase_boot_partition(&mut self) -> Result<()>;

    /// Forcibly terminate a session returned by [`connect`](Self::connect).
    fn finalize(&mut self, session: &mut SessionHandle) -> Result<()>;
}
