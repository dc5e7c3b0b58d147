//! Flashboot deploys software to physical test devices (Android phones and
//! embedded boards) and boots them, for use by an automated hardware test
//! lab.
//!
//! A run takes a device through its whole lifecycle: reset it into flash
//! mode (asking politely over the debug bridge first, power cycling it when
//! it does not answer), flash partitions or stage a kernel and ramdisk, boot
//! the device and finally hand back a live session to it, either an
//! `adb shell` or the board's serial console.
//!
//! The `fastboot` and `adb` host tools do the actual talking to the device.
//! Flashboot wraps every invocation with a hard timeout and serializes all
//! `fastboot` invocations on the host behind a lock file, since concurrent
//! invocations address devices by USB enumeration order and corrupt each
//! other.
//!
//! Boards differ in how they boot and connect. Each supported board is
//! described in a registry and driven by a [`BoardDriver`] of its family;
//! see [`available_boards`].
//!
//! The run lifecycle is implemented as a state machine, in terms of
//! **states** and **transitions** between them with the following
//! characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * Some parameters are shared between **all** states.
//! * Transitions between states are triggered via typed **events** and follow
//!   defined semantics.
//! * Transitioning from one state to another consumes the original state.
//!   Any transition back to that state creates a new state.
//! * Data is transferred from one state to the next by attaching it to the
//!   transition event.
//!
//! Transitions use `rust`'s `From` and `Into` pattern to convert `events`
//! into new `states`. Only transitions for which the `From` trait is
//! implemented are authorized; anything else is a compile-time error.

mod adb;
mod dispatch;
mod driver;
mod error;
mod fastboot;
mod services;
mod settings;
mod utils;

#[cfg(test)]
mod testing;

pub use adb::AdbClient;
pub use dispatch::{dispatch, Deployment};
pub use driver::{
    available_boards, open_driver, BoardDriver, BoardInfo, BootMethod, BootTarget, BridgeDriver,
    BridgeQuirks, DriverCore, KernelArtifacts, OsImageArtifacts, SerialDriver, SerialQuirks,
};
pub use error::{Error, ErrorKind, Result};
pub use fastboot::{EnterOutcome, FastbootClient, ResetMethod};
pub use services::{
    CommandRunner, CommandStatus, CpioRamdisk, Downloader, FlashLock, LockedRunner, RamdiskTool,
    ResultLog, ResultRecorder, ResultStatus, SerialConnector, Services, SessionHandle, SessionIo,
    ShellDownloader, ShellRunner, ShellSerial,
};
pub use settings::{
    BootProfile, DeviceConfig, DeviceConfigBuilder, PartitionMap, PartitionRole, RunConfig,
    TargetType,
};
