//! Deploy and boot lifecycle of a single run.
//!
//! Boards are unreliable: a device may hang and ignore the polite request to
//! reboot into flash mode. Entering flash mode is therefore retried, each
//! retry with more force than the previous one (soft reset first, hard reset
//! after). Every other step either succeeds or fails the run; a failed run
//! is not resumed and partial progress is not rolled back.
//!
//! ```text
//!                 START
//!                   |
//!                   v
//!              .---------.   attempts
//!   .--------->|  Idle   |---- used ----.
//!   |          '---------'      up      |
//!   |               |                   |
//!  retry,           v                   |
//!  escalated  .-------------------.     |
//!  reset  '---| EnteringFlashMode |     |
//!             '-------------------'     |
//!                   |                   |
//!                   v                   v
//!             .-----------.       .----------.
//!             | FlashMode |------>|  Failed  |
//!             '-----------'       '----------'
//!                   | deployed        ^  ^
//!                   v                 |  |
//!             .-----------.           |  |
//!             |  Flashed  |-----------'  |
//!             '-----------'              |
//!                   | booted             |
//!                   v                    |
//!             .-----------.              |
//!             |  Booting  |--------------'
//!             '-----------'
//!                   | connected
//!                   v
//!             .-----------.
//!             | Connected |
//!             '-----------'
//! ```

use log::{error, info};

use super::events::*;
use super::states::*;
use crate::{
    driver::{BoardDriver, KernelArtifacts, OsImageArtifacts},
    error::{Error, ErrorKind, Result},
    fastboot::ResetMethod,
    services::{ResultStatus, SessionHandle},
};

// =============================================================================
// Public Interface
// =============================================================================

/// What a run deploys before booting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Deployment {
    Kernel(KernelArtifacts),
    OsImage(OsImageArtifacts),
}

/// Run the whole lifecycle on `driver`: enter flash mode, deploy, boot and
/// connect. Returns the live session to the device.
///
/// The outcome is recorded as the `boot_image` result. Connection failures
/// are returned as they are, so the caller can treat them separately; any
/// other failure is logged and returned as [`Error::RunAborted`].
pub fn dispatch(driver: &mut dyn BoardDriver, deployment: &Deployment) -> Result<SessionHandle> {
    let results = driver.core().services().results.clone();
    let policy = Policy {
        flash_mode_attempts: driver.core().device().flash_mode_attempts,
    };
    info!("starting a run on `{}`", driver.board());

    let mut ctx = RunContext { driver, deployment };
    match LifecycleStates::Idle(LifecycleSM::new(policy)).run(&mut ctx) {
        Ok(session) => {
            results.add_result("boot_image", ResultStatus::Pass);
            Ok(session)
        }
        Err(e) => {
            results.add_result("boot_image", ResultStatus::Fail);
            if e.kind() == ErrorKind::Connection {
                error!("failed to create the connection: {}", e);
                Err(e)
            } else {
                error!("boot failed: {}", e);
                Err(Error::RunAborted(Box::new(e)))
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

// -----------------------------------------------------------------------------
// The State Machine
// -----------------------------------------------------------------------------

/// The run lifecycle state machine. The generic state type lets shared
/// parameters travel next to the state data.
#[derive(Debug)]
struct LifecycleSM<S> {
    policy: Policy,
    state: S,
}
impl<S: Runnable> LifecycleSM<S> {
    fn run(&mut self, ctx: &mut RunContext<'_>) -> Event {
        self.state.run(&self.policy, ctx)
    }
}

/// The first attempt at entering flash mode is a soft reset.
impl LifecycleSM<IdleState> {
    fn new(policy: Policy) -> Self {
        LifecycleSM {
            policy,
            state: IdleState {
                attempt: 1,
                method: ResetMethod::Soft,
            },
        }
    }
}

/// Wraps the state machine and its various states into a simple enum, used
/// for pattern matching during state transitions.
#[derive(Debug)]
enum LifecycleStates {
    Idle(LifecycleSM<IdleState>),
    EnteringFlashMode(LifecycleSM<EnteringFlashModeState>),
    FlashMode(LifecycleSM<FlashModeState>),
    Flashed(LifecycleSM<FlashedState>),
    Booting(LifecycleSM<BootingState>),
    Connected(LifecycleSM<ConnectedState>),
    Failed(LifecycleSM<FailedState>),
}
impl LifecycleStates {
    /// Step until a terminal state is reached.
    fn run(mut self, ctx: &mut RunContext<'_>) -> Result<SessionHandle> {
        loop {
            self = match self {
                LifecycleStates::Connected(sm) => return Ok(sm.state.session),
                LifecycleStates::Failed(sm) => return Err(sm.state.error),
                other => other.step(ctx),
            };
        }
    }

    fn step(self, ctx: &mut RunContext<'_>) -> Self {
        match self {
            LifecycleStates::Idle(mut sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::EnterFlashMode(ev) => LifecycleStates::EnteringFlashMode(ev.into()),
                    Event::Failed(ev) => LifecycleStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            LifecycleStates::EnteringFlashMode(mut sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::InFlashMode(ev) => LifecycleStates::FlashMode(ev.into()),
                    Event::Retry(ev) => LifecycleStates::Idle(ev.into()),
                    Event::Failed(ev) => LifecycleStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            LifecycleStates::FlashMode(mut sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::Flashed(ev) => LifecycleStates::Flashed(ev.into()),
                    Event::Failed(ev) => LifecycleStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            LifecycleStates::Flashed(mut sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::Booted(ev) => LifecycleStates::Booting(ev.into()),
                    Event::Failed(ev) => LifecycleStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            LifecycleStates::Booting(mut sm) => {
                let event = sm.run(ctx);
                match event {
                    Event::Connected(ev) => LifecycleStates::Connected(ev.into()),
                    Event::Failed(ev) => LifecycleStates::Failed(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            terminal @ (LifecycleStates::Connected(_) | LifecycleStates::Failed(_)) => terminal,
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<EnterFlashModeEvent> for LifecycleSM<EnteringFlashModeState> {
    fn from(event: EnterFlashModeEvent) -> LifecycleSM<EnteringFlashModeState> {
        LifecycleSM {
            policy: event.policy,
            state: EnteringFlashModeState {
                attempt: event.attempt,
                method: event.method,
            },
        }
    }
}

impl From<RetryEvent> for LifecycleSM<IdleState> {
    fn from(event: RetryEvent) -> LifecycleSM<IdleState> {
        LifecycleSM {
            policy: event.policy,
            state: IdleState {
                attempt: event.attempt,
                method: event.method,
            },
        }
    }
}

impl From<InFlashModeEvent> for LifecycleSM<FlashModeState> {
    fn from(event: InFlashModeEvent) -> LifecycleSM<FlashModeState> {
        LifecycleSM {
            policy: event.policy,
            state: FlashModeState {},
        }
    }
}

impl From<FlashedEvent> for LifecycleSM<FlashedState> {
    fn from(event: FlashedEvent) -> LifecycleSM<FlashedState> {
        LifecycleSM {
            policy: event.policy,
            state: FlashedState {},
        }
    }
}

impl From<BootedEvent> for LifecycleSM<BootingState> {
    fn from(event: BootedEvent) -> LifecycleSM<BootingState> {
        LifecycleSM {
            policy: event.policy,
            state: BootingState {},
        }
    }
}

impl From<ConnectedEvent> for LifecycleSM<ConnectedState> {
    fn from(event: ConnectedEvent) -> LifecycleSM<ConnectedState> {
        info!("=> Connected");
        LifecycleSM {
            policy: event.policy,
            state: ConnectedState {
                session: event.session,
            },
        }
    }
}

impl From<FailedEvent> for LifecycleSM<FailedState> {
    fn from(event: FailedEvent) -> LifecycleSM<FailedState> {
        info!("=> Failed");
        LifecycleSM {
            policy: event.policy,
            state: FailedState { error: event.error },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn open(
    rig: &crate::testing::TestRig,
    device: crate::settings::DeviceConfigBuilder,
    target: crate::settings::TargetType,
) -> Box<dyn BoardDriver> {
    use crate::{driver::open_driver, settings::RunConfig};
    use std::sync::Arc;

    let run = RunConfig::new(target, rig.scratch_dir());
    open_driver(Arc::new(device.finalize()), run, rig.services()).unwrap()
}

#[cfg(test)]
fn android_image() -> Deployment {
    Deployment::OsImage(OsImageArtifacts {
        boot: Some("http://images/boot.img".into()),
        system: Some("http://images/system.img".into()),
        userdata: None,
    })
}

#[test]
fn android_run_on_nexus10() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let mut driver = open(&rig, rig.device().board("nexus10"), TargetType::Android);

    let session = dispatch(driver.as_mut(), &android_image()).unwrap();

    let scratch = rig.scratch_dir();
    assert_eq!(session.command(), "adb shell");
    assert_eq!(
        rig.runner.commands(),
        vec![
            "adb reboot bootloader".to_string(),
            "fastboot getvar all".to_string(),
            "fastboot erase boot".to_string(),
            format!("fastboot flash system {}", scratch.join("system.img").display()),
            format!("fastboot flash boot {}", scratch.join("boot.img").display()),
            "fastboot reboot".to_string(),
            "adb wait-for-device".to_string(),
            "adb shell".to_string(),
        ]
    );
    assert_eq!(
        rig.results.entries(),
        vec![("boot_image".to_string(), ResultStatus::Pass)]
    );
}

#[test]
fn unreachable_flash_mode_escalates_then_aborts() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("getvar");
    let device = rig
        .device()
        .board("fastboot")
        .hard_reset_command("pdu reboot 4");
    let mut driver = open(&rig, device, TargetType::Android);

    match dispatch(driver.as_mut(), &android_image()) {
        Err(Error::RunAborted(cause)) => {
            assert!(matches!(*cause, Error::FlashModeUnreachable { attempts: 2 }))
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(
        rig.runner.commands(),
        vec![
            "adb reboot bootloader",
            "fastboot getvar all",
            "pdu reboot 4",
            "fastboot getvar all",
        ]
    );
    assert_eq!(
        rig.results.entries(),
        vec![("boot_image".to_string(), ResultStatus::Fail)]
    );
}

#[test]
fn failed_hard_reset_is_retried() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("pdu");
    let device = rig
        .device()
        .board("fastboot")
        .hard_reset_command("pdu reboot 4")
        .flash_mode_attempts(3);
    let mut driver = open(&rig, device, TargetType::Android);

    // The soft reset works but the device never shows up, the hard resets
    // themselves fail.
    rig.runner.fail_on("getvar");
    let err = dispatch(driver.as_mut(), &android_image()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Aborted);
    assert_eq!(rig.runner.count("pdu reboot 4"), 2);
    assert_eq!(rig.runner.count("getvar"), 1);
}

#[test]
fn connection_errors_pass_through() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    rig.runner.fail_on("wait-for-device");
    let mut driver = open(&rig, rig.device().board("fastboot"), TargetType::Android);

    let err = dispatch(driver.as_mut(), &android_image()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(
        rig.results.entries(),
        vec![("boot_image".to_string(), ResultStatus::Fail)]
    );
}

#[test]
fn configuration_errors_abort_the_run() {
    use crate::settings::TargetType;
    use std::error::Error as _;

    let rig = crate::testing::TestRig::new();
    let mut driver = open(&rig, rig.device().board("fastboot"), TargetType::Android);

    let deployment = Deployment::OsImage(OsImageArtifacts::default());
    let err = dispatch(driver.as_mut(), &deployment).unwrap_err();

    assert_eq!(err.to_string(), "failed to boot test image");
    assert_eq!(
        err.source().map(|cause| cause.to_string()),
        Some("a boot image is required".to_string())
    );
    assert_eq!(rig.runner.count("fastboot erase"), 0);
}

#[test]
fn kernel_run_on_a_serial_board() {
    use crate::settings::TargetType;

    let rig = crate::testing::TestRig::new();
    let device = rig
        .device()
        .board("fastboot_serial")
        .kernel_load_addr("0x80208000")
        .boot_cmds_ramdisk("console=ttyO2,115200n8")
        .connection_command("telnet localhost 7001");
    let mut driver = open(&rig, device, TargetType::Other("oe".into()));

    let deployment = Deployment::Kernel(KernelArtifacts {
        kernel: Some("http://images/zImage".into()),
        ramdisk: Some("http://images/initrd.cpio.gz".into()),
        modules: Some("http://images/modules.tgz".into()),
        rootfs: None,
    });
    let session = dispatch(driver.as_mut(), &deployment).unwrap();

    let scratch = rig.scratch_dir();
    assert_eq!(session.command(), "telnet localhost 7001");
    assert_eq!(
        rig.runner.commands(),
        vec![
            "adb reboot bootloader".to_string(),
            "fastboot getvar all".to_string(),
            format!(
                "fastboot boot -c 'console=ttyO2,115200n8' -b 0x80208000 {} {}",
                scratch.join("zImage").display(),
                scratch.join("ramdisk.repacked.cpio.gz").display()
            ),
        ]
    );
    assert_eq!(rig.serial.commands(), vec!["telnet localhost 7001"]);
}
