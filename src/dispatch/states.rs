//! States for the run lifecycle state machine.
//!
//! This module is private and restricted to the [`dispatch`](crate::dispatch)
//! scope. Refer to the [`state_machine`](super::state_machine) module for an
//! overview of states, events and transitions.

use log::{debug, info, warn};

use super::{events::*, state_machine::Deployment};
use crate::{
    driver::BoardDriver,
    error::Error,
    fastboot::{EnterOutcome, ResetMethod},
    services::SessionHandle,
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Parameters of the state machine, fixed for the whole run.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Policy {
    pub flash_mode_attempts: u32,
}

/// What the states work on: the driver of the run and what to deploy.
pub(crate) struct RunContext<'a> {
    pub driver: &'a mut dyn BoardDriver,
    pub deployment: &'a Deployment,
}

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// Do the work of the state and request the next transition by returning
    /// the appropriate `event`. The `event` is then consumed to create the
    /// new state using the corresponding `From` implementation.
    fn run(&mut self, policy: &Policy, ctx: &mut RunContext<'_>) -> Event;
}

// Idle State ==================================================================

/// The device is in an unknown state; nothing was attempted yet, or the last
/// attempt to enter flash mode failed.
///
/// From the `IdleState`, the state machine can evolve via the following
/// transitions:
///
///  * **`EnterFlashModeEvent` => `EnteringFlashModeState`** while attempts
///    are left,
///  * **`FailedEvent` => `FailedState`** once all attempts are used up.
#[derive(Debug)]
pub(crate) struct IdleState {
    pub attempt: u32,
    pub method: ResetMethod,
}
impl Runnable for IdleState {
    fn run(&mut self, policy: &Policy, _ctx: &mut RunContext<'_>) -> Event {
        info!("=> Idle");
        if self.attempt > policy.flash_mode_attempts {
            return Event::Failed(FailedEvent {
                policy: *policy,
                error: Error::FlashModeUnreachable {
                    attempts: policy.flash_mode_attempts,
                },
            });
        }
        Event::EnterFlashMode(EnterFlashModeEvent {
            policy: *policy,
            attempt: self.attempt,
            method: self.method,
        })
    }
}

// EnteringFlashMode State =====================================================

#[derive(Debug)]
pub(crate) struct EnteringFlashModeState {
    pub attempt: u32,
    pub method: ResetMethod,
}
impl EnteringFlashModeState {
    fn retry(&self, policy: &Policy) -> Event {
        Event::Retry(RetryEvent {
            policy: *policy,
            attempt: self.attempt + 1,
            method: self.method.escalate(),
        })
    }
}
impl Runnable for EnteringFlashModeState {
    fn run(&mut self, policy: &Policy, ctx: &mut RunContext<'_>) -> Event {
        info!("=> EnteringFlashMode");
        info!(
            "attempt {}/{}, {:?} reset",
            self.attempt, policy.flash_mode_attempts, self.method
        );

        match ctx.driver.enter_flash_mode(self.method) {
            Ok(EnterOutcome::ManualInterventionRequired) => {
                warn!("the device has to be reset by hand")
            }
            Ok(outcome) => debug!("reset done: {:?}", outcome),
            Err(e) if e.is_command_failure() => {
                warn!("could not reset the device: {}", e);
                return self.retry(policy);
            }
            Err(e) => {
                return Event::Failed(FailedEvent {
                    policy: *policy,
                    error: e,
                })
            }
        }

        if ctx.driver.in_flash_mode() {
            Event::InFlashMode(InFlashModeEvent { policy: *policy })
        } else {
            warn!("device is not in flash mode");
            self.retry(policy)
        }
    }
}

// FlashMode State =============================================================

/// The device answers in flash mode; the deployment runs here.
#[derive(Debug)]
pub(crate) struct FlashModeState {}
impl Runnable for FlashModeState {
    fn run(&mut self, policy: &Policy, ctx: &mut RunContext<'_>) -> Event {
        info!("=> FlashMode");
        let deployed = match ctx.deployment {
            Deployment::Kernel(artifacts) => ctx.driver.deploy_kernel(artifacts),
            Deployment::OsImage(artifacts) => ctx.driver.deploy_os_image(artifacts),
        };
        match deployed {
            Ok(()) => Event::Flashed(FlashedEvent { policy: *policy }),
            Err(error) => Event::Failed(FailedEvent {
                policy: *policy,
                error,
            }),
        }
    }
}

// Flashed State ===============================================================

/// Partitions are written; the boot is issued here.
#[derive(Debug)]
pub(crate) struct FlashedState {}
impl Runnable for FlashedState {
    fn run(&mut self, policy: &Policy, ctx: &mut RunContext<'_>) -> Event {
        info!("=> Flashed");
        let boot_args = ctx.driver.core().boot_args();
        debug!("boot arguments: `{}`", boot_args);
        match ctx.driver.boot(&boot_args) {
            Ok(()) => Event::Booted(BootedEvent { policy: *policy }),
            Err(error) => Event::Failed(FailedEvent {
                policy: *policy,
                error,
            }),
        }
    }
}

// Booting State ===============================================================

#[derive(Debug)]
pub(crate) struct BootingState {}
impl Runnable for BootingState {
    fn run(&mut self, policy: &Policy, ctx: &mut RunContext<'_>) -> Event {
        info!("=> Booting");
        match ctx.driver.connect() {
            Ok(session) => Event::Connected(ConnectedEvent {
                policy: *policy,
                session,
            }),
            Err(error) => Event::Failed(FailedEvent {
                policy: *policy,
                error,
            }),
        }
    }
}

// Terminal States =============================================================

/// The run succeeded and holds the live session.
#[derive(Debug)]
pub(crate) struct ConnectedState {
    pub session: SessionHandle,
}

#[derive(Debug)]
pub(crate) struct FailedState {
    pub error: Error,
}
