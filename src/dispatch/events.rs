//! Events for the run lifecycle state machine.
//!
//! This module is private and restricted to the [`dispatch`](crate::dispatch)
//! scope. Refer to the [`state_machine`](super::state_machine) module for an
//! overview of states, events and transitions.

use super::states::Policy;
use crate::{error::Error, fastboot::ResetMethod, services::SessionHandle};

// =============================================================================
// Crate-Public Interface
// =============================================================================

// EnterFlashModeEvent =========================================================

/// Fired from the `Idle` state while flash mode attempts are left. Triggers
/// the transition to the `EnteringFlashMode` state, resetting the device
/// with `method`.
#[derive(Debug)]
pub(crate) struct EnterFlashModeEvent {
    pub policy: Policy,
    pub attempt: u32,
    pub method: ResetMethod,
}

// RetryEvent ==================================================================

/// Fired from the `EnteringFlashMode` state when the reset failed or the
/// device does not answer in flash mode. Goes back to `Idle`, remembering
/// the escalated reset method for the next attempt.
#[derive(Debug)]
pub(crate) struct RetryEvent {
    pub policy: Policy,
    pub attempt: u32,
    pub method: ResetMethod,
}

// InFlashModeEvent ============================================================

/// Fired once the device answers in flash mode. Triggers the transition to
/// the `FlashMode` state where the deployment runs.
#[derive(Debug)]
pub(crate) struct InFlashModeEvent {
    pub policy: Policy,
}

// FlashedEvent ================================================================

#[derive(Debug)]
pub(crate) struct FlashedEvent {
    pub policy: Policy,
}

// BootedEvent =================================================================

#[derive(Debug)]
pub(crate) struct BootedEvent {
    pub policy: Policy,
}

// ConnectedEvent ==============================================================

/// Fired from the `Booting` state with the live session to the device.
#[derive(Debug)]
pub(crate) struct ConnectedEvent {
    pub policy: Policy,
    pub session: SessionHandle,
}

// FailedEvent =================================================================

/// Fired from any non terminal state when a step fails for good. There is
/// no resuming from the middle of a run.
#[derive(Debug)]
pub(crate) struct FailedEvent {
    pub policy: Policy,
    pub error: Error,
}

// Events enum =================================================================

/// Events that can be triggered within the run lifecycle state machine.
#[derive(Debug)]
pub(crate) enum Event {
    EnterFlashMode(EnterFlashModeEvent),
    Retry(RetryEvent),
    InFlashMode(InFlashModeEvent),
    Flashed(FlashedEvent),
    Booted(BootedEvent),
    Connected(ConnectedEvent),
    Failed(FailedEvent),
}
