//! Opening the serial console of a board.

use std::sync::Arc;

use log::info;

use super::{CommandRunner, SessionHandle};
use crate::error::Result;

/// Opens a serial console session using the device's connection command.
pub trait SerialConnector: Send + Sync {
    fn connect(&self, connection_command: &str) -> Result<SessionHandle>;
}

/// [`SerialConnector`] spawning the connection command (usually `telnet`
/// to a console server, or `conmux-console`) as a session.
pub struct ShellSerial {
    runner: Arc<dyn CommandRunner>,
}
impl ShellSerial {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        ShellSerial { runner }
    }
}
impl SerialConnector for ShellSerial {
    fn connect(&self, connection_command: &str) -> Result<SessionHandle> {
        info!("connecting to the serial console: {}", connection_command);
        self.runner.spawn(connection_command)
    }
}
