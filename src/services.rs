//! Services the board drivers rely on but do not implement themselves.
//!
//! Each service is a trait so that the lab can plug in its own
//! implementation (and tests can plug in recording doubles). The default
//! implementations shell out to the usual host tools:
//!
//! * [`ShellRunner`] runs command lines through `sh` and kills the whole
//!   process group when the timeout expires,
//! * [`LockedRunner`] serializes every invocation behind a host-wide lock
//!   file,
//! * [`ShellDownloader`] copies local files or fetches URLs with `curl`,
//! * [`CpioRamdisk`] unpacks, extends and repacks gzip'ed cpio ramdisks,
//! * [`ShellSerial`] spawns the board's serial console command,
//! * [`ResultLog`] keeps test results in memory.

mod command;
mod download;
mod lock;
mod ramdisk;
mod results;
mod serial;
mod session;

use std::sync::Arc;

pub use command::{CommandRunner, CommandStatus, ShellRunner};
pub use download::{Downloader, ShellDownloader};
pub use lock::{FlashLock, LockedRunner};
pub use ramdisk::{CpioRamdisk, RamdiskTool};
pub use results::{ResultLog, ResultRecorder, ResultStatus};
pub use serial::{SerialConnector, ShellSerial};
pub use session::{SessionHandle, SessionIo};

pub(crate) use command::check_status;

/// The set of services handed to every board driver.
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn CommandRunner>,
    pub downloader: Arc<dyn Downloader>,
    pub ramdisk: Arc<dyn RamdiskTool>,
    pub serial: Arc<dyn SerialConnector>,
    pub results: Arc<dyn ResultRecorder>,
}
impl Services {
    /// Services backed by the host shell, recording results into `results`.
    /// Sessions handed back by a run are wired according to `session_io`.
    pub fn shell(results: Arc<dyn ResultRecorder>, session_io: SessionIo) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ShellRunner::new().with_session_io(session_io));
        Services {
            downloader: Arc::new(ShellDownloader::new(runner.clone())),
            ramdisk: Arc::new(CpioRamdisk::new(runner.clone())),
            serial: Arc::new(ShellSerial::new(runner.clone())),
            runner,
            results,
        }
    }
}
