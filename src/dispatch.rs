//! The per-run deploy and boot lifecycle.
//!
//! [`dispatch`] takes a freshly opened board driver through entering flash
//! mode, deploying, booting and connecting, and hands back the live session.
//!
//! **Example** - Deploying and booting an Android image:
//! ```no_run
//! use std::sync::Arc;
//! use flashboot::{
//!     dispatch, open_driver, Deployment, DeviceConfig, OsImageArtifacts, ResultLog, RunConfig,
//!     Services, SessionIo, TargetType,
//! };
//!
//! let device = Arc::new(DeviceConfig::load("/etc/flashboot/nexus10.toml").unwrap());
//! let run = RunConfig::new(TargetType::Android, "/tmp/flashboot");
//! let services = Services::shell(Arc::new(ResultLog::new()), SessionIo::Inherit);
//! let mut driver = open_driver(device, run, services).unwrap();
//!
//! let deployment = Deployment::OsImage(OsImageArtifacts {
//!     boot: Some("http://images/boot.img".into()),
//!     ..OsImageArtifacts::default()
//! });
//! let mut session = dispatch(driver.as_mut(), &deployment).unwrap();
//! session.wait().unwrap();
//! ```

mod events;
mod state_machine;
mod states;

pub use state_machine::{dispatch, Deployment};
