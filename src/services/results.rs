//! Recording of pass/fail results produced during a run.

use std::{fmt, sync::Mutex};

use log::info;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResultStatus {
    Pass,
    Fail,
}
impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Pass => f.write_str("pass"),
            ResultStatus::Fail => f.write_str("fail"),
        }
    }
}

/// Sink for named test results.
pub trait ResultRecorder: Send + Sync {
    fn add_result(&self, name: &str, status: ResultStatus);
}

/// [`ResultRecorder`] keeping results in memory, in recording order.
#[derive(Debug, Default)]
pub struct ResultLog {
    entries: Mutex<Vec<(String, ResultStatus)>>,
}
impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, ResultStatus)> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
impl ResultRecorder for ResultLog {
    fn add_result(&self, name: &str, status: ResultStatus) {
        info!("result {}: {}", name, status);
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.to_string(), status));
    }
}
