//! Small helpers shared by the flasher and bridge clients.

use std::{thread, time::Duration};

use indicatif::{ProgressBar, ProgressStyle};
use log::info;

/// Block for `delay`, showing a spinner with `message` while waiting.
///
/// Used after reboots to let the USB bus re-enumerate before the device is
/// addressed again. A zero delay returns immediately.
pub(crate) fn settle(delay: Duration, message: &str) {
    if delay.is_zero() {
        return;
    }
    info!("{} ({}s)", message, delay.as_secs());

    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[FB] {spinner:.blue} {msg}"),
    );
    pb.set_message(format!("⏳ {}...", message));
    thread::sleep(delay);
    pb.finish_and_clear();
}

/// Quote `arg` for `sh` when it contains anything beyond a conservative set
/// of safe characters.
pub(crate) fn quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        quote_always(arg)
    }
}

/// Single-quote `arg` for `sh` unconditionally.
pub(crate) fn quote_always(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn quote_leaves_plain_paths_alone() {
    assert_eq!(quote("/srv/work/boot.img"), "/srv/work/boot.img");
}

#[test]
fn quote_wraps_spaces_and_quotes() {
    assert_eq!(quote("my image.img"), "'my image.img'");
    assert_eq!(quote("it's"), r"'it'\''s'");
    assert_eq!(quote(""), "''");
}

#[test]
fn zero_settle_returns_immediately() {
    let start = std::time::Instant::now();
    settle(Duration::ZERO, "nothing to wait for");
    assert!(start.elapsed() < Duration::from_millis(100));
}
