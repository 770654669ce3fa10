//! Unified teardown: every exit path — normal return, early fatal return,
//! or asynchronous cancellation — converges here.
//!
//! Ordering guarantee: log capture happens before any process cleanup, so
//! a failure's log is never lost to the teardown step.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::notify::Notifier;
use crate::paths::Layout;
use crate::session::{EnvSnapshot, SessionLog, DEFAULT_DENYLIST};

/// Why the session is ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    Success,
    UserCancel,
    Fatal,
}

/// External tool process names force-terminated on non-clean exit.
/// Best-effort and tolerant of absence; prevents orphaned long-running
/// children from outliving the controller.
const KNOWN_TOOLS: &[&str] = &["make", "cc1", "ld.lld", "java"];

static TEARDOWN_DONE: AtomicBool = AtomicBool::new(false);

/// Cosmetic delay before the process exits, so final output is readable.
const EXIT_DELAY: Duration = Duration::from_millis(500);

/// Run the shared teardown once. Subsequent calls are no-ops.
pub fn teardown(
    reason: TeardownReason,
    layout: &Layout,
    target: Option<&str>,
    log: Option<(&mut SessionLog, &EnvSnapshot)>,
    notifier: &Notifier,
) {
    if TEARDOWN_DONE.swap(true, Ordering::SeqCst) {
        return;
    }

    // Log capture first; cleanup must never cost us the failure record.
    if let Some((session_log, before)) = log {
        let _ = session_log.capture(before, DEFAULT_DENYLIST);
        if reason == TeardownReason::Fatal {
            notifier.send_file(session_log.path(), "build failed, log attached");
        }
    }

    if reason != TeardownReason::Success {
        kill_known_tools();
    }

    if let Some(target) = target {
        layout.prune_empty_target_dirs(target);
    }

    thread::sleep(EXIT_DELAY);
}

fn kill_known_tools() {
    for name in KNOWN_TOOLS {
        let _ = Command::new("pkill").args(["-9", "-x", name]).status();
    }
}

/// Scoped-exit guard: unless disarmed by a normal return, dropping the
/// guard funnels the exit through [`teardown`] with a fatal reason.
pub struct TeardownGuard<'a> {
    layout: &'a Layout,
    target: Option<String>,
    notifier: &'a Notifier,
    armed: bool,
}

impl<'a> TeardownGuard<'a> {
    pub fn new(layout: &'a Layout, notifier: &'a Notifier) -> Self {
        TeardownGuard {
            layout,
            target: None,
            notifier,
            armed: true,
        }
    }

    pub fn set_target(&mut self, target: &str) {
        self.target = Some(target.to_string());
    }

    /// Normal-return path: the caller performs teardown explicitly with
    /// the accurate reason.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            teardown(
                TeardownReason::Fatal,
                self.layout,
                self.target.as_deref(),
                None,
                self.notifier,
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    TEARDOWN_DONE.store(false, Ordering::SeqCst);
}
