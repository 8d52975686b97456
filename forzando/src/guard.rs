//! Cooperative enter/disable handshake between the audio thread and the
//! control thread.
//!
//! Two booleans, exactly one writer each: the audio thread flags
//! `in_callback` around every render; the control thread clears
//! `allow_enter` and spin-sleeps until the callback drains before it
//! reconfigures. Neither side ever blocks the audio thread; a forbidden
//! entry renders silence instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

/// The shared pair of flags.
pub struct GuardPoint {
    allow_enter: AtomicBool,
    in_callback: AtomicBool,
}

impl GuardPoint {
    pub fn new() -> Self {
        Self { allow_enter: AtomicBool::new(true), in_callback: AtomicBool::new(false) }
    }

    /// Try to enter the audio callback. `None` means a reconfiguration is
    /// in progress and the caller must output silence.
    pub fn try_enter(&self) -> Option<EnterGuard<'_>> {
        self.in_callback.store(true, Ordering::SeqCst);
        if !self.allow_enter.load(Ordering::SeqCst) {
            self.in_callback.store(false, Ordering::SeqCst);
            return None;
        }
        Some(EnterGuard { point: self })
    }

    /// Forbid callback entry and wait for any in-flight callback to leave.
    /// Entry is re-allowed when the returned guard drops.
    pub fn disable(&self) -> Disabler<'_> {
        self.allow_enter.store(false, Ordering::SeqCst);
        let started = Instant::now();
        while self.in_callback.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
            if started.elapsed() > Duration::from_millis(100) {
                debug_assert!(false, "audio callback held the guard for over 100 ms");
                warn!("audio callback still active after 100 ms, proceeding anyway");
                break;
            }
        }
        Disabler { point: self }
    }
}

impl Default for GuardPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the audio thread as inside the callback.
pub struct EnterGuard<'a> {
    point: &'a GuardPoint,
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        self.point.in_callback.store(false, Ordering::SeqCst);
    }
}

/// Holds callback entry forbidden for the scope of a reconfiguration.
pub struct Disabler<'a> {
    point: &'a GuardPoint,
}

impl Drop for Disabler<'_> {
    fn drop(&mut self) {
        self.point.allow_enter.store(true, Ordering::SeqCst);
    }
}
