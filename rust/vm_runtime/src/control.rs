//! Cross-thread pause/stop requests.
//!
//! The machine itself is driven through `&mut self`, so another thread cannot
//! flip its flags directly.  It holds a [`ControlHandle`] instead; the
//! interpreter applies pending requests at the next instruction boundary and
//! `getchar` checks them every time its key poll times out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Requests {
    pause: AtomicBool,
    stop: AtomicBool,
}

/// Cloneable token used to pause or stop a running machine.
#[derive(Debug, Clone, Default)]
pub struct ControlHandle {
    requests: Arc<Requests>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the machine to pause at the next instruction boundary.
    pub fn pause(&self) {
        self.requests.pause.store(true, Ordering::Release);
    }

    /// Ask the machine to halt at the next instruction boundary.
    pub fn stop(&self) {
        self.requests.stop.store(true, Ordering::Release);
    }

    pub fn pause_requested(&self) -> bool {
        self.requests.pause.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.requests.stop.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.pause_requested() || self.stop_requested()
    }

    pub(crate) fn take_pause(&self) -> bool {
        self.requests.pause.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.requests.stop.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear(&self) {
        self.take_pause();
        self.take_stop();
    }
}
