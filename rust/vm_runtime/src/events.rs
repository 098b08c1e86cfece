//! State-change notifications for attached tooling.
//!
//! Observers are invoked synchronously, in registration order, every time the
//! interpreter updates `halted` or `paused` through its setters and whenever a
//! breakpoint pauses the machine.  Tooling that prefers a stream can take a
//! channel receiver via `VirtualMachine::events`.

use std::fmt;
use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmEvent {
    HaltedChanged(bool),
    PausedChanged(bool),
    /// Paused before the instruction at this 1-based address.
    BreakpointHit { address: usize },
}

pub trait VmObserver {
    fn on_event(&mut self, event: &VmEvent);

    /// Closed observers are dropped after the notification that found them so.
    fn is_closed(&self) -> bool {
        false
    }
}

impl<F> VmObserver for F
where
    F: FnMut(&VmEvent),
{
    fn on_event(&mut self, event: &VmEvent) {
        self(event)
    }
}

/// Forwards events into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: Sender<VmEvent>,
    closed: bool,
}

impl ChannelObserver {
    pub fn new(sender: Sender<VmEvent>) -> Self {
        Self {
            sender,
            closed: false,
        }
    }
}

impl VmObserver for ChannelObserver {
    fn on_event(&mut self, event: &VmEvent) {
        if self.sender.send(*event).is_err() {
            self.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[derive(Default)]
pub(crate) struct Observers {
    list: Vec<Box<dyn VmObserver + Send>>,
}

impl Observers {
    pub(crate) fn push(&mut self, observer: Box<dyn VmObserver + Send>) {
        self.list.push(observer);
    }

    pub(crate) fn notify(&mut self, event: VmEvent) {
        for observer in &mut self.list {
            observer.on_event(&event);
        }
        self.list.retain(|observer| !observer.is_closed());
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.list.len())
            .finish()
    }
}
