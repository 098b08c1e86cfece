//! Run control for the PixIR VM: run, resume, pause, stop, single step, step
//! out, breakpoints, and observer registration.
//!
//! The machine is in one of three states.  Halted means not running, and the
//! next `run` or `safe_step` starts from a reset.  Paused means a run was
//! suspended and can be resumed or stepped.  Running means neither flag is
//! set.  Breakpoints are 1-based instruction addresses; the machine pauses
//! *before* executing the instruction at a breakpoint.

use std::sync::mpsc::{self, Receiver};

use tracing::debug;

use crate::events::{ChannelObserver, VmEvent, VmObserver};
use crate::interpreter::{check_screen_size, VirtualMachine, VmError};

impl VirtualMachine {
    /// Reset and run from the start until halt, pause, or error.
    pub fn run(&mut self) -> Result<(), VmError> {
        self.reset();
        self.set_halted(false);
        debug!("run started");
        self.resume()
    }

    /// Continue a paused machine until halt, pause, or error.
    pub fn resume(&mut self) -> Result<(), VmError> {
        if self.halted {
            return Err(VmError::InvalidControlState(
                "cannot resume a halted machine",
            ));
        }
        // A pause requested before this call belongs to the previous run.
        self.control.take_pause();
        self.set_paused(false);
        self.drive(None)
    }

    pub fn pause(&mut self) {
        debug!(pc = self.pc, "pause");
        self.set_paused(true);
    }

    pub fn stop(&mut self) {
        debug!(pc = self.pc, "stop");
        self.set_halted(true);
    }

    /// Execute one instruction from a paused or halted machine, starting a
    /// fresh paused run in the latter case.
    pub fn safe_step(&mut self) -> Result<(), VmError> {
        self.apply_control_requests();
        self.enter_paused_step()?;
        self.step()?;
        self.apply_control_requests();
        Ok(())
    }

    /// Run until the current function returns, then pause again.
    pub fn step_out(&mut self) -> Result<(), VmError> {
        self.apply_control_requests();
        self.enter_paused_step()?;
        let depth = self.ret_stack.len();
        debug!(pc = self.pc, depth, "step out");
        self.set_paused(false);
        self.drive(Some(depth))?;
        if !self.halted {
            self.set_paused(true);
        }
        Ok(())
    }

    /// Returns `true` if the breakpoint was not already set.
    pub fn add_breakpoint(&mut self, address: usize) -> bool {
        self.breakpoints.insert(address)
    }

    /// Returns `true` if the breakpoint was set.
    pub fn remove_breakpoint(&mut self, address: usize) -> bool {
        self.breakpoints.remove(&address)
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn has_breakpoint(&self, address: usize) -> bool {
        self.breakpoints.contains(&address)
    }

    /// Breakpoint addresses in ascending order.
    pub fn breakpoints(&self) -> impl Iterator<Item = usize> + '_ {
        self.breakpoints.iter().copied()
    }

    /// Register an observer; observers run in registration order.
    pub fn subscribe(&mut self, observer: impl VmObserver + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Stream of future events.  The channel is unsubscribed on the first
    /// notification after the receiver is dropped.
    pub fn events(&mut self) -> Receiver<VmEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribe(ChannelObserver::new(sender));
        receiver
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Change the logical width; only allowed while halted.
    pub fn set_width(&mut self, width: u32) -> Result<(), VmError> {
        self.ensure_halted_for_resize()?;
        let (limit, _) = self.devices.surface.dimensions();
        check_screen_size("width", width, limit)?;
        self.width = width;
        Ok(())
    }

    /// Change the logical height; only allowed while halted.
    pub fn set_height(&mut self, height: u32) -> Result<(), VmError> {
        self.ensure_halted_for_resize()?;
        let (_, limit) = self.devices.surface.dimensions();
        check_screen_size("height", height, limit)?;
        self.height = height;
        Ok(())
    }

    fn ensure_halted_for_resize(&self) -> Result<(), VmError> {
        if !self.halted {
            return Err(VmError::InvalidControlState(
                "screen size can only change while halted",
            ));
        }
        Ok(())
    }

    fn enter_paused_step(&mut self) -> Result<(), VmError> {
        if self.halted {
            self.reset();
            self.set_halted(false);
            self.set_paused(true);
        } else if !self.paused {
            return Err(VmError::InvalidControlState(
                "cannot step while the machine is running",
            ));
        }
        Ok(())
    }

    /// Step until halted or paused; with `until_depth`, also stop as soon as
    /// the return stack is shallower than that.
    fn drive(&mut self, until_depth: Option<usize>) -> Result<(), VmError> {
        loop {
            self.apply_control_requests();
            if self.halted || self.paused {
                return Ok(());
            }
            self.step()?;
            self.check_breakpoint();
            if until_depth.is_some_and(|depth| self.ret_stack.len() < depth) {
                return Ok(());
            }
        }
    }

    fn apply_control_requests(&mut self) {
        if self.control.take_stop() {
            debug!(pc = self.pc, "stop requested");
            self.set_halted(true);
        }
        if self.control.take_pause() && !self.halted {
            debug!(pc = self.pc, "pause requested");
            self.set_paused(true);
        }
    }

    fn check_breakpoint(&mut self) {
        if self.halted || self.paused || self.pc < 0 {
            return;
        }
        let address = self.pc as usize + 1;
        if self.breakpoints.contains(&address) {
            debug!(address, "breakpoint hit");
            self.set_paused(true);
            self.observers.notify(VmEvent::BreakpointHit { address });
        }
    }
}
