//! Stack-machine interpreter for PixIR bytecode.
//!
//! `step` executes exactly one instruction and either advances the program
//! counter or sets it explicitly.  Operands are popped top-first and their tags
//! are checked before any state is touched; bulk opcodes verify stack depth and
//! memory bounds up front so a failing instruction never half-applies.  Any
//! error halts the machine and is handed back to the caller unchanged.

use std::collections::BTreeSet;
use std::fmt;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::bytecode::{colour_from_number, DecodeError, Opcode, Program};
use crate::config::VmConfig;
use crate::control::ControlHandle;
use crate::events::{Observers, VmEvent};
use crate::host::{Devices, Surface};
use crate::memory::{Frame, FrameStack, MemoryError, Value};
use crate::trace::{ExecutionTrace, TraceCollector};

/// Broad error classes surfaced to tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Syntax,
    Type,
    Range,
    Reference,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Runtime => "Error",
        })
    }
}

/// Errors surfaced by the interpreter.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("invalid operand type given to {opcode}, expected {expected}, got {found}")]
    TypeMismatch {
        opcode: Opcode,
        expected: &'static str,
        found: &'static str,
    },
    #[error("empty stack when operand is needed by {0}")]
    StackUnderflow(Opcode),
    #[error("program counter {pc} is out of bounds, valid range is [0, {last}]")]
    ProgramCounterOutOfBounds { pc: i64, last: i64 },
    #[error("{what} for {opcode} must be an integer, got {value}")]
    NotAnInteger {
        opcode: Opcode,
        what: &'static str,
        value: f64,
    },
    #[error("{what} for {opcode} is too large, got {value}")]
    IntegerOutOfRange {
        opcode: Opcode,
        what: &'static str,
        value: f64,
    },
    #[error("{what} for {opcode} must not be negative, got {value}")]
    NegativeCount {
        opcode: Opcode,
        what: &'static str,
        value: f64,
    },
    #[error("address {base} + {offset} for {opcode} overflows")]
    AddressOverflow {
        opcode: Opcode,
        base: i64,
        offset: i64,
    },
    #[error("{opcode} would grow the work stack to {requested} values, limit is {limit}")]
    StackLimit {
        opcode: Opcode,
        requested: usize,
        limit: usize,
    },
    #[error("{opcode} would grow a frame to {requested} slots, limit is {limit}")]
    FrameLimit {
        opcode: Opcode,
        requested: usize,
        limit: usize,
    },
    #[error("cannot delay for {0} ms")]
    DelayOutOfRange(f64),
    #[error("argument to irnd instruction is {0} <= 0, must be > 0")]
    RandomBound(f64),
    #[error("out of bounds fill x={x}, y={y}, w={w}, h={h} requested")]
    ScreenOutOfBounds { x: f64, y: f64, w: f64, h: f64 },
    #[error("cannot set screen {dimension} to {requested}, valid range is [1, {limit}]")]
    ScreenSize {
        dimension: &'static str,
        requested: u32,
        limit: u32,
    },
    #[error("{0} is not a valid character code")]
    InvalidCharCode(f64),
    #[error("tried calling function {0} which does not exist")]
    UnknownFunction(String),
    #[error("tried popping return pointer from stack when it was empty")]
    EmptyReturnStack,
    #[error("{0} instruction is missing its operand")]
    MissingOperand(Opcode),
    #[error("trying to execute step in halted VM")]
    Halted,
    #[error("invalid control state: {0}")]
    InvalidControlState(&'static str),
    #[error("invalid query `{0}`")]
    QuerySyntax(String),
    #[error("{what} index {index} is out of bounds, valid range is [0, {max}]")]
    QueryRange {
        what: &'static str,
        index: i64,
        max: i64,
    },
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::Decode(error) => error.kind(),
            VmError::TypeMismatch { .. } => ErrorKind::Type,
            VmError::StackUnderflow(_) => ErrorKind::Reference,
            VmError::Memory(_)
            | VmError::ProgramCounterOutOfBounds { .. }
            | VmError::NotAnInteger { .. }
            | VmError::IntegerOutOfRange { .. }
            | VmError::NegativeCount { .. }
            | VmError::AddressOverflow { .. }
            | VmError::StackLimit { .. }
            | VmError::FrameLimit { .. }
            | VmError::DelayOutOfRange(_)
            | VmError::RandomBound(_)
            | VmError::ScreenOutOfBounds { .. }
            | VmError::ScreenSize { .. }
            | VmError::InvalidCharCode(_)
            | VmError::QueryRange { .. } => ErrorKind::Range,
            VmError::QuerySyntax(_) => ErrorKind::Syntax,
            VmError::UnknownFunction(_)
            | VmError::EmptyReturnStack
            | VmError::MissingOperand(_)
            | VmError::Halted
            | VmError::InvalidControlState(_) => ErrorKind::Runtime,
        }
    }
}

/// Serialisable copy of the machine state for tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub program_counter: i64,
    pub halted: bool,
    pub paused: bool,
    pub width: u32,
    pub height: u32,
    pub work_stack: Vec<Value>,
    pub ret_stack: Vec<usize>,
    pub frames: FrameStack,
}

/// What to do with the program counter once an instruction completes.
enum Flow {
    Next,
    Jump(i64),
    /// Leave the counter alone: `halt`, or a `getchar` that was interrupted.
    Stay,
}

/// The PixIR machine: program, stacks, flags, and the devices it drives.
#[derive(Debug)]
pub struct VirtualMachine {
    pub(crate) program: Program,
    pub(crate) config: VmConfig,
    pub(crate) devices: Devices,
    pub(crate) work_stack: Vec<Value>,
    pub(crate) frames: FrameStack,
    pub(crate) ret_stack: Vec<usize>,
    pub(crate) pc: i64,
    pub(crate) halted: bool,
    pub(crate) paused: bool,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) breakpoints: BTreeSet<usize>,
    pub(crate) observers: Observers,
    pub(crate) control: ControlHandle,
    rng: StdRng,
    trace: TraceCollector,
}

impl VirtualMachine {
    /// Build a halted machine with the default configuration, shrinking the
    /// logical screen if the surface is smaller than it.
    pub fn new(devices: Devices) -> Self {
        let (surface_width, surface_height) = devices.surface.dimensions();
        let defaults = VmConfig::default();
        let config = defaults.with_screen(
            defaults.width.min(surface_width).max(1),
            defaults.height.min(surface_height).max(1),
        );
        Self::build(devices, config)
    }

    pub fn with_config(devices: Devices, config: VmConfig) -> Result<Self, VmError> {
        let (surface_width, surface_height) = devices.surface.dimensions();
        check_screen_size("width", config.width, surface_width)?;
        check_screen_size("height", config.height, surface_height)?;
        Ok(Self::build(devices, config))
    }

    fn build(devices: Devices, config: VmConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            program: Program::default(),
            width: config.width,
            height: config.height,
            config,
            devices,
            work_stack: Vec::new(),
            frames: FrameStack::new(),
            ret_stack: Vec::new(),
            pc: 0,
            halted: true,
            paused: false,
            breakpoints: BTreeSet::new(),
            observers: Observers::default(),
            control: ControlHandle::new(),
            rng,
            trace: TraceCollector::new(),
        }
    }

    /// Stop any run, replace the program, and reset.
    pub fn load(&mut self, program: Program) {
        self.stop();
        debug!(
            instructions = program.len(),
            functions = program.functions.len(),
            "program loaded"
        );
        self.program = program;
        self.reset();
    }

    /// Clear stacks and the program counter; program, screen size and
    /// breakpoints are kept.
    pub fn reset(&mut self) {
        self.work_stack.clear();
        self.frames = FrameStack::new();
        self.ret_stack.clear();
        self.pc = 0;
        self.control.clear();
        self.trace.reset();
        self.set_paused(false);
        debug!("machine reset");
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn program_counter(&self) -> i64 {
        self.pc
    }

    pub fn work_stack(&self) -> &[Value] {
        &self.work_stack
    }

    pub fn ret_stack(&self) -> &[usize] {
        &self.ret_stack
    }

    pub fn frames(&self) -> &FrameStack {
        &self.frames
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn surface(&self) -> &dyn Surface {
        self.devices.surface.as_ref()
    }

    /// Handle other threads use to pause or stop this machine.
    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn trace(&self) -> ExecutionTrace {
        self.trace.snapshot()
    }

    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot {
            program_counter: self.pc,
            halted: self.halted,
            paused: self.paused,
            width: self.width,
            height: self.height,
            work_stack: self.work_stack.clone(),
            ret_stack: self.ret_stack.clone(),
            frames: self.frames.clone(),
        }
    }

    pub(crate) fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
        self.observers.notify(VmEvent::HaltedChanged(halted));
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.observers.notify(VmEvent::PausedChanged(paused));
    }

    /// Execute the instruction at the program counter.
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.halted {
            return Err(VmError::Halted);
        }
        match self.execute_current() {
            Ok(()) => Ok(()),
            Err(error) => {
                debug!(pc = self.pc, %error, "instruction failed, halting");
                self.set_halted(true);
                Err(error)
            }
        }
    }

    fn execute_current(&mut self) -> Result<(), VmError> {
        let index = self.instruction_index()?;
        let opcode = self.program.instructions[index].opcode;
        trace!(pc = index, %opcode, depth = self.work_stack.len(), "execute");
        self.trace.record_instruction(index, opcode);

        let flow = match opcode {
            Opcode::Add => self.binary(opcode, |x, y| x + y)?,
            Opcode::Sub => self.binary(opcode, |x, y| x - y)?,
            Opcode::Mul => self.binary(opcode, |x, y| x * y)?,
            Opcode::Div => self.binary(opcode, |x, y| x / y)?,
            Opcode::Mod => self.binary(opcode, |x, y| x % y)?,
            Opcode::Inc => self.unary(opcode, |x| x + 1.0)?,
            Opcode::Dec => self.unary(opcode, |x| x - 1.0)?,
            Opcode::Max | Opcode::Or => self.binary(opcode, nan_max)?,
            Opcode::Min | Opcode::And => self.binary(opcode, nan_min)?,
            Opcode::Round => self.unary(opcode, round_half_up)?,
            Opcode::Irnd => {
                let bound = self.pop_number(opcode)?;
                if !(bound > 0.0) {
                    return Err(VmError::RandomBound(bound));
                }
                let sample: f64 = self.rng.gen();
                self.work_stack
                    .push(Value::Number(round_half_up(sample * (bound - 1.0))));
                Flow::Next
            }
            Opcode::Not => self.unary(opcode, |x| if x > 0.0 { 0.0 } else { 1.0 })?,
            Opcode::Lt => self.compare(opcode, |x, y| x < y)?,
            Opcode::Le => self.compare(opcode, |x, y| x <= y)?,
            Opcode::Gt => self.compare(opcode, |x, y| x > y)?,
            Opcode::Ge => self.compare(opcode, |x, y| x >= y)?,
            Opcode::Eq | Opcode::Neq => {
                let x = self.pop(opcode)?;
                let y = self.pop(opcode)?;
                if !x.same_kind(&y) {
                    return Err(VmError::TypeMismatch {
                        opcode,
                        expected: y.kind(),
                        found: x.kind(),
                    });
                }
                let equal = x == y;
                self.work_stack
                    .push(Value::from_bool(if opcode == Opcode::Eq { equal } else { !equal }));
                Flow::Next
            }
            Opcode::Dup => {
                let x = self.pop(opcode)?;
                self.work_stack.push(x.clone());
                self.work_stack.push(x);
                Flow::Next
            }
            Opcode::Drop => {
                self.pop(opcode)?;
                Flow::Next
            }
            Opcode::Push => self.execute_push(index)?,
            Opcode::Nop => Flow::Next,
            Opcode::Jmp => {
                let target = self.pop_integer(opcode, "jump target")?;
                Flow::Jump(target)
            }
            Opcode::Cjmp | Opcode::Cjmp2 => {
                // The target only has to be an address when the branch is taken.
                let target = self.pop_number(opcode)?;
                let condition = self.pop_number(opcode)?;
                let take = if opcode == Opcode::Cjmp {
                    condition != 0.0
                } else {
                    condition == 0.0
                };
                if take {
                    Flow::Jump(to_integer(opcode, "jump target", target)?)
                } else {
                    Flow::Next
                }
            }
            Opcode::Call => {
                let target = self.pop_integer(opcode, "call target")?;
                let arg_count = self.pop_count(opcode, "argument count")?;
                self.ensure_depth(opcode, arg_count)?;
                let args = (0..arg_count).map(|_| self.work_stack.pop()).collect();
                self.frames.push_frame(Frame::from_slots(args));
                self.ret_stack.push(index + 1);
                Flow::Jump(target)
            }
            Opcode::Ret => {
                let address = self.ret_stack.pop().ok_or(VmError::EmptyReturnStack)?;
                Flow::Jump(address as i64)
            }
            Opcode::Halt => {
                self.set_halted(true);
                Flow::Stay
            }
            Opcode::Alloc => {
                let count = self.pop_count(opcode, "slot count")?;
                let current = self.frames.frame(0).map_or(0, Frame::len);
                self.check_frame_size(opcode, current, count)?;
                self.frames.alloc(count)?;
                Flow::Next
            }
            Opcode::Oframe => {
                let count = self.pop_count(opcode, "frame size")?;
                self.check_frame_size(opcode, 0, count)?;
                self.frames.push_frame(Frame::with_len(count));
                Flow::Next
            }
            Opcode::Cframe => {
                self.frames.pop_frame();
                Flow::Next
            }
            Opcode::St => {
                let frame = self.pop_integer(opcode, "frame index")?;
                let location = self.pop_integer(opcode, "location")?;
                let value = self.pop(opcode)?;
                self.frames.write(location, frame, value)?;
                Flow::Next
            }
            Opcode::Delay => {
                let millis = self.pop_number(opcode)?;
                if millis > 0.0 {
                    let duration = Duration::try_from_secs_f64(millis / 1000.0)
                        .map_err(|_| VmError::DelayOutOfRange(millis))?;
                    thread::sleep(duration);
                }
                Flow::Next
            }
            Opcode::Write => {
                let x = self.pop_number(opcode)?;
                let y = self.pop_number(opcode)?;
                let colour = self.pop_number(opcode)?;
                self.fill_logical(x, y, 1.0, 1.0, colour)?;
                Flow::Next
            }
            Opcode::Writebox => {
                let x = self.pop_number(opcode)?;
                let y = self.pop_number(opcode)?;
                let w = self.pop_number(opcode)?;
                let h = self.pop_number(opcode)?;
                let colour = self.pop_number(opcode)?;
                self.fill_logical(x, y, w, h, colour)?;
                Flow::Next
            }
            Opcode::Clear => {
                let colour = self.pop_number(opcode)?;
                self.fill_logical(0.0, 0.0, f64::from(self.width), f64::from(self.height), colour)?;
                Flow::Next
            }
            Opcode::Read => {
                let x = self.pop_number(opcode)?;
                let y = self.pop_number(opcode)?;
                let colour = self.read_logical(x, y)?;
                self.work_stack.push(Value::Number(f64::from(colour)));
                Flow::Next
            }
            Opcode::Width => {
                self.work_stack.push(Value::Number(f64::from(self.width)));
                Flow::Next
            }
            Opcode::Height => {
                self.work_stack.push(Value::Number(f64::from(self.height)));
                Flow::Next
            }
            Opcode::Print => {
                let value = self.pop(opcode)?;
                self.devices.log.append(&format!("{value}\n"));
                Flow::Next
            }
            Opcode::Dupa => {
                let value = self.pop(opcode)?;
                let count = self.pop_count(opcode, "copy count")?;
                self.check_stack_growth(opcode, count)?;
                self.work_stack
                    .extend(std::iter::repeat(value).take(count));
                Flow::Next
            }
            Opcode::Sta => {
                let frame = self.pop_integer(opcode, "frame index")?;
                let location = self.pop_integer(opcode, "location")?;
                let count = self.pop_count(opcode, "value count")?;
                self.ensure_depth(opcode, count)?;
                self.frames.check_range(frame, location, count)?;
                let split = self.work_stack.len() - count;
                let values: Vec<Value> = self.work_stack.drain(split..).rev().collect();
                self.frames.write_range(location, frame, values)?;
                Flow::Next
            }
            Opcode::Pusha => {
                let count = self.pop_count(opcode, "value count")?;
                let (offset, frame) = match &self.program.instructions[index].operand {
                    Some(Value::Label { offset, frame }) => (*offset, *frame),
                    Some(other) => {
                        return Err(VmError::TypeMismatch {
                            opcode,
                            expected: "label",
                            found: other.kind(),
                        })
                    }
                    None => return Err(VmError::MissingOperand(opcode)),
                };
                let values = self.frames.read_range(offset, frame, count)?;
                self.work_stack.extend(values);
                Flow::Next
            }
            Opcode::Printa => {
                let count = self.pop_count(opcode, "value count")?;
                self.ensure_depth(opcode, count)?;
                for _ in 0..count {
                    let value = self.pop(opcode)?;
                    self.devices.log.append(&format!("{value}\n"));
                }
                Flow::Next
            }
            Opcode::Reta => {
                let count = self.pop_count(opcode, "value count")?;
                self.ensure_depth(opcode, count)?;
                let split = self.work_stack.len() - count;
                let tail = self.work_stack.split_off(split);
                self.work_stack.extend(tail.into_iter().rev());
                Flow::Next
            }
            Opcode::Getchar => match self.await_key() {
                Some(code) => {
                    self.work_stack.push(Value::Number(f64::from(code)));
                    Flow::Next
                }
                None => Flow::Stay,
            },
            Opcode::Putchar => {
                let code = self.pop_number(opcode)?;
                let rounded = round_half_up(code);
                let ch = (rounded.is_finite() && rounded >= 0.0 && rounded <= f64::from(u32::MAX))
                    .then(|| char::from_u32(rounded as u32))
                    .flatten()
                    .ok_or(VmError::InvalidCharCode(code))?;
                self.devices.log.append(ch.encode_utf8(&mut [0; 4]));
                Flow::Next
            }
        };

        match flow {
            Flow::Next => self.pc = index as i64 + 1,
            Flow::Jump(target) => self.pc = target,
            Flow::Stay => {}
        }
        self.trace
            .record_depths(self.work_stack.len(), self.frames.len(), self.ret_stack.len());
        Ok(())
    }

    fn execute_push(&mut self, index: usize) -> Result<Flow, VmError> {
        let opcode = Opcode::Push;
        let operand = self.program.instructions[index]
            .operand
            .clone()
            .ok_or(VmError::MissingOperand(opcode))?;
        let value = match operand {
            value @ (Value::Number(_) | Value::Array(_)) => value,
            Value::Function(name) => {
                let address = self
                    .program
                    .function_address(&name)
                    .ok_or(VmError::UnknownFunction(name))?;
                Value::Number(address as f64)
            }
            Value::Label { offset, frame } => self.frames.read(offset, frame)?,
            Value::LabelWithOffset { offset, frame } => {
                let shift = self.pop_integer(opcode, "label index")?;
                let location = offset
                    .checked_add(shift)
                    .ok_or(VmError::AddressOverflow {
                        opcode,
                        base: offset,
                        offset: shift,
                    })?;
                self.frames.read(location, frame)?
            }
            Value::PcOffset(offset) => {
                let base = index as i64;
                let target = base.checked_add(offset).ok_or(VmError::AddressOverflow {
                    opcode,
                    base,
                    offset,
                })?;
                Value::Number(target as f64)
            }
        };
        self.work_stack.push(value);
        Ok(Flow::Next)
    }

    /// Wait for a usable key, giving up if the machine is asked to pause or
    /// stop while waiting.
    fn await_key(&mut self) -> Option<u32> {
        let timeout = self.config.key_poll_interval;
        loop {
            let code = self
                .devices
                .keys
                .poll_key(timeout)
                .and_then(|key| key.code());
            if code.is_some() {
                return code;
            }
            if self.halted || self.paused || self.control.is_pending() {
                debug!(pc = self.pc, "getchar interrupted");
                return None;
            }
        }
    }

    fn instruction_index(&self) -> Result<usize, VmError> {
        let len = self.program.len();
        if self.pc < 0 || self.pc as usize >= len {
            return Err(VmError::ProgramCounterOutOfBounds {
                pc: self.pc,
                last: len as i64 - 1,
            });
        }
        Ok(self.pc as usize)
    }

    fn pop(&mut self, opcode: Opcode) -> Result<Value, VmError> {
        self.work_stack
            .pop()
            .ok_or(VmError::StackUnderflow(opcode))
    }

    fn pop_number(&mut self, opcode: Opcode) -> Result<f64, VmError> {
        let value = self.pop(opcode)?;
        value.as_number().ok_or(VmError::TypeMismatch {
            opcode,
            expected: "number",
            found: value.kind(),
        })
    }

    fn pop_integer(&mut self, opcode: Opcode, what: &'static str) -> Result<i64, VmError> {
        let value = self.pop_number(opcode)?;
        to_integer(opcode, what, value)
    }

    fn pop_count(&mut self, opcode: Opcode, what: &'static str) -> Result<usize, VmError> {
        let value = self.pop_integer(opcode, what)?;
        usize::try_from(value).map_err(|_| VmError::NegativeCount {
            opcode,
            what,
            value: value as f64,
        })
    }

    fn check_stack_growth(&self, opcode: Opcode, count: usize) -> Result<(), VmError> {
        let limit = self.config.stack_limit;
        match self.work_stack.len().checked_add(count) {
            Some(requested) if requested <= limit => Ok(()),
            requested => Err(VmError::StackLimit {
                opcode,
                requested: requested.unwrap_or(usize::MAX),
                limit,
            }),
        }
    }

    fn check_frame_size(
        &self,
        opcode: Opcode,
        current: usize,
        count: usize,
    ) -> Result<(), VmError> {
        let limit = self.config.frame_limit;
        match current.checked_add(count) {
            Some(requested) if requested <= limit => Ok(()),
            requested => Err(VmError::FrameLimit {
                opcode,
                requested: requested.unwrap_or(usize::MAX),
                limit,
            }),
        }
    }

    fn ensure_depth(&self, opcode: Opcode, count: usize) -> Result<(), VmError> {
        if self.work_stack.len() < count {
            return Err(VmError::StackUnderflow(opcode));
        }
        Ok(())
    }

    fn unary(&mut self, opcode: Opcode, op: impl Fn(f64) -> f64) -> Result<Flow, VmError> {
        let x = self.pop_number(opcode)?;
        self.work_stack.push(Value::Number(op(x)));
        Ok(Flow::Next)
    }

    fn binary(&mut self, opcode: Opcode, op: impl Fn(f64, f64) -> f64) -> Result<Flow, VmError> {
        let x = self.pop_number(opcode)?;
        let y = self.pop_number(opcode)?;
        self.work_stack.push(Value::Number(op(x, y)));
        Ok(Flow::Next)
    }

    fn compare(&mut self, opcode: Opcode, op: impl Fn(f64, f64) -> bool) -> Result<Flow, VmError> {
        let x = self.pop_number(opcode)?;
        let y = self.pop_number(opcode)?;
        self.work_stack.push(Value::from_bool(op(x, y)));
        Ok(Flow::Next)
    }

    /// Fill a logical rectangle (origin bottom-left) on the physical surface.
    fn fill_logical(&mut self, x: f64, y: f64, w: f64, h: f64, colour: f64) -> Result<(), VmError> {
        let (width, height) = (f64::from(self.width), f64::from(self.height));
        let in_bounds = x >= 0.0 && y >= 0.0 && x + w <= width && y + h <= height;
        if !in_bounds {
            return Err(VmError::ScreenOutOfBounds { x, y, w, h });
        }
        let colour = colour_from_number(colour)?;

        let (scale_x, scale_y) = self.scale();
        let top = height - y - h;
        let left = to_pixel(x * scale_x);
        let right = to_pixel((x + w) * scale_x);
        let upper = to_pixel(top * scale_y);
        let lower = to_pixel((top + h) * scale_y);
        self.devices.surface.fill_rect(
            left,
            upper,
            right.saturating_sub(left),
            lower.saturating_sub(upper),
            colour,
        );
        Ok(())
    }

    /// Sample the centre of the physical region covering logical cell `(x, y)`.
    fn read_logical(&self, x: f64, y: f64) -> Result<u32, VmError> {
        let (width, height) = (f64::from(self.width), f64::from(self.height));
        let in_bounds = x >= 0.0 && y >= 0.0 && x + 1.0 <= width && y + 1.0 <= height;
        if !in_bounds {
            return Err(VmError::ScreenOutOfBounds {
                x,
                y,
                w: 1.0,
                h: 1.0,
            });
        }
        let (scale_x, scale_y) = self.scale();
        let top = height - y - 1.0;
        let centre_x = (x + 0.5) * scale_x;
        let centre_y = (top + 0.5) * scale_y;
        Ok(self
            .devices
            .surface
            .read_pixel(centre_x.floor() as u32, centre_y.floor() as u32))
    }

    fn scale(&self) -> (f64, f64) {
        let (surface_width, surface_height) = self.devices.surface.dimensions();
        (
            f64::from(surface_width) / f64::from(self.width),
            f64::from(surface_height) / f64::from(self.height),
        )
    }
}

pub(crate) fn check_screen_size(dimension: &'static str, requested: u32, limit: u32) -> Result<(), VmError> {
    if requested == 0 || requested > limit {
        return Err(VmError::ScreenSize {
            dimension,
            requested,
            limit,
        });
    }
    Ok(())
}

/// Accept `value` as an address or count only if it is an exact `i64`.
fn to_integer(opcode: Opcode, what: &'static str, value: f64) -> Result<i64, VmError> {
    // 2^63 is the first float past i64::MAX.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(VmError::NotAnInteger {
            opcode,
            what,
            value,
        });
    }
    if !(-LIMIT..LIMIT).contains(&value) {
        return Err(VmError::IntegerOutOfRange {
            opcode,
            what,
            value,
        });
    }
    Ok(value as i64)
}

/// Round to the nearest integer, halves towards positive infinity.
fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

fn nan_max(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        f64::NAN
    } else {
        x.max(y)
    }
}

fn nan_min(x: f64, y: f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        f64::NAN
    } else {
        x.min(y)
    }
}

fn to_pixel(value: f64) -> u32 {
    value.round().max(0.0) as u32
}
