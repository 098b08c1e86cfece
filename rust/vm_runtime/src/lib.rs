//! PixIR virtual machine runtime.
//!
//! A stack machine with frame-based local memory, a scaled pixel screen, a
//! text log, and keyboard input, plus the run control and inspection surface
//! that debuggers build on.

pub mod bytecode;
pub mod config;
pub mod control;
mod debugger;
pub mod events;
pub mod host;
pub mod interpreter;
pub mod memory;
mod query;
pub mod trace;

pub use bytecode::{DecodeError, Instruction, Opcode, Program};
pub use config::VmConfig;
pub use control::ControlHandle;
pub use events::{ChannelObserver, VmEvent, VmObserver};
pub use host::{Devices, Key, KeySource, PixelBuffer, ScriptedKeys, SharedLog, Surface, TextSink};
pub use interpreter::{ErrorKind, VirtualMachine, VmError, VmSnapshot};
pub use memory::{Frame, FrameStack, Value};
pub use trace::ExecutionTrace;
