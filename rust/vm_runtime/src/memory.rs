//! Memory subsystem for the PixIR VM runtime.
//!
//! Values are a closed, tagged union so that every opcode can check the tags it
//! consumes.  Local storage is a stack of frames owned exclusively by the
//! interpreter; frame 0 is always the innermost scope.  All access goes through
//! bounds-checked accessors that report the valid range on failure.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime value stored on the work stack and inside frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Number(f64),
    /// Absolute `[offset:frame]` memory address.
    Label { offset: i64, frame: i64 },
    /// Address whose offset is shifted by an index popped at use time.
    LabelWithOffset { offset: i64, frame: i64 },
    /// Instruction offset relative to the pushing instruction.
    PcOffset(i64),
    Function(String),
    Array(Vec<Option<Value>>),
}

impl Value {
    /// Helpful string describing the variant for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Label { .. } => "label",
            Value::LabelWithOffset { .. } => "label-with-offset",
            Value::PcOffset(_) => "pc-offset",
            Value::Function(_) => "function",
            Value::Array(_) => "array",
        }
    }

    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn from_bool(flag: bool) -> Self {
        Value::Number(if flag { 1.0 } else { 0.0 })
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(value) => f.write_str(&format_number(*value)),
            Value::Label { offset, frame } => write!(f, "[{offset}:{frame}]"),
            Value::LabelWithOffset { offset, frame } => write!(f, "+[{offset}:{frame}]"),
            Value::PcOffset(offset) => write!(f, "#PC{offset:+}"),
            Value::Function(name) => f.write_str(name),
            Value::Array(items) => {
                f.write_str("[")?;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        f.write_str(",")?;
                    }
                    match item {
                        Some(value) => write!(f, "{value}")?,
                        None => f.write_str(UNDEFINED)?,
                    }
                }
                f.write_str("]")
            }
        }
    }
}

/// Text shown for slots that were allocated but never written.
pub const UNDEFINED: &str = "undefined";

/// Format a number the way program output expects: integral values carry no
/// fractional part and non-finite values use their long names.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else if value == 0.0 {
        "0".to_owned()
    } else if value.fract() == 0.0 && value.abs() < 1e21 {
        format!("{value:.0}")
    } else {
        format!("{value}")
    }
}

/// One scope's local storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame {
    slots: Vec<Option<Value>>,
}

impl Frame {
    /// Frame with `len` uninitialised slots.
    pub fn with_len(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    pub fn from_slots(slots: Vec<Option<Value>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&Option<Value>> {
        self.slots.get(index)
    }

    pub fn slots(&self) -> &[Option<Value>] {
        &self.slots
    }

    fn grow(&mut self, count: usize) {
        self.slots.resize(self.slots.len() + count, None);
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, slot) in self.slots.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            match slot {
                Some(value) => write!(f, "{value}")?,
                None => f.write_str(UNDEFINED)?,
            }
        }
        f.write_str("]")
    }
}

/// Stack of frames; index 0 is the innermost scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameStack {
    frames: VecDeque<Frame>,
}

impl Default for FrameStack {
    /// A fresh machine starts with a single empty global frame.
    fn default() -> Self {
        Self {
            frames: VecDeque::from([Frame::default()]),
        }
    }
}

impl FrameStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// Open a new innermost frame.
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push_front(frame);
    }

    /// Close the innermost frame; closing with no frames left is a no-op.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Append `count` uninitialised slots to the innermost frame.
    pub fn alloc(&mut self, count: usize) -> Result<(), MemoryError> {
        let max = self.max_frame();
        let frame = self
            .frames
            .front_mut()
            .ok_or(MemoryError::FrameOutOfBounds { frame: 0, max })?;
        frame.grow(count);
        Ok(())
    }

    pub fn read(&self, offset: i64, frame: i64) -> Result<Value, MemoryError> {
        let index = self.resolve_frame(frame)?;
        let slot = self.resolve_location(index, offset)?;
        self.frames[index].slots[slot]
            .clone()
            .ok_or(MemoryError::Uninitialised { offset, frame })
    }

    pub fn write(&mut self, offset: i64, frame: i64, value: Value) -> Result<(), MemoryError> {
        let index = self.resolve_frame(frame)?;
        let slot = self.resolve_location(index, offset)?;
        self.frames[index].slots[slot] = Some(value);
        Ok(())
    }

    /// Check that `count` slots starting at `start` all exist in `frame`.
    pub fn check_range(&self, frame: i64, start: i64, count: usize) -> Result<usize, MemoryError> {
        let index = self.resolve_frame(frame)?;
        let len = self.frames[index].len() as i64;
        let end = i64::try_from(count)
            .ok()
            .and_then(|count| start.checked_add(count))
            .map(|past| past - 1);
        match end {
            Some(end) if start >= 0 && end < len => Ok(index),
            end => Err(MemoryError::RangeOutOfBounds {
                start,
                end: end.unwrap_or(i64::MAX),
                max: len - 1,
            }),
        }
    }

    /// Read `count` consecutive initialised slots in forward order.
    pub fn read_range(&self, offset: i64, frame: i64, count: usize) -> Result<Vec<Value>, MemoryError> {
        let index = self.check_range(frame, offset, count)?;
        let start = offset as usize;
        self.frames[index].slots[start..start + count]
            .iter()
            .enumerate()
            .map(|(step, slot)| {
                slot.clone().ok_or(MemoryError::Uninitialised {
                    offset: offset + step as i64,
                    frame,
                })
            })
            .collect()
    }

    /// Write `values` into consecutive slots starting at `offset`.
    pub fn write_range(&mut self, offset: i64, frame: i64, values: Vec<Value>) -> Result<(), MemoryError> {
        let index = self.check_range(frame, offset, values.len())?;
        let start = offset as usize;
        for (slot, value) in self.frames[index].slots[start..].iter_mut().zip(values) {
            *slot = Some(value);
        }
        Ok(())
    }

    fn max_frame(&self) -> i64 {
        self.frames.len() as i64 - 1
    }

    fn resolve_frame(&self, frame: i64) -> Result<usize, MemoryError> {
        if frame < 0 || frame as usize >= self.frames.len() {
            return Err(MemoryError::FrameOutOfBounds {
                frame,
                max: self.max_frame(),
            });
        }
        Ok(frame as usize)
    }

    fn resolve_location(&self, index: usize, location: i64) -> Result<usize, MemoryError> {
        let len = self.frames[index].len();
        if location < 0 || location as usize >= len {
            return Err(MemoryError::LocationOutOfBounds {
                location,
                max: len as i64 - 1,
            });
        }
        Ok(location as usize)
    }
}

/// Memory level errors bubbled up to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("access to out of bounds frame {frame}, valid range is [0, {max}]")]
    FrameOutOfBounds { frame: i64, max: i64 },
    #[error("access to out of bounds location {location}, valid range is [0, {max}]")]
    LocationOutOfBounds { location: i64, max: i64 },
    #[error("access to out of bounds location range [{start}, {end}], valid range is [0, {max}]")]
    RangeOutOfBounds { start: i64, end: i64, max: i64 },
    #[error("memory access to undefined location [{offset}:{frame}]")]
    Uninitialised { offset: i64, frame: i64 },
}
