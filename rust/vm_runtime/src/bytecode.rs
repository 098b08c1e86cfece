//! Bytecode model for the PixIR virtual machine.
//!
//! PixIR programs arrive as text, one instruction per line.  The types below
//! describe the opcode set, decoded instructions, and the linked program the
//! interpreter executes.  Decoding is strict: operand syntax fixes the tag of
//! the pushed value up front so the interpreter never has to guess.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interpreter::ErrorKind;
use crate::memory::Value;

/// Largest packed colour accepted by the screen opcodes.
pub const MAX_COLOUR: u32 = 0xFF_FFFF;

/// Enumeration of all opcodes recognised by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    /// Arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Inc,
    Dec,
    Max,
    Min,
    Round,
    /// Random integer below the popped bound.
    Irnd,
    /// Logical operations and comparisons.
    And,
    Or,
    Not,
    Lt,
    Le,
    Eq,
    Neq,
    Gt,
    Ge,
    /// Stack and control flow.
    Dup,
    Drop,
    Push,
    Nop,
    Jmp,
    Cjmp,
    Cjmp2,
    Call,
    Ret,
    Halt,
    /// Frames and memory.
    Alloc,
    Oframe,
    Cframe,
    St,
    Delay,
    /// Screen.
    Write,
    Writebox,
    Clear,
    Read,
    Width,
    Height,
    /// Log output.
    Print,
    /// Bulk array transfer.
    Dupa,
    Sta,
    Pusha,
    Printa,
    Reta,
    /// Low-level character I/O.
    Getchar,
    Putchar,
}

impl Opcode {
    pub const ALL: [Opcode; 49] = [
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::Inc,
        Opcode::Dec,
        Opcode::Max,
        Opcode::Min,
        Opcode::Round,
        Opcode::Irnd,
        Opcode::And,
        Opcode::Or,
        Opcode::Not,
        Opcode::Lt,
        Opcode::Le,
        Opcode::Eq,
        Opcode::Neq,
        Opcode::Gt,
        Opcode::Ge,
        Opcode::Dup,
        Opcode::Drop,
        Opcode::Push,
        Opcode::Nop,
        Opcode::Jmp,
        Opcode::Cjmp,
        Opcode::Cjmp2,
        Opcode::Call,
        Opcode::Ret,
        Opcode::Halt,
        Opcode::Alloc,
        Opcode::Oframe,
        Opcode::Cframe,
        Opcode::St,
        Opcode::Delay,
        Opcode::Write,
        Opcode::Writebox,
        Opcode::Clear,
        Opcode::Read,
        Opcode::Width,
        Opcode::Height,
        Opcode::Print,
        Opcode::Dupa,
        Opcode::Sta,
        Opcode::Pusha,
        Opcode::Printa,
        Opcode::Reta,
        Opcode::Getchar,
        Opcode::Putchar,
    ];

    /// Lower-case mnemonic used in program text.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Inc => "inc",
            Opcode::Dec => "dec",
            Opcode::Max => "max",
            Opcode::Min => "min",
            Opcode::Round => "round",
            Opcode::Irnd => "irnd",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Not => "not",
            Opcode::Lt => "lt",
            Opcode::Le => "le",
            Opcode::Eq => "eq",
            Opcode::Neq => "neq",
            Opcode::Gt => "gt",
            Opcode::Ge => "ge",
            Opcode::Dup => "dup",
            Opcode::Drop => "drop",
            Opcode::Push => "push",
            Opcode::Nop => "nop",
            Opcode::Jmp => "jmp",
            Opcode::Cjmp => "cjmp",
            Opcode::Cjmp2 => "cjmp2",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Halt => "halt",
            Opcode::Alloc => "alloc",
            Opcode::Oframe => "oframe",
            Opcode::Cframe => "cframe",
            Opcode::St => "st",
            Opcode::Delay => "delay",
            Opcode::Write => "write",
            Opcode::Writebox => "writebox",
            Opcode::Clear => "clear",
            Opcode::Read => "read",
            Opcode::Width => "width",
            Opcode::Height => "height",
            Opcode::Print => "print",
            Opcode::Dupa => "dupa",
            Opcode::Sta => "sta",
            Opcode::Pusha => "pusha",
            Opcode::Printa => "printa",
            Opcode::Reta => "reta",
            Opcode::Getchar => "getchar",
            Opcode::Putchar => "putchar",
        }
    }

    /// Whether instructions with this opcode carry an operand.
    pub fn takes_operand(self) -> bool {
        matches!(self, Opcode::Push | Opcode::Pusha)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for Opcode {
    type Err = DecodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let lowered = text.to_lowercase();
        Opcode::ALL
            .iter()
            .copied()
            .find(|opcode| opcode.mnemonic() == lowered)
            .ok_or_else(|| DecodeError::UnknownOpcode(text.to_owned()))
    }
}

/// Primary instruction format for the VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<Value>,
}

impl Instruction {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operand: None,
        }
    }

    pub fn with_operand(opcode: Opcode, operand: Value) -> Self {
        Self {
            opcode,
            operand: Some(operand),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Some(operand) => write!(f, "{} {}", self.opcode, operand),
            None => write!(f, "{}", self.opcode),
        }
    }
}

/// Linked program: instruction list plus function entry points.
///
/// Programs are produced by an assembler outside this crate and treated as
/// immutable once loaded.  Function references are only resolved when an
/// instruction uses them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    #[serde(default)]
    pub functions: BTreeMap<String, usize>,
}

impl Default for Program {
    /// The program that does nothing and halts immediately.
    fn default() -> Self {
        Self {
            instructions: vec![Instruction::new(Opcode::Halt)],
            functions: BTreeMap::from([(".main".to_owned(), 0)]),
        }
    }
}

impl Program {
    pub fn new(instructions: Vec<Instruction>, functions: BTreeMap<String, usize>) -> Self {
        Self {
            instructions,
            functions,
        }
    }

    /// Decode already-linked text lines and attach a function table.
    pub fn from_lines<I, S, F>(lines: I, functions: F) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: IntoIterator<Item = (String, usize)>,
    {
        let instructions = lines
            .into_iter()
            .enumerate()
            .map(|(index, line)| {
                decode_instruction(line.as_ref()).map_err(|source| DecodeError::Line {
                    line: index + 1,
                    source: Box::new(source),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut table = BTreeMap::new();
        for (name, address) in functions {
            validate_function_name(&name)?;
            table.insert(name, address);
        }
        Ok(Self::new(instructions, table))
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instruction(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn function_address(&self, name: &str) -> Option<usize> {
        self.functions.get(name).copied()
    }
}

/// Errors raised while turning text into instructions and operands.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("empty instruction line")]
    EmptyLine,
    #[error("{0} is not a valid instruction")]
    UnknownOpcode(String),
    #[error("operand for {0} instruction was not specified")]
    MissingOperand(Opcode),
    #[error("extra operands specified for {0} instruction; can only specify one")]
    ExtraOperands(Opcode),
    #[error("{opcode} instruction takes no operand, found {found}")]
    UnexpectedOperand { opcode: Opcode, found: String },
    #[error("invalid operand {found} to {opcode} instruction, expected a memory location [offset:frame]")]
    ExpectedLocation { opcode: Opcode, found: String },
    #[error("invalid operand {0} found")]
    InvalidOperand(String),
    #[error("invalid label {0} found")]
    InvalidLabel(String),
    #[error("invalid PC offset {0} found")]
    InvalidPcOffset(String),
    #[error("invalid function name {0} found")]
    InvalidFunctionName(String),
    #[error("invalid colour literal {0}, expected #RRGGBB")]
    InvalidColour(String),
    #[error("invalid RGB number {0}, must be in range [0, 0xffffff]")]
    ColourOutOfRange(f64),
    #[error("line {line}: {source}")]
    Line {
        line: usize,
        #[source]
        source: Box<DecodeError>,
    },
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::ColourOutOfRange(_) => ErrorKind::Range,
            DecodeError::Line { source, .. } => source.kind(),
            _ => ErrorKind::Syntax,
        }
    }
}

/// Decode one line of program text.
pub fn decode_instruction(line: &str) -> Result<Instruction, DecodeError> {
    let mut tokens = line.split_whitespace();
    let head = tokens.next().ok_or(DecodeError::EmptyLine)?;
    let opcode: Opcode = head.parse()?;
    let operands: Vec<&str> = tokens.collect();

    if !opcode.takes_operand() {
        return match operands.first() {
            Some(found) => Err(DecodeError::UnexpectedOperand {
                opcode,
                found: (*found).to_owned(),
            }),
            None => Ok(Instruction::new(opcode)),
        };
    }

    let text = match operands.as_slice() {
        [] => return Err(DecodeError::MissingOperand(opcode)),
        [text] => *text,
        _ => return Err(DecodeError::ExtraOperands(opcode)),
    };

    match opcode {
        Opcode::Pusha => match parse_operand(text) {
            Ok(location @ Value::Label { .. }) => Ok(Instruction::with_operand(opcode, location)),
            _ => Err(DecodeError::ExpectedLocation {
                opcode,
                found: text.to_owned(),
            }),
        },
        _ => Ok(Instruction::with_operand(opcode, parse_operand(text)?)),
    }
}

/// Parse a push operand; the first grammar that matches decides the tag.
pub fn parse_operand(text: &str) -> Result<Value, DecodeError> {
    if let Some(number) = parse_number(text) {
        return Ok(Value::Number(number));
    }

    if text.starts_with('.') {
        validate_function_name(text)?;
        return Ok(Value::Function(text.to_owned()));
    }

    if let Some(rest) = text.strip_prefix('+') {
        if is_bracketed(rest) {
            let (offset, frame) =
                parse_location(rest).ok_or_else(|| DecodeError::InvalidLabel(text.to_owned()))?;
            return Ok(Value::LabelWithOffset { offset, frame });
        }
    }

    if is_bracketed(text) {
        let (offset, frame) =
            parse_location(text).ok_or_else(|| DecodeError::InvalidLabel(text.to_owned()))?;
        return Ok(Value::Label { offset, frame });
    }

    if let Some(rest) = text.strip_prefix("#PC") {
        return rest
            .parse::<i64>()
            .map(Value::PcOffset)
            .map_err(|_| DecodeError::InvalidPcOffset(text.to_owned()));
    }

    if text.len() == 7 && text.starts_with('#') {
        return hex_to_colour(text).map(|colour| Value::Number(f64::from(colour)));
    }

    Err(DecodeError::InvalidOperand(text.to_owned()))
}

/// Require `.` followed by at least one alphanumeric or `_` character.
pub fn validate_function_name(name: &str) -> Result<(), DecodeError> {
    let valid = match name.strip_prefix('.') {
        Some(rest) => {
            !rest.is_empty()
                && rest
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(DecodeError::InvalidFunctionName(name.to_owned()))
    }
}

/// Render a packed RGB value as `#rrggbb`.
pub fn colour_to_hex(rgb: i64) -> Result<String, DecodeError> {
    if !(0..=i64::from(MAX_COLOUR)).contains(&rgb) {
        return Err(DecodeError::ColourOutOfRange(rgb as f64));
    }
    Ok(format!("#{rgb:06x}"))
}

/// Parse a `#RRGGBB` literal into a packed RGB value.
pub fn hex_to_colour(text: &str) -> Result<u32, DecodeError> {
    let invalid = || DecodeError::InvalidColour(text.to_owned());
    let digits = text.strip_prefix('#').ok_or_else(invalid)?;
    if digits.len() != 6 || !digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    u32::from_str_radix(digits, 16).map_err(|_| invalid())
}

/// Validate a numeric stack value as a packed colour.
pub fn colour_from_number(value: f64) -> Result<u32, DecodeError> {
    if !(0.0..=f64::from(MAX_COLOUR)).contains(&value) {
        return Err(DecodeError::ColourOutOfRange(value));
    }
    Ok(value as u32)
}

fn parse_number(text: &str) -> Option<f64> {
    // Keeps `inf`/`NaN` spellings out; exponents are the only letters allowed.
    if text
        .chars()
        .any(|ch| ch.is_ascii_alphabetic() && ch != 'e' && ch != 'E')
    {
        return None;
    }
    text.parse::<f64>().ok().filter(|value| !value.is_nan())
}

fn is_bracketed(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('[') && text.ends_with(']')
}

fn parse_location(bracketed: &str) -> Option<(i64, i64)> {
    let inner = &bracketed[1..bracketed.len() - 1];
    let mut parts = inner.splitn(2, ':');
    let offset = parts.next()?.trim().parse::<i64>().ok()?;
    let frame = match parts.next() {
        Some(frame) => frame.trim().parse::<i64>().ok()?,
        None => 0,
    };
    Some((offset, frame))
}
