//! Execution statistics for the PixIR VM.
//!
//! The collector tracks what a run actually did: how many instructions
//! executed, how often each opcode ran, which instruction indices were
//! covered, and how deep the work, frame, and return stacks grew.  Tooling
//! reads it through `VirtualMachine::trace`; `reset` starts a fresh record.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::bytecode::Opcode;

/// Trace snapshot handed to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub instructions: u64,
    pub opcode_counts: BTreeMap<Opcode, u64>,
    /// Executed instruction indices, ascending.
    pub coverage: Vec<usize>,
    pub max_work_stack: usize,
    pub max_frame_depth: usize,
    pub max_call_depth: usize,
}

/// Internal helper recording trace state as the interpreter runs.
#[derive(Debug, Default)]
pub struct TraceCollector {
    instruction_count: u64,
    opcode_counts: BTreeMap<Opcode, u64>,
    coverage: BTreeSet<usize>,
    max_work_stack: usize,
    max_frame_depth: usize,
    max_call_depth: usize,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_instruction(&mut self, pc: usize, opcode: Opcode) {
        self.instruction_count += 1;
        *self.opcode_counts.entry(opcode).or_default() += 1;
        self.coverage.insert(pc);
    }

    pub fn record_depths(&mut self, work_stack: usize, frames: usize, calls: usize) {
        self.max_work_stack = self.max_work_stack.max(work_stack);
        self.max_frame_depth = self.max_frame_depth.max(frames);
        self.max_call_depth = self.max_call_depth.max(calls);
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> ExecutionTrace {
        ExecutionTrace {
            instructions: self.instruction_count,
            opcode_counts: self.opcode_counts.clone(),
            coverage: self.coverage.iter().copied().collect(),
            max_work_stack: self.max_work_stack,
            max_frame_depth: self.max_frame_depth,
            max_call_depth: self.max_call_depth,
        }
    }
}
