//! Read-only inspection queries used by debugger front ends.
//!
//! ```text
//! #PC
//! workStack | workStack.len | workStack[i] | workStack[a..b]
//! retStack  | retStack.len  | retStack[i]  | retStack[a..b]
//! [o:f] | [o] | [:f] | [:f].len | [:] | [:].len
//! ```
//!
//! Stack indices count from the bottom of the stack.  Slices are half-open.
//! Frame 0 is the innermost frame.

use std::fmt::Display;

use crate::interpreter::{VirtualMachine, VmError};
use crate::memory::UNDEFINED;

impl VirtualMachine {
    /// Evaluate a query against the current state.
    pub fn query(&self, query: &str) -> Result<String, VmError> {
        let query = query.trim();
        if query == "#PC" {
            return Ok(self.pc.to_string());
        }
        if let Some(rest) = query.strip_prefix("workStack") {
            return stack_query(query, "workStack", rest, &self.work_stack);
        }
        if let Some(rest) = query.strip_prefix("retStack") {
            return stack_query(query, "retStack", rest, &self.ret_stack);
        }
        if query.starts_with('[') {
            return self.memory_query(query);
        }
        Err(VmError::QuerySyntax(query.to_owned()))
    }

    fn memory_query(&self, query: &str) -> Result<String, VmError> {
        let (address, len_suffix) = match query.strip_suffix(".len") {
            Some(address) => (address, true),
            None => (query, false),
        };
        let inner = address
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| syntax(query))?;
        let (offset, frame) = match inner.split_once(':') {
            Some((offset, frame)) => (offset.trim(), Some(frame.trim())),
            None => (inner.trim(), None),
        };

        match (offset.is_empty(), frame) {
            (true, Some("")) => {
                if len_suffix {
                    return Ok(self.frames.len().to_string());
                }
                let lines: Vec<String> = self
                    .frames
                    .iter()
                    .enumerate()
                    .map(|(index, frame)| format!("{index}: {frame}"))
                    .collect();
                Ok(lines.join("\n"))
            }
            (true, Some(frame)) => {
                let index = parse_index(query, frame)?;
                let frame = self
                    .frames
                    .frame(bounded(index, self.frames.len(), "frame")?)
                    .ok_or_else(|| syntax(query))?;
                Ok(if len_suffix {
                    frame.len().to_string()
                } else {
                    frame.to_string()
                })
            }
            (false, frame) if !len_suffix => {
                let location = parse_index(query, offset)?;
                let frame_index = match frame {
                    Some("") => return Err(syntax(query)),
                    Some(frame) => parse_index(query, frame)?,
                    None => 0,
                };
                let frame = self
                    .frames
                    .frame(bounded(frame_index, self.frames.len(), "frame")?)
                    .ok_or_else(|| syntax(query))?;
                let slot = frame
                    .slot(bounded(location, frame.len(), "location")?)
                    .ok_or_else(|| syntax(query))?;
                Ok(slot
                    .as_ref()
                    .map_or_else(|| UNDEFINED.to_owned(), ToString::to_string))
            }
            _ => Err(syntax(query)),
        }
    }
}

fn stack_query<T: Display>(
    query: &str,
    name: &'static str,
    rest: &str,
    items: &[T],
) -> Result<String, VmError> {
    if rest.is_empty() {
        return Ok(render(items));
    }
    if rest == ".len" {
        return Ok(items.len().to_string());
    }
    let inner = rest
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| syntax(query))?;
    match inner.split_once("..") {
        Some((start, end)) => {
            let start = parse_index(query, start.trim())?;
            let end = parse_index(query, end.trim())?;
            let end = bounded(end, items.len() + 1, name)?;
            let start = bounded(start, end + 1, name)?;
            Ok(render(&items[start..end]))
        }
        None => {
            let index = parse_index(query, inner.trim())?;
            Ok(items[bounded(index, items.len(), name)?].to_string())
        }
    }
}

fn render<T: Display>(items: &[T]) -> String {
    let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

fn parse_index(query: &str, text: &str) -> Result<i64, VmError> {
    text.parse().map_err(|_| syntax(query))
}

/// Check `index` against a collection of `len` items.
fn bounded(index: i64, len: usize, what: &'static str) -> Result<usize, VmError> {
    if index < 0 || index as usize >= len {
        return Err(VmError::QueryRange {
            what,
            index,
            max: len as i64 - 1,
        });
    }
    Ok(index as usize)
}

fn syntax(query: &str) -> VmError {
    VmError::QuerySyntax(query.to_owned())
}
