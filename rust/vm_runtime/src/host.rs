//! Host devices the VM talks to: a drawable surface, a text log, and a key
//! source.
//!
//! The interpreter only ever sees the traits below, so a UI, a terminal
//! runner, and the test-suite can each plug in their own devices.  The
//! in-memory implementations here are complete enough to run programs
//! headless and inspect what they drew and printed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pixel surface addressed in physical pixels, origin top-left.
pub trait Surface {
    /// Physical size as `(width, height)`.
    fn dimensions(&self) -> (u32, u32);
    /// Fill a rectangle; parts outside the surface are clipped.
    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, colour: u32);
    /// Packed `0xRRGGBB` colour at a pixel; outside the surface reads as black.
    fn read_pixel(&self, x: u32, y: u32) -> u32;
}

/// Append-only text output.
pub trait TextSink {
    fn append(&mut self, text: &str);
}

/// Key press delivered to `getchar`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Char(char),
    Enter,
    Tab,
    /// Any other named key; ignored by the VM.
    Named(String),
}

impl Key {
    /// Build a key from a key name, where single characters map to themselves.
    pub fn from_name(name: &str) -> Self {
        let mut chars = name.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Key::Char(ch),
            _ => match name {
                "Enter" => Key::Enter,
                "Tab" => Key::Tab,
                other => Key::Named(other.to_owned()),
            },
        }
    }

    /// Character code pushed by `getchar`, or `None` for keys it ignores.
    pub fn code(&self) -> Option<u32> {
        match self {
            Key::Char('\0') => None,
            Key::Char(ch) => Some(u32::from(*ch)),
            Key::Enter => Some(u32::from('\n')),
            Key::Tab => Some(u32::from('\t')),
            Key::Named(_) => None,
        }
    }
}

/// Source of key presses, polled with a bounded timeout.
pub trait KeySource {
    /// Wait at most `timeout` for the next key.
    fn poll_key(&mut self, timeout: Duration) -> Option<Key>;
}

impl KeySource for Receiver<Key> {
    fn poll_key(&mut self, timeout: Duration) -> Option<Key> {
        match self.recv_timeout(timeout) {
            Ok(key) => Some(key),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // No sender will ever deliver; still honour the poll interval.
                thread::sleep(timeout);
                None
            }
        }
    }
}

/// Key source for machines that never receive input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeys;

impl KeySource for NoKeys {
    fn poll_key(&mut self, timeout: Duration) -> Option<Key> {
        thread::sleep(timeout);
        None
    }
}

/// Pre-recorded key presses, replayed in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedKeys {
    keys: VecDeque<Key>,
}

impl ScriptedKeys {
    pub fn new(keys: impl IntoIterator<Item = Key>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Script typing `text`, with `\n` and `\t` sent as Enter and Tab.
    pub fn typed(text: &str) -> Self {
        Self::new(text.chars().map(|ch| match ch {
            '\n' => Key::Enter,
            '\t' => Key::Tab,
            other => Key::Char(other),
        }))
    }

    pub fn remaining(&self) -> usize {
        self.keys.len()
    }
}

impl KeySource for ScriptedKeys {
    fn poll_key(&mut self, timeout: Duration) -> Option<Key> {
        let key = self.keys.pop_front();
        if key.is_none() {
            thread::sleep(timeout);
        }
        key
    }
}

/// In-memory RGB surface, initially black.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| y as usize * self.width as usize + x as usize)
    }
}

impl Surface for PixelBuffer {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, colour: u32) {
        let x_end = x.saturating_add(width).min(self.width);
        let y_end = y.saturating_add(height).min(self.height);
        for row in y.min(y_end)..y_end {
            let base = row as usize * self.width as usize;
            for column in x.min(x_end)..x_end {
                self.pixels[base + column as usize] = colour;
            }
        }
    }

    fn read_pixel(&self, x: u32, y: u32) -> u32 {
        self.index(x, y).map_or(0, |index| self.pixels[index])
    }
}

/// Encode any surface as a binary PPM (`P6`) image.
pub fn encode_ppm(surface: &dyn Surface) -> Vec<u8> {
    let (width, height) = surface.dimensions();
    let mut out = format!("P6\n{width} {height}\n255\n").into_bytes();
    out.reserve(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            let rgb = surface.read_pixel(x, y);
            out.extend_from_slice(&[(rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8]);
        }
    }
    out
}

/// Cloneable log buffer; every clone appends to and reads the same text.
#[derive(Debug, Clone, Default)]
pub struct SharedLog {
    buffer: Arc<Mutex<String>>,
}

impl SharedLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TextSink for SharedLog {
    fn append(&mut self, text: &str) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }
}

impl TextSink for String {
    fn append(&mut self, text: &str) {
        self.push_str(text);
    }
}

/// The set of devices owned by one machine.
pub struct Devices {
    pub surface: Box<dyn Surface + Send>,
    pub log: Box<dyn TextSink + Send>,
    pub keys: Box<dyn KeySource + Send>,
}

impl Devices {
    pub fn new(
        surface: impl Surface + Send + 'static,
        log: impl TextSink + Send + 'static,
        keys: impl KeySource + Send + 'static,
    ) -> Self {
        Self {
            surface: Box::new(surface),
            log: Box::new(log),
            keys: Box::new(keys),
        }
    }

    /// 100x100 in-memory surface, a discarded log, and no keyboard.
    pub fn headless() -> Self {
        Self::new(PixelBuffer::new(100, 100), String::new(), NoKeys)
    }
}

impl fmt::Debug for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Devices")
            .field("surface", &self.surface.dimensions())
            .finish_non_exhaustive()
    }
}
