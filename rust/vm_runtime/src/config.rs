//! Machine configuration.
//!
//! The logical screen is what programs address with `write`/`read`; it is
//! scaled onto the physical surface, so it may never be larger than it.  The
//! key poll interval bounds how long `getchar` can go without noticing a pause
//! or stop request.  The stack and frame limits cap what a single `dupa`,
//! `oframe` or `alloc` may ask for.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical screen edge used when the caller does not pick one.
pub const DEFAULT_SCREEN_SIZE: u32 = 100;

/// How long `getchar` waits for a key before re-checking control requests.
pub const DEFAULT_KEY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Most values `dupa` may leave on the work stack.
pub const DEFAULT_STACK_LIMIT: usize = 1 << 20;

/// Most slots `oframe` or `alloc` may give a single frame.
pub const DEFAULT_FRAME_LIMIT: usize = 1 << 20;

mod duration_format {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Call-site configurable machine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub width: u32,
    pub height: u32,
    #[serde(with = "duration_format")]
    pub key_poll_interval: Duration,
    /// Seed for `irnd`; `None` draws one from the OS.
    pub rng_seed: Option<u64>,
    pub stack_limit: usize,
    pub frame_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_SCREEN_SIZE,
            height: DEFAULT_SCREEN_SIZE,
            key_poll_interval: DEFAULT_KEY_POLL_INTERVAL,
            rng_seed: None,
            stack_limit: DEFAULT_STACK_LIMIT,
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }
}

impl VmConfig {
    pub fn with_screen(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_key_poll_interval(mut self, interval: Duration) -> Self {
        self.key_poll_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_limits(mut self, stack_limit: usize, frame_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self.frame_limit = frame_limit;
        self
    }
}
