//! Kernel process identifier type.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a kernel process.
///
/// Every spawn gets a fresh ID, so a kernel restarted after a crash is
/// distinguishable from its predecessor. Displayed as `proc-XXXXXXXX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ProcessId(u64);

impl ProcessId {
    /// Allocate a new unique process ID.
    pub fn new() -> Self {
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Create a ProcessId from a raw u64 value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{:08x}", self.0)
    }
}

impl FromStr for ProcessId {
    type Err = crate::error::KnobooError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("proc-")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(ProcessId)
            .ok_or_else(|| crate::error::KnobooError::ProcessNotFound(s.into()))
    }
}

impl From<ProcessId> for String {
    fn from(id: ProcessId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ProcessId {
    type Error = crate::error::KnobooError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
