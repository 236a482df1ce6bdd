//! Instance-wide critical section.
//!
//! The host serializes an instance cooperatively; inside the library the
//! same guarantee is expressed as [`Gate`], a mutex-backed critical
//! section. It is used exactly where a read-modify-write must not
//! interleave with other work: first-pass schema bring-up, the
//! `MAX(version) + 1` event append, and saga state transitions.

use std::sync::Mutex;

/// Serializes critical sections against all other gated work.
#[derive(Debug, Default)]
pub struct Gate {
    inner: Mutex<()>,
}

impl Gate {
    /// Creates a new gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` to completion before any other gated section starts.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}
