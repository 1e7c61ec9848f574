//! Error types.
//!
//! The scheduler distinguishes three failure classes:
//!
//! - **Contract violations** (ref-count overflow, installing into an
//!   occupied slot, polling the context outside a participant) fail fast
//!   with an assertion. They indicate a bug in the caller, not a runtime
//!   condition.
//! - **Resource exhaustion** (no free participant slot) is reported to the
//!   caller as a [`SpawnError`].
//! - **Participant-internal failures** are not errors for the scheduler at
//!   all; whatever value the polling closure produces is delivered through
//!   its completion continuation.

use core::fmt;

/// Errors that can occur when spawning a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Every participant slot of the party is currently allocated.
    ///
    /// The reservation did not happen; the party is unchanged. Callers that
    /// can tolerate backpressure may retry after an existing participant
    /// completes.
    Full,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "all participant slots are allocated"),
        }
    }
}

impl std::error::Error for SpawnError {}
