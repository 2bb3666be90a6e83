//! Read request lifecycle types.
//!
//! A request moves through four structural stages: queued in the FIFO
//! ([`PendingRead`]), being drained against the ring, occupying the
//! pipeline's active slot ([`ActiveRead`]) while the interrupt handler fills
//! it, and finalized into a [`ReadOutcome`] delivered to the completion
//! sink. The pipeline owns the request throughout; timers and the cancel
//! path hold only its [`RequestId`], so a stale trigger can never touch a
//! recycled request.

use alloc::vec::Vec;
use core::fmt;

use crate::timeout::TimeoutSpec;

/// Identifier of one read request. Unique per pipeline, never zero and
/// never reused; also serves as the finalize generation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a `RequestId` from a raw non-zero value.
    #[must_use]
    pub const fn new(val: u64) -> Self {
        debug_assert!(val != 0, "request id zero is reserved");
        Self(val)
    }

    /// Returns the raw `u64` value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a read completed. Exactly one is recorded per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The requested byte count was transferred (or an immediate-completion
    /// policy accepted fewer).
    Success,
    /// An interval or total timeout expired first.
    Timeout,
    /// The request was cancelled.
    Cancelled,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Timeout => f.write_str("timeout"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A finished read as reported to the completion sink.
///
/// `data` is the caller's buffer truncated to the bytes actually
/// transferred; timeouts and cancellations preserve partial data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// The request this outcome belongs to.
    pub id: RequestId,
    /// Transferred bytes, oldest first.
    pub data: Vec<u8>,
    /// Terminal status.
    pub reason: CompletionReason,
}

/// A submitted read waiting in the FIFO for the device to go idle.
pub(crate) struct PendingRead {
    pub id: RequestId,
    pub buf: Vec<u8>,
}

impl PendingRead {
    /// Requested byte count (the destination buffer's length).
    pub fn requested(&self) -> usize {
        self.buf.len()
    }
}

/// The single in-flight read occupying the pipeline's active slot.
pub(crate) struct ActiveRead {
    pub id: RequestId,
    pub buf: Vec<u8>,
    /// Effective requested length; may have been crunched to `filled + 1`.
    pub needed: usize,
    /// Bytes transferred so far (initial drain plus handler copies).
    pub filled: usize,
    /// Timeout policy derived at dequeue time.
    pub spec: TimeoutSpec,
}

impl ActiveRead {
    /// Consumes the request into its outcome, truncating the buffer to the
    /// transferred bytes.
    pub fn into_outcome(mut self, reason: CompletionReason) -> ReadOutcome {
        self.buf.truncate(self.filled);
        ReadOutcome {
            id: self.id,
            data: self.buf,
            reason,
        }
    }
}
