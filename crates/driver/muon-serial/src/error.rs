//! Receive engine error types.

use core::fmt;

/// Errors surfaced by the receive engine.
///
/// Timeouts and cancellations are not errors; they are terminal completion
/// statuses carried on the request (see
/// [`CompletionReason`](crate::request::CompletionReason)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    /// An allocation failed (buffer resize or request setup).
    InsufficientResources,
    /// The device is not in a state that accepts this operation.
    InvalidState,
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientResources => f.write_str("insufficient resources"),
            Self::InvalidState => f.write_str("invalid device state"),
        }
    }
}
