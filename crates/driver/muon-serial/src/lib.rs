//! Serial port receive engine.
//!
//! The receive half of a character device driver: bytes arrive from the RX
//! interrupt handler at any time and land in a ring buffer; read requests
//! drain that buffer and, when it runs dry, redirect the handler into the
//! caller's own buffer until the request is satisfied, an interval or total
//! timeout expires, or the request is cancelled.
//!
//! [`ReadPipeline`] is the entry point. The interrupt handler feeds it via
//! [`ReadPipeline::on_bytes_delivered`], which signals satisfied reads back
//! to the platform; the platform's deferred work context finalizes them via
//! [`ReadPipeline::process_completions`] and drives the timers via
//! [`ReadPipeline::on_tick`]. Clients submit and cancel reads and receive
//! completions through a [`CompletionSink`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod pipeline;
pub mod request;
pub mod ring;
pub mod timeout;
pub mod timer;

pub use error::RxError;
pub use pipeline::{CompletionSink, ReadPipeline, Submitted};
pub use request::{CompletionReason, ReadOutcome, RequestId};
pub use ring::RxRing;
pub use timeout::{ReadTimeouts, TimeoutFlags, TimeoutSpec};
pub use timer::{DeadlineTimer, TimerHandle};
