//! Read pipeline orchestration.
//!
//! Owns the shared receive state and arbitrates between the contexts that
//! touch it: the RX interrupt handler (producer), the platform's deferred
//! work context (completion and timer dispatch), and client submit/cancel
//! calls.
//!
//! The handler path is confined to the short interrupt-masked section
//! around `IoShared` (ring, producer target, active slot) — no allocation,
//! no other lock, no callbacks inside. A read the handler satisfies is
//! finalized later by [`ReadPipeline::process_completions`] in deferred
//! context; the remaining locks (queue, timers, config, consumer) are
//! plain spin locks taken from thread or deferred context only, never from
//! an interrupt.
//!
//! The finalize commit word is an atomic holding the in-flight request id.
//! Deferred handler completion, interval timeout, total timeout, and
//! cancellation all race a single `compare_exchange(id, 0)`; whoever wins
//! owns the finalize, everyone else backs off. Which trigger wins a close
//! race is deliberately unspecified.
//!
//! Lock order: queue/consumer → io; the timer wheel's lock is a leaf. No
//! lock is ever held across a completion-sink callback.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use muon_core::sync::{IrqSpinLock, SpinLock};

use crate::error::RxError;
use crate::request::{ActiveRead, CompletionReason, PendingRead, ReadOutcome, RequestId};
use crate::ring::{RingMigration, RxRing};
use crate::timeout::{ReadTimeouts, TimeoutController, TimeoutFlags, TimeoutSpec, TimerEvent};
use crate::timer::DeadlineTimer;

/// Bytes copied per ring-migration step before the interrupt-masked section
/// is released.
const RESIZE_CHUNK: usize = 64;

/// Receiver of finished reads. Called from thread or deferred context with
/// no pipeline locks held — never from the interrupt handler. It is safe
/// to submit a new read from inside the callback.
pub trait CompletionSink: Send + Sync {
    /// Delivers one finished read.
    fn read_complete(&self, outcome: ReadOutcome);
}

/// Result of [`ReadPipeline::submit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Submitted {
    /// Satisfied synchronously from buffered data.
    Complete(ReadOutcome),
    /// In flight; the outcome arrives through the [`CompletionSink`].
    Pending(RequestId),
}

/// Where the interrupt handler's bytes land.
enum ProduceTarget {
    /// Into the ring buffer (no read in flight, or the active read is
    /// already satisfied).
    RxBuffer,
    /// Directly into the active read's destination buffer.
    ActiveRequest,
}

/// State inside the short interrupt-masked critical section.
struct IoShared {
    ring: RxRing,
    target: ProduceTarget,
    active: Option<ActiveRead>,
    /// Bytes dropped because the ring was full.
    overruns: u64,
}

/// Submission FIFO plus the device-busy flag that serializes dequeues.
struct QueueState {
    items: VecDeque<PendingRead>,
    busy: bool,
}

/// Outcome of starting one dequeued read.
enum BeginOutcome {
    Pending,
    Complete(ReadOutcome),
}

/// The receive engine for one serial device.
pub struct ReadPipeline {
    io: IrqSpinLock<IoShared>,
    /// Finalize commit word: the in-flight request id, zero when none.
    commit: AtomicU64,
    timers: SpinLock<TimeoutController>,
    service: DeadlineTimer<TimerEvent>,
    queue: SpinLock<QueueState>,
    config: SpinLock<ReadTimeouts>,
    /// Excludes concurrent consumers for the duration of a buffer regrow.
    consumer: SpinLock<()>,
    next_id: AtomicU64,
    now: AtomicU64,
    accepting: AtomicBool,
    sink: Arc<dyn CompletionSink>,
}

impl ReadPipeline {
    /// Creates a pipeline with a ring buffer of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RxError::InsufficientResources`] if the ring allocation
    /// fails.
    pub fn new(capacity: usize, sink: Arc<dyn CompletionSink>) -> Result<Self, RxError> {
        Ok(Self {
            io: IrqSpinLock::new(IoShared {
                ring: RxRing::with_capacity(capacity)?,
                target: ProduceTarget::RxBuffer,
                active: None,
                overruns: 0,
            }),
            commit: AtomicU64::new(0),
            timers: SpinLock::new(TimeoutController::new()),
            service: DeadlineTimer::new(),
            queue: SpinLock::new(QueueState {
                items: VecDeque::new(),
                busy: false,
            }),
            config: SpinLock::new(ReadTimeouts::none()),
            consumer: SpinLock::new(()),
            next_id: AtomicU64::new(1),
            now: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            sink,
        })
    }

    // ── Client interface ────────────────────────────────────────────────

    /// Submits a read for `buf.len()` bytes into `buf`.
    ///
    /// Zero-length reads complete immediately with success and zero bytes,
    /// bypassing the queue. Otherwise the read either completes
    /// synchronously from buffered data or goes pending; pending reads
    /// complete through the [`CompletionSink`].
    ///
    /// # Errors
    ///
    /// Returns [`RxError::InvalidState`] if the device is not accepting
    /// requests.
    pub fn submit(&self, buf: Vec<u8>) -> Result<Submitted, RxError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RxError::InvalidState);
        }
        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        if buf.is_empty() {
            return Ok(Submitted::Complete(ReadOutcome {
                id,
                data: buf,
                reason: CompletionReason::Success,
            }));
        }

        let req = PendingRead { id, buf };
        {
            let mut queue = self.queue.lock();
            if queue.busy {
                queue.items.push_back(req);
                log::trace!("read {id} queued behind the current request");
                return Ok(Submitted::Pending(id));
            }
            queue.busy = true;
        }
        match self.begin_read(req) {
            BeginOutcome::Pending => Ok(Submitted::Pending(id)),
            BeginOutcome::Complete(outcome) => {
                // A submit that raced us may have queued behind this one.
                self.start_next();
                Ok(Submitted::Complete(outcome))
            }
        }
    }

    /// Requests cancellation of an in-flight read. Asynchronous and
    /// best-effort: if cancellation wins the finalize race the outcome is
    /// reported through the sink, partial bytes preserved; if the read
    /// already finalized this is a no-op.
    pub fn cancel(&self, id: RequestId) {
        self.try_finalize(id, CompletionReason::Cancelled);
    }

    /// Replaces the device-wide read timeout configuration. Affects
    /// requests dequeued after this call; the in-flight request keeps the
    /// spec derived at its own dequeue.
    pub fn set_timeouts(&self, timeouts: ReadTimeouts) {
        *self.config.lock() = timeouts;
    }

    /// Current read timeout configuration.
    #[must_use]
    pub fn timeouts(&self) -> ReadTimeouts {
        *self.config.lock()
    }

    /// Gates [`submit`](ReadPipeline::submit); submissions while not
    /// accepting fail with [`RxError::InvalidState`].
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Grows the ring buffer to `new_capacity` bytes.
    ///
    /// Shrinking is accepted as a no-op; buffered bytes are never dropped.
    /// The copy runs in bounded steps so the interrupt handler is never
    /// locked out longer than one step; bytes it appends mid-migration are
    /// carried over.
    ///
    /// # Errors
    ///
    /// Returns [`RxError::InsufficientResources`] if the new allocation
    /// fails; the existing buffer is left untouched and fully usable.
    pub fn resize_rx_buffer(&self, new_capacity: usize) -> Result<(), RxError> {
        let _consumer = self.consumer.lock();
        {
            let io = self.io.lock();
            if new_capacity <= io.ring.capacity() {
                return Ok(());
            }
        }
        // Allocation happens outside the interrupt-masked section.
        let mut migration = RingMigration::new(new_capacity)?;
        loop {
            let mut io = self.io.lock();
            if io.ring.migrate_step(&mut migration, RESIZE_CHUNK) {
                io.ring.finish_resize(migration);
                let len = io.ring.len();
                drop(io);
                log::debug!("rx buffer grown to {new_capacity} bytes ({len} buffered)");
                return Ok(());
            }
        }
    }

    /// Bytes currently buffered in the ring.
    #[must_use]
    pub fn rx_buffered(&self) -> usize {
        self.io.lock().ring.len()
    }

    /// Total bytes dropped to receive overruns since creation.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.io.lock().overruns
    }

    // ── Interrupt-handler interface ─────────────────────────────────────

    /// Accepts bytes from the RX interrupt handler.
    ///
    /// Bytes land in whichever target the producer redirect names. Bytes
    /// beyond the active read's remaining need spill into the ring. Runs
    /// entirely inside the short interrupt-masked section and takes no
    /// other lock, so it never blocks.
    ///
    /// Returns `true` when the active read became satisfied; the platform
    /// then schedules [`process_completions`](ReadPipeline::process_completions)
    /// in its deferred work context. Finalize never runs from the handler.
    #[must_use]
    pub fn on_bytes_delivered(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let mut satisfied = false;
        let mut dropped = 0;
        {
            let mut io = self.io.lock();
            match io.target {
                ProduceTarget::RxBuffer => {
                    let accepted = io.ring.produce(bytes);
                    dropped = bytes.len() - accepted;
                }
                ProduceTarget::ActiveRequest => {
                    let Some(active) = io.active.as_mut() else {
                        panic!("produce target is the active request but no read is active");
                    };
                    let n = bytes.len().min(active.needed - active.filled);
                    let at = active.filled;
                    active.buf[at..at + n].copy_from_slice(&bytes[..n]);
                    active.filled += n;
                    let done = active.filled == active.needed
                        || (active.spec.has(TimeoutFlags::COMPLETE_ON_ANY) && active.filled > 0);
                    if done {
                        satisfied = true;
                        io.target = ProduceTarget::RxBuffer;
                        if n < bytes.len() {
                            let accepted = io.ring.produce(&bytes[n..]);
                            dropped = bytes.len() - n - accepted;
                        }
                    }
                }
            }
            if dropped > 0 {
                io.overruns += dropped as u64;
            }
        }
        if dropped > 0 {
            log::warn!("serial rx overrun: {dropped} bytes dropped");
        }
        satisfied
    }

    // ── Deferred-work interface ─────────────────────────────────────────

    /// Finalizes a read the interrupt handler satisfied.
    ///
    /// Called by the platform from its deferred work context whenever
    /// [`on_bytes_delivered`](ReadPipeline::on_bytes_delivered) returned
    /// `true`. Idempotent; a spurious call when nothing is satisfied (or
    /// another trigger already won) is a no-op.
    pub fn process_completions(&self) {
        let satisfied = {
            let io = self.io.lock();
            io.active.as_ref().and_then(|active| {
                let done = active.filled == active.needed
                    || (active.spec.has(TimeoutFlags::COMPLETE_ON_ANY) && active.filled > 0);
                done.then_some(active.id)
            })
        };
        if let Some(id) = satisfied {
            self.try_finalize(id, CompletionReason::Success);
        }
    }

    // ── Tick interface ──────────────────────────────────────────────────

    /// Advances the pipeline clock and dispatches due timers. Called from
    /// the platform's deferred tick work (1 tick = 1 ms), not from the
    /// tick interrupt itself.
    pub fn on_tick(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
        // A satisfied read beats its own deadlines when both are pending.
        self.process_completions();
        for event in self.service.expire(now) {
            match event {
                TimerEvent::Interval(id) => self.on_interval_timeout(id),
                TimerEvent::Total(id) => {
                    // Total deadline: finalize unconditionally (if we lose
                    // the race, another trigger already finalized).
                    self.try_finalize(id, CompletionReason::Timeout);
                }
            }
        }
    }

    /// Interval timer check: progress since the baseline re-arms; silence
    /// finalizes. The interval clock never starts before the first byte,
    /// so a firing with zero bytes transferred is always a re-arm.
    fn on_interval_timeout(&self, id: RequestId) {
        let filled = {
            let io = self.io.lock();
            match io.active.as_ref() {
                Some(active) if active.id == id => active.filled,
                // Stale timer for an already-finalized read.
                _ => return,
            }
        };
        let now = self.now.load(Ordering::Relaxed);
        {
            let mut timers = self.timers.lock();
            // Re-validate under the timer lock: the read may have finalized
            // (and a successor armed) since the check above.
            if self.commit.load(Ordering::SeqCst) != id.as_u64() {
                return;
            }
            if filled == 0 || filled > timers.baseline() {
                timers.rearm_interval(&self.service, now, filled, id);
                return;
            }
        }
        self.try_finalize(id, CompletionReason::Timeout);
    }

    // ── Request lifecycle ───────────────────────────────────────────────

    /// Starts one dequeued read: snapshot the timeout config, drain the
    /// ring, and either complete on the spot or go pending with the
    /// producer redirected and timers armed.
    fn begin_read(&self, req: PendingRead) -> BeginOutcome {
        let requested = req.requested();
        // One atomic snapshot of the mutable device config per request.
        let spec = TimeoutSpec::compute(requested, &self.config.lock());
        let PendingRead { id, mut buf } = req;

        let _consumer = self.consumer.lock();
        let mut io = self.io.lock();
        let before = io.ring.len();
        let filled = io.ring.drain(&mut buf);
        let low = io.ring.capacity() / 4;
        let crossed_low_water = before >= low && io.ring.len() < low;

        let done = filled == requested
            || spec.has(TimeoutFlags::RETURN_IMMEDIATELY)
            || (spec.has(TimeoutFlags::COMPLETE_ON_ANY) && filled > 0);
        if done {
            drop(io);
            drop(_consumer);
            if crossed_low_water {
                log::debug!("rx buffer below low water; receive may resume");
            }
            log::trace!("read {id} completed from buffer: {filled}/{requested} bytes");
            buf.truncate(filled);
            return BeginOutcome::Complete(ReadOutcome {
                id,
                data: buf,
                reason: CompletionReason::Success,
            });
        }

        let needed = if spec.has(TimeoutFlags::CRUNCH_TO_ONE) {
            filled + 1
        } else {
            requested
        };
        // Publish the commit word before the handler can see the request;
        // the shared lock orders the store against the handler's load.
        self.commit.store(id.as_u64(), Ordering::SeqCst);
        io.active = Some(ActiveRead {
            id,
            buf,
            needed,
            filled,
            spec,
        });
        io.target = ProduceTarget::ActiveRequest;
        drop(io);
        drop(_consumer);

        if crossed_low_water {
            log::debug!("rx buffer below low water; receive may resume");
        }
        self.arm_timers(id, &spec, filled);
        log::trace!("read {id} pending: {filled}/{needed} bytes, {spec:?}");
        BeginOutcome::Pending
    }

    /// Arms `spec`'s timers for `id`, unless the read already finalized
    /// (the commit word no longer names it). The check runs under the
    /// timer lock, closing the window between installing the active slot
    /// and arming: a stale arm must never displace a successor's timers.
    fn arm_timers(&self, id: RequestId, spec: &TimeoutSpec, filled: usize) {
        let mut timers = self.timers.lock();
        if self.commit.load(Ordering::SeqCst) == id.as_u64() {
            timers.arm(
                &self.service,
                spec,
                self.now.load(Ordering::Relaxed),
                filled,
                id,
            );
        }
    }

    /// Attempts to win the finalize race for `id`. Exactly one trigger per
    /// request succeeds; the rest observe the lost race and back off.
    fn try_finalize(&self, id: RequestId, reason: CompletionReason) -> bool {
        if self
            .commit
            .compare_exchange(id.as_u64(), 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.finalize(id, reason);
        true
    }

    /// Tears down the committed request: restore the producer redirect,
    /// disarm timers, report the outcome, start the next read.
    fn finalize(&self, id: RequestId, reason: CompletionReason) {
        let active = {
            let mut io = self.io.lock();
            io.target = ProduceTarget::RxBuffer;
            let Some(active) = io.active.take() else {
                panic!("finalize committed twice for read {id}");
            };
            active
        };
        debug_assert_eq!(active.id, id);
        self.timers.lock().disarm(&self.service);
        log::debug!(
            "read {id} finalized: {reason} ({}/{} bytes)",
            active.filled,
            active.needed
        );
        self.sink.read_complete(active.into_outcome(reason));
        self.start_next();
    }

    /// Dequeues and starts queued reads until one goes pending or the FIFO
    /// empties. Immediate completions are reported through the sink.
    fn start_next(&self) {
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.items.pop_front() {
                    Some(req) => req,
                    None => {
                        queue.busy = false;
                        return;
                    }
                }
            };
            match self.begin_read(next) {
                BeginOutcome::Pending => return,
                BeginOutcome::Complete(outcome) => self.sink.read_complete(outcome),
            }
        }
    }
}
