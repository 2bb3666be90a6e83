//! Read timeout policy.
//!
//! A read is bounded by two independent timers derived from the device-wide
//! timeout configuration: the *interval* timer fires when too long passes
//! between consecutive received characters, and the *total* timer bounds the
//! whole request. The sentinel value [`ReadTimeouts::INFINITE`] selects the
//! legacy completion modes (return whatever is buffered immediately, or
//! complete as soon as anything at all arrives).
//!
//! [`TimeoutSpec::compute`] derives the per-request policy once, from a
//! configuration snapshot taken immediately beforehand; the spec is
//! read-only for the life of the request.

use bitflags::bitflags;

use crate::request::RequestId;
use crate::timer::{DeadlineTimer, TimerHandle};

/// Device-wide read timeout configuration, in milliseconds (1 tick = 1 ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTimeouts {
    /// Maximum gap between two received characters.
    pub interval: u32,
    /// Per-requested-byte contribution to the total timeout.
    pub total_multiplier: u32,
    /// Constant contribution to the total timeout.
    pub total_constant: u32,
}

impl ReadTimeouts {
    /// Sentinel selecting the special completion modes.
    pub const INFINITE: u32 = u32::MAX;

    /// No timeouts: reads wait indefinitely for their full byte count.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            interval: 0,
            total_multiplier: 0,
            total_constant: 0,
        }
    }
}

impl Default for ReadTimeouts {
    fn default() -> Self {
        Self::none()
    }
}

bitflags! {
    /// Behavior modifiers derived from the timeout configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimeoutFlags: u8 {
        /// Hand back whatever is already buffered, even zero bytes, with no
        /// timers armed.
        const RETURN_IMMEDIATELY = 1 << 0;
        /// Complete with whatever was transferred as soon as any byte has
        /// been copied, even if fewer than requested.
        const COMPLETE_ON_ANY = 1 << 1;
        /// Shrink the effective requested length to a single byte.
        const CRUNCH_TO_ONE = 1 << 2;
    }
}

/// Per-request timeout policy. Derived once, immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSpec {
    /// Inter-character timeout in ticks, if the interval timer is enabled.
    pub interval_ticks: Option<u64>,
    /// Whole-request timeout in ticks relative to now, if enabled.
    pub total_ticks: Option<u64>,
    /// Behavior modifiers.
    pub flags: TimeoutFlags,
}

impl TimeoutSpec {
    /// Derives the timeout policy for a read of `requested` bytes.
    #[must_use]
    pub fn compute(requested: usize, cfg: &ReadTimeouts) -> Self {
        const INFINITE: u32 = ReadTimeouts::INFINITE;

        let mut flags = TimeoutFlags::empty();
        let mut interval_ticks = None;
        let mut total_ticks = None;

        if cfg.interval == 0 || cfg.interval == INFINITE {
            // Interval timer disabled. The sentinel additionally selects
            // one of the legacy completion modes.
            if cfg.interval == INFINITE {
                if cfg.total_multiplier == 0 && cfg.total_constant == 0 {
                    flags |= TimeoutFlags::RETURN_IMMEDIATELY;
                } else if cfg.total_multiplier != INFINITE && cfg.total_constant != INFINITE {
                    flags |= TimeoutFlags::COMPLETE_ON_ANY;
                    total_ticks = Some(total_for(requested, cfg));
                } else if cfg.total_constant != INFINITE && cfg.total_multiplier == INFINITE {
                    flags |= TimeoutFlags::COMPLETE_ON_ANY | TimeoutFlags::CRUNCH_TO_ONE;
                    // The sentinel multiplier contributes nothing; the read
                    // is one byte bounded by the constant alone.
                    total_ticks = Some(u64::from(cfg.total_constant));
                }
            }
        } else {
            interval_ticks = Some(u64::from(cfg.interval));
            if cfg.total_multiplier != 0 || cfg.total_constant != 0 {
                total_ticks = Some(total_for(requested, cfg));
            }
        }

        Self {
            interval_ticks,
            total_ticks,
            flags,
        }
    }

    /// Returns `true` if the given behavior flag is set.
    #[must_use]
    pub fn has(&self, flag: TimeoutFlags) -> bool {
        self.flags.contains(flag)
    }
}

/// `requested * multiplier + constant`, widened to avoid overflow.
fn total_for(requested: usize, cfg: &ReadTimeouts) -> u64 {
    (requested as u64)
        .saturating_mul(u64::from(cfg.total_multiplier))
        .saturating_add(u64::from(cfg.total_constant))
}

/// Timer event dispatched by the tick path to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The inter-character interval elapsed for the given request.
    Interval(RequestId),
    /// The whole-request deadline elapsed for the given request.
    Total(RequestId),
}

/// Owns the armed timers for the one active request, plus the fill-level
/// baseline the interval timer compares against.
pub struct TimeoutController {
    interval_period: u64,
    interval: Option<TimerHandle>,
    total: Option<TimerHandle>,
    baseline: usize,
    /// The request the armed timers and baseline belong to. Mutations
    /// carrying any other id are stale and ignored.
    owner: Option<RequestId>,
}

impl TimeoutController {
    /// Creates a controller with nothing armed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interval_period: 0,
            interval: None,
            total: None,
            baseline: 0,
            owner: None,
        }
    }

    /// Arms the timers `spec` calls for. Idempotent: anything already armed
    /// is disarmed first.
    ///
    /// `filled` seeds the interval baseline with the bytes the initial
    /// drain already transferred.
    pub fn arm(
        &mut self,
        service: &DeadlineTimer<TimerEvent>,
        spec: &TimeoutSpec,
        now: u64,
        filled: usize,
        id: RequestId,
    ) {
        self.disarm(service);
        self.owner = Some(id);
        self.baseline = filled;
        if let Some(ticks) = spec.interval_ticks {
            self.interval_period = ticks;
            self.interval = Some(service.arm(now + ticks, TimerEvent::Interval(id)));
        }
        if let Some(ticks) = spec.total_ticks {
            self.total = Some(service.arm(now + ticks, TimerEvent::Total(id)));
        }
    }

    /// Re-arms the interval timer for another period and moves the baseline
    /// to the current fill level.
    ///
    /// Ignored when `id` is not the request the controller serves: a timer
    /// firing that lost a race against finalize must not disturb a
    /// successor's interval or baseline.
    pub fn rearm_interval(
        &mut self,
        service: &DeadlineTimer<TimerEvent>,
        now: u64,
        filled: usize,
        id: RequestId,
    ) {
        if self.owner != Some(id) {
            return;
        }
        self.baseline = filled;
        self.interval = Some(service.arm(now + self.interval_period, TimerEvent::Interval(id)));
    }

    /// Disarms both timers and releases ownership. Idempotent; unarmed
    /// timers are a no-op.
    pub fn disarm(&mut self, service: &DeadlineTimer<TimerEvent>) {
        self.owner = None;
        if let Some(handle) = self.interval.take() {
            service.disarm(handle);
        }
        if let Some(handle) = self.total.take() {
            service.disarm(handle);
        }
    }

    /// Fill level at the last interval check.
    #[must_use]
    pub const fn baseline(&self) -> usize {
        self.baseline
    }
}

impl Default for TimeoutController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INF: u32 = ReadTimeouts::INFINITE;

    fn cfg(interval: u32, mult: u32, constant: u32) -> ReadTimeouts {
        ReadTimeouts {
            interval,
            total_multiplier: mult,
            total_constant: constant,
        }
    }

    #[test]
    fn all_zero_disables_everything() {
        let spec = TimeoutSpec::compute(10, &cfg(0, 0, 0));
        assert_eq!(spec.interval_ticks, None);
        assert_eq!(spec.total_ticks, None);
        assert!(spec.flags.is_empty());
    }

    #[test]
    fn zero_interval_disables_total_too() {
        let spec = TimeoutSpec::compute(10, &cfg(0, 2, 30));
        assert_eq!(spec.interval_ticks, None);
        // Total is only armed alongside a finite interval or a sentinel.
        assert_eq!(spec.total_ticks, None);
        assert!(spec.flags.is_empty());
    }

    #[test]
    fn infinite_interval_all_zero_returns_immediately() {
        let spec = TimeoutSpec::compute(10, &cfg(INF, 0, 0));
        assert!(spec.has(TimeoutFlags::RETURN_IMMEDIATELY));
        assert_eq!(spec.interval_ticks, None);
        assert_eq!(spec.total_ticks, None);
    }

    #[test]
    fn infinite_interval_finite_totals_complete_on_any() {
        let spec = TimeoutSpec::compute(10, &cfg(INF, 2, 30));
        assert!(spec.has(TimeoutFlags::COMPLETE_ON_ANY));
        assert!(!spec.has(TimeoutFlags::CRUNCH_TO_ONE));
        assert_eq!(spec.total_ticks, Some(50));
    }

    #[test]
    fn infinite_interval_and_multiplier_crunches_to_one() {
        let spec = TimeoutSpec::compute(10, &cfg(INF, INF, 30));
        assert!(spec.has(TimeoutFlags::COMPLETE_ON_ANY));
        assert!(spec.has(TimeoutFlags::CRUNCH_TO_ONE));
        assert_eq!(spec.total_ticks, Some(30));
    }

    #[test]
    fn infinite_everything_disables_total() {
        let spec = TimeoutSpec::compute(10, &cfg(INF, INF, INF));
        assert!(spec.flags.is_empty());
        assert_eq!(spec.total_ticks, None);
    }

    #[test]
    fn finite_interval_enables_interval_timer() {
        let spec = TimeoutSpec::compute(10, &cfg(50, 0, 0));
        assert_eq!(spec.interval_ticks, Some(50));
        assert_eq!(spec.total_ticks, None);
        assert!(spec.flags.is_empty());
    }

    #[test]
    fn finite_interval_with_totals() {
        let spec = TimeoutSpec::compute(8, &cfg(50, 10, 100));
        assert_eq!(spec.interval_ticks, Some(50));
        assert_eq!(spec.total_ticks, Some(180));
    }

    #[test]
    fn total_arithmetic_saturates() {
        let spec = TimeoutSpec::compute(usize::MAX, &cfg(50, u32::MAX - 1, u32::MAX - 1));
        assert_eq!(spec.total_ticks, Some(u64::MAX));
    }

    #[test]
    fn controller_disarm_is_idempotent() {
        let service = DeadlineTimer::new();
        let mut ctl = TimeoutController::new();
        let spec = TimeoutSpec::compute(4, &cfg(50, 1, 10));
        ctl.arm(&service, &spec, 0, 0, RequestId::new(1));
        ctl.disarm(&service);
        ctl.disarm(&service);
        assert!(service.expire(1000).is_empty());
    }

    #[test]
    fn controller_rearm_moves_baseline() {
        let service = DeadlineTimer::new();
        let mut ctl = TimeoutController::new();
        let spec = TimeoutSpec::compute(4, &cfg(50, 0, 0));
        let id = RequestId::new(7);
        ctl.arm(&service, &spec, 0, 2, id);
        assert_eq!(ctl.baseline(), 2);
        assert_eq!(service.expire(50), vec![TimerEvent::Interval(id)]);
        ctl.rearm_interval(&service, 50, 3, id);
        assert_eq!(ctl.baseline(), 3);
        assert_eq!(service.expire(100), vec![TimerEvent::Interval(id)]);
    }

    #[test]
    fn rearm_ignores_ids_it_no_longer_serves() {
        let service = DeadlineTimer::new();
        let mut ctl = TimeoutController::new();
        let spec = TimeoutSpec::compute(4, &cfg(50, 0, 0));
        let first = RequestId::new(1);
        let second = RequestId::new(2);
        ctl.arm(&service, &spec, 0, 0, first);
        ctl.disarm(&service);
        ctl.arm(&service, &spec, 0, 1, second);
        // A stale firing for the finalized read changes nothing.
        ctl.rearm_interval(&service, 40, 3, first);
        assert_eq!(ctl.baseline(), 1);
        assert_eq!(service.expire(1000), vec![TimerEvent::Interval(second)]);
    }

    #[test]
    fn arm_replaces_previous_timers() {
        let service = DeadlineTimer::new();
        let mut ctl = TimeoutController::new();
        let spec = TimeoutSpec::compute(4, &cfg(50, 1, 10));
        ctl.arm(&service, &spec, 0, 0, RequestId::new(1));
        ctl.arm(&service, &spec, 100, 0, RequestId::new(2));
        // Only the second request's timers remain: total at 114, interval at 150.
        let events = service.expire(1000);
        assert_eq!(
            events,
            vec![
                TimerEvent::Total(RequestId::new(2)),
                TimerEvent::Interval(RequestId::new(2)),
            ]
        );
    }
}
