//! Spin-based mutual exclusion.
//!
//! [`SpinLock`] is a plain TTAS lock for driver-internal state touched only
//! from thread context. [`IrqSpinLock`] additionally masks interrupts while
//! held, for state shared with interrupt handlers. Both guards release on
//! drop. Critical sections are expected to be short, bounded, and free of
//! allocation.

mod irq;
mod spinlock;

pub use irq::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
