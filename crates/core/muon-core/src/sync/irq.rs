//! Interrupt-safe spin lock.
//!
//! Masks interrupts on the local CPU before acquiring the inner spin lock
//! and restores the previous interrupt state on release. Required for any
//! state an interrupt handler mutates: taking a plain lock in thread context
//! and then fielding an interrupt that takes the same lock deadlocks.
//!
//! On hosted targets there are no interrupts to mask, so the lock degrades
//! to a plain spin lock and the same call sites run under `cargo test`.

use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use super::{SpinLock, SpinLockGuard};

/// A spin lock that masks local interrupts while held.
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    /// Creates a new unlocked `IrqSpinLock`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    /// Acquires the lock, masking interrupts first.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved = arch::mask_interrupts();
        IrqSpinLockGuard {
            guard: self.inner.lock(),
            saved,
            // Interrupt state is per-CPU; the guard must stay on this CPU.
            _not_send: PhantomData,
        }
    }
}

/// RAII guard that restores the saved interrupt state on drop.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    saved: arch::IrqState,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        arch::restore_interrupts(self.saved);
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod arch {
    pub type IrqState = u64;

    #[inline]
    pub fn mask_interrupts() -> IrqState {
        let flags: u64;
        // SAFETY: Reading RFLAGS and clearing IF is safe in kernel mode.
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                "cli",
                out(reg) flags,
                options(nomem),
            );
        }
        flags
    }

    #[inline]
    pub fn restore_interrupts(flags: IrqState) {
        // Only the IF bit matters; everything else was preserved.
        if flags & (1 << 9) != 0 {
            // SAFETY: Restores a previously observed interrupt state.
            unsafe {
                core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
            }
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
mod arch {
    pub type IrqState = u64;

    #[inline]
    pub fn mask_interrupts() -> IrqState {
        let daif: u64;
        // SAFETY: Reading DAIF and masking interrupts is safe in kernel mode.
        unsafe {
            core::arch::asm!(
                "mrs {}, DAIF",
                "msr DAIFSet, #0xf",
                out(reg) daif,
                options(nomem),
            );
        }
        daif
    }

    #[inline]
    pub fn restore_interrupts(daif: IrqState) {
        // SAFETY: Restores a previously observed interrupt state.
        unsafe {
            core::arch::asm!(
                "msr DAIF, {}",
                in(reg) daif,
                options(nomem, nostack, preserves_flags),
            );
        }
    }
}

#[cfg(not(target_os = "none"))]
mod arch {
    pub type IrqState = ();

    #[inline]
    pub fn mask_interrupts() -> IrqState {}

    #[inline]
    pub fn restore_interrupts(_state: IrqState) {}
}
