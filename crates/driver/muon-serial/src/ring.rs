//! Receive ring buffer.
//!
//! Fixed-capacity circular byte store between the RX interrupt handler
//! (producer) and the read pipeline (consumer). Cursor arithmetic wraps;
//! `count` is tracked explicitly so the full capacity is usable.
//!
//! The ring itself is not synchronized — every mutation happens inside the
//! pipeline's short interrupt-masked critical section. Growing the buffer
//! is the exception: a full copy under that section would stall the handler
//! for an unbounded time, so resizing is split into bounded steps
//! ([`RingMigration`]) between which the section is released and the handler
//! may keep appending. Appends that land during migration are picked up by
//! the final step; buffered bytes are never lost or reordered.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::RxError;

/// Circular byte buffer with explicit occupancy count.
pub struct RxRing {
    storage: Box<[u8]>,
    /// Write cursor: next byte produced lands here.
    head: usize,
    /// Read cursor: next byte drained comes from here.
    tail: usize,
    /// Valid unread bytes between `tail` and `head`.
    count: usize,
}

impl RxRing {
    /// Creates a ring with the given capacity.
    ///
    /// # Errors
    ///
    /// Returns [`RxError::InsufficientResources`] if the backing allocation
    /// fails.
    pub fn with_capacity(capacity: usize) -> Result<Self, RxError> {
        Ok(Self {
            storage: alloc_storage(capacity)?,
            head: 0,
            tail: 0,
            count: 0,
        })
    }

    /// Number of buffered, unread bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if no unread bytes are buffered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Appends bytes at the write cursor, wrapping as needed.
    ///
    /// Returns the number of bytes accepted. Bytes beyond the free space are
    /// rejected; the caller accounts for them as a receive overrun.
    pub fn produce(&mut self, src: &[u8]) -> usize {
        let cap = self.capacity();
        let n = src.len().min(cap - self.count);
        if n == 0 {
            return 0;
        }
        let first = n.min(cap - self.head);
        self.storage[self.head..self.head + first].copy_from_slice(&src[..first]);
        self.storage[..n - first].copy_from_slice(&src[first..n]);
        self.head = (self.head + n) % cap;
        self.count += n;
        n
    }

    /// Removes up to `dest.len()` bytes from the read cursor into `dest`.
    ///
    /// Returns the number of bytes copied (oldest first).
    pub fn drain(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.count);
        if n == 0 {
            return 0;
        }
        self.copy_out(0, &mut dest[..n]);
        self.tail = (self.tail + n) % self.capacity();
        self.count -= n;
        n
    }

    /// Bounded migration step: copies up to `max_bytes` of buffered data
    /// into the migration target.
    ///
    /// Returns `true` once the bytes still to copy fit within `max_bytes`,
    /// at which point the caller should invoke [`finish_resize`] without
    /// releasing the critical section.
    ///
    /// [`finish_resize`]: RxRing::finish_resize
    pub fn migrate_step(&self, migration: &mut RingMigration, max_bytes: usize) -> bool {
        let remaining = self.count - migration.copied;
        if remaining <= max_bytes {
            return true;
        }
        let at = migration.copied;
        self.copy_out(at, &mut migration.storage[at..at + max_bytes]);
        migration.copied += max_bytes;
        false
    }

    /// Copies any bytes appended since the last migration step and swaps in
    /// the new storage.
    ///
    /// Bounded as long as the caller runs it directly after a
    /// [`migrate_step`](RxRing::migrate_step) that returned `true`.
    pub fn finish_resize(&mut self, mut migration: RingMigration) {
        debug_assert!(migration.storage.len() > self.capacity());
        let remaining = self.count - migration.copied;
        let at = migration.copied;
        self.copy_out(at, &mut migration.storage[at..at + remaining]);
        self.storage = migration.storage;
        self.tail = 0;
        self.head = self.count;
    }

    /// Copies `dest.len()` valid bytes starting `offset` bytes past the read
    /// cursor, honoring wrap. Does not move cursors.
    fn copy_out(&self, offset: usize, dest: &mut [u8]) {
        let cap = self.capacity();
        let n = dest.len();
        debug_assert!(offset + n <= self.count);
        let start = (self.tail + offset) % cap;
        let first = n.min(cap - start);
        dest[..first].copy_from_slice(&self.storage[start..start + first]);
        dest[first..].copy_from_slice(&self.storage[..n - first]);
    }
}

/// In-flight buffer growth: the replacement storage plus how much of the
/// buffered data has been copied into it so far.
pub struct RingMigration {
    storage: Box<[u8]>,
    copied: usize,
}

impl RingMigration {
    /// Allocates replacement storage for a grow to `new_capacity`.
    ///
    /// Pure allocation; safe to call outside any critical section. On
    /// failure the ring being migrated is untouched and fully usable.
    ///
    /// # Errors
    ///
    /// Returns [`RxError::InsufficientResources`] if the allocation fails.
    pub fn new(new_capacity: usize) -> Result<Self, RxError> {
        Ok(Self {
            storage: alloc_storage(new_capacity)?,
            copied: 0,
        })
    }
}

/// Fallible zeroed allocation; the one place the receive path allocates.
fn alloc_storage(capacity: usize) -> Result<Box<[u8]>, RxError> {
    let mut v = Vec::new();
    v.try_reserve_exact(capacity)
        .map_err(|_| RxError::InsufficientResources)?;
    v.resize(capacity, 0);
    Ok(v.into_boxed_slice())
}
