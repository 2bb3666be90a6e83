//! Synchronization primitives for the muon driver stack.
//!
//! Lives outside the driver crates so the locks can be exercised with
//! `cargo test` and miri on the host without a bare-metal target.

#![cfg_attr(not(test), no_std)]

pub mod sync;
