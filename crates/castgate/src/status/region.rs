// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Anonymous shared-memory region holding the cross-worker status plane.
//!
//! Created by the supervisor before fork and inherited by every worker.
//! The mapping is never unmapped; it lives exactly as long as the
//! process tree, which is why creation hands out a `&'static` reference.
//!
//! # Layout
//!
//! ```text
//! +--------------------------------------+
//! | magic, log_level, total_clients      |
//! | SlotRow[STATUS_SLOTS]  client table  |
//! | LogRing                 log entries  |
//! +--------------------------------------+
//! ```
//!
//! Every field is either an atomic or raw bytes guarded by the
//! single-writer slot discipline (see `table`), so the all-zero page the
//! kernel hands back is already a valid initial state.

use super::ring::LogRing;
use super::table::SlotRow;
use crate::config::STATUS_SLOTS;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifies a mapped region as ours.
const REGION_MAGIC: u32 = 0x4347_5354; // "CGST"

/// The shared status plane.
#[repr(C)]
pub struct StatusRegion {
    magic: AtomicU32,
    /// Process-wide log verbosity (0..=4), mutable via `/api/loglevel`.
    pub log_level: AtomicU32,
    /// Claimed slot count; equals the number of rows with nonzero claim.
    pub total_clients: AtomicU32,
    /// Client table.
    pub slots: [SlotRow; STATUS_SLOTS],
    /// Shared log ring.
    pub ring: LogRing,
}

// SAFETY: all mutable state inside the region is atomics plus byte
// arrays written under the single-writer-per-slot rule; concurrent
// access from multiple worker processes is the design.
unsafe impl Sync for StatusRegion {}

impl StatusRegion {
    /// Map a fresh shared region and hand back a process-lifetime
    /// reference. Call once, in the supervisor, before forking workers.
    pub fn create(verbosity: u8) -> io::Result<&'static StatusRegion> {
        let size = std::mem::size_of::<StatusRegion>();

        // SAFETY:
        // - addr NULL lets the kernel pick the placement
        // - MAP_SHARED | MAP_ANONYMOUS with fd -1 is the portable way to
        //   get fork-inherited shared memory without a name
        // - the kernel zero-fills the pages, which is a valid initial
        //   bit pattern for every field of StatusRegion
        // - MAP_FAILED is checked below
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: ptr is a valid, zeroed, size_of::<StatusRegion>()-byte
        // mapping that is never unmapped, so promoting the lifetime to
        // 'static is sound.
        let region = unsafe { &*(ptr.cast::<StatusRegion>()) };
        region.magic.store(REGION_MAGIC, Ordering::Release);
        region
            .log_level
            .store(u32::from(verbosity.min(4)), Ordering::Release);
        Ok(region)
    }

    /// Cheap sanity check after fork.
    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == REGION_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_validate() {
        let region = StatusRegion::create(3).expect("mmap region");
        assert!(region.is_valid());
        assert_eq!(region.log_level.load(Ordering::Relaxed), 3);
        assert_eq!(region.total_clients.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn verbosity_clamped() {
        let region = StatusRegion::create(9).expect("mmap region");
        assert_eq!(region.log_level.load(Ordering::Relaxed), 4);
    }
}
