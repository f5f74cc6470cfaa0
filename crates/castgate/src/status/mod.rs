// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-worker status/telemetry plane.
//!
//! A shared-memory region (client table + log ring + counters) plus a
//! set of wake pipes. Workers update their own rows; SSE observers on
//! any worker are woken on observable changes only.

/// Wake pipes for SSE observers.
pub mod notify;
/// Shared region creation and layout.
pub mod region;
/// Shared log ring.
pub mod ring;
/// Shared client table.
pub mod table;

pub use notify::{NotifyRx, NotifyTx};
pub use region::StatusRegion;
pub use ring::LogLine;
pub use table::{ClientState, SlotSnapshot};

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-process handle on the status plane.
///
/// Bundles the shared region, the wake set and this worker's id so call
/// sites update rows and wake observers through one object.
#[derive(Clone)]
pub struct StatusPlane {
    region: &'static StatusRegion,
    notify: NotifyTx,
    worker: u32,
}

impl StatusPlane {
    pub fn new(region: &'static StatusRegion, notify: NotifyTx, worker: u32) -> Self {
        Self {
            region,
            notify,
            worker,
        }
    }

    pub fn worker(&self) -> u32 {
        self.worker
    }

    pub fn region(&self) -> &'static StatusRegion {
        self.region
    }

    /// Claim a table row for a new client; wakes observers.
    pub fn claim(&self, peer: &str, url: &str, state: ClientState) -> Option<usize> {
        let slot = table::claim(
            &self.region.slots,
            &self.region.total_clients,
            self.worker,
            peer,
            url,
            state,
            epoch_ms(),
        );
        if slot.is_some() {
            self.notify.wake_all();
        }
        slot
    }

    /// Release an owned row; wakes observers.
    pub fn release(&self, slot: usize) {
        table::release(&self.region.slots, &self.region.total_clients, slot, self.worker);
        self.notify.wake_all();
    }

    /// Owner-only state transition; wakes observers only on a real edge.
    pub fn set_state(&self, slot: usize, state: ClientState) {
        if table::set_state(&self.region.slots, slot, state, epoch_ms()) {
            self.notify.wake_all();
        }
    }

    /// Byte-counter hot path: never wakes observers.
    pub fn add_bytes(&self, slot: usize, n: u64) {
        table::add_bytes(&self.region.slots, slot, n, epoch_ms());
    }

    /// Periodic bandwidth resample for idle streams.
    pub fn sample(&self, slot: usize) {
        table::sample(&self.region.slots, slot, epoch_ms());
    }

    /// Cross-worker force-close request (`/api/disconnect`).
    pub fn request_kill(&self, slot: usize) -> bool {
        table::request_kill(&self.region.slots, slot)
    }

    /// Owner-side kill-flag sweep.
    pub fn take_kill(&self, slot: usize) -> bool {
        table::take_kill(&self.region.slots, slot)
    }

    pub fn total_clients(&self) -> u32 {
        self.region.total_clients.load(Ordering::Acquire)
    }

    /// Process-wide verbosity (0..=4).
    pub fn log_level(&self) -> u8 {
        self.region.log_level.load(Ordering::Relaxed) as u8
    }

    /// Mutate verbosity (`/api/loglevel`); applies to all workers.
    pub fn set_log_level(&self, level: u8) {
        self.region
            .log_level
            .store(u32::from(level.min(4)), Ordering::Relaxed);
    }

    /// Append to the shared log ring; wakes observers.
    pub fn append_log(&self, level: u8, message: &str) {
        self.region.ring.append(level, epoch_ms(), message);
        self.notify.wake_all();
    }

    /// Snapshot of every claimed row.
    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        table::snapshot(&self.region.slots)
    }

    /// Newest log lines, oldest first.
    pub fn log_tail(&self, max: usize) -> Vec<LogLine> {
        self.region.ring.tail(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(workers: usize) -> (StatusPlane, Vec<NotifyRx>) {
        let region = StatusRegion::create(2).expect("mmap region");
        let (readers, tx) = notify::create(workers).expect("pipes");
        (StatusPlane::new(region, tx, 0), readers)
    }

    #[test]
    fn observable_edges_wake_counters_do_not() {
        let (plane, readers) = plane(2);
        let slot = plane
            .claim("1.2.3.4:5", "/ch", ClientState::Streaming)
            .expect("free slot");
        assert!(readers[0].drain());
        assert!(readers[1].drain());

        plane.add_bytes(slot, 4096);
        plane.add_bytes(slot, 4096);
        assert!(!readers[0].drain());

        plane.set_state(slot, ClientState::Closing);
        assert!(readers[0].drain());
        // Same state again: no edge, no wake.
        plane.set_state(slot, ClientState::Closing);
        assert!(!readers[0].drain());

        plane.release(slot);
        assert!(readers[1].drain());
        assert_eq!(plane.total_clients(), 0);
    }

    #[test]
    fn log_append_wakes() {
        let (plane, readers) = plane(1);
        plane.append_log(2, "channel joined");
        assert!(readers[0].drain());
        let tail = plane.log_tail(5);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "channel joined");
    }

    #[test]
    fn log_level_round_trip() {
        let (plane, _readers) = plane(1);
        assert_eq!(plane.log_level(), 2);
        plane.set_log_level(4);
        assert_eq!(plane.log_level(), 4);
        plane.set_log_level(9);
        assert_eq!(plane.log_level(), 4);
    }
}
