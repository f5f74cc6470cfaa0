// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared client table.
//!
//! Fixed-capacity slot array. A worker claims a slot with one CAS on the
//! claim word (0 = free, worker id + 1 = owned) and is then the row's
//! sole writer until it releases it; readers in other processes only
//! load. The kill word is the single exception: any worker may set it to
//! ask the owner to close the connection (`/api/disconnect`).

use serde::Serialize;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Peer address capacity per row.
pub const PEER_BYTES: usize = 64;
/// Service url capacity per row.
pub const URL_BYTES: usize = 160;

/// Client lifecycle states surfaced in the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientState {
    ReadRequest = 1,
    Routing = 2,
    Streaming = 3,
    FccInit = 4,
    FccRequested = 5,
    FccUnicast = 6,
    FccMcastRequested = 7,
    FccMcastTransition = 8,
    FccMcastActive = 9,
    FccError = 10,
    RtspConnecting = 11,
    RtspDescribing = 12,
    RtspSettingUp = 13,
    RtspPlaying = 14,
    RtspPaused = 15,
    RtspTeardown = 16,
    Sse = 17,
    Closing = 18,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::ReadRequest => "read-request",
            ClientState::Routing => "routing",
            ClientState::Streaming => "streaming",
            ClientState::FccInit => "fcc-init",
            ClientState::FccRequested => "fcc-requested",
            ClientState::FccUnicast => "fcc-unicast",
            ClientState::FccMcastRequested => "fcc-mcast-requested",
            ClientState::FccMcastTransition => "fcc-mcast-transition",
            ClientState::FccMcastActive => "fcc-mcast-active",
            ClientState::FccError => "fcc-error",
            ClientState::RtspConnecting => "rtsp-connecting",
            ClientState::RtspDescribing => "rtsp-describing",
            ClientState::RtspSettingUp => "rtsp-setting-up",
            ClientState::RtspPlaying => "rtsp-playing",
            ClientState::RtspPaused => "rtsp-paused",
            ClientState::RtspTeardown => "rtsp-teardown",
            ClientState::Sse => "sse",
            ClientState::Closing => "closing",
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ClientState::ReadRequest),
            2 => Some(ClientState::Routing),
            3 => Some(ClientState::Streaming),
            4 => Some(ClientState::FccInit),
            5 => Some(ClientState::FccRequested),
            6 => Some(ClientState::FccUnicast),
            7 => Some(ClientState::FccMcastRequested),
            8 => Some(ClientState::FccMcastTransition),
            9 => Some(ClientState::FccMcastActive),
            10 => Some(ClientState::FccError),
            11 => Some(ClientState::RtspConnecting),
            12 => Some(ClientState::RtspDescribing),
            13 => Some(ClientState::RtspSettingUp),
            14 => Some(ClientState::RtspPlaying),
            15 => Some(ClientState::RtspPaused),
            16 => Some(ClientState::RtspTeardown),
            17 => Some(ClientState::Sse),
            18 => Some(ClientState::Closing),
            _ => None,
        }
    }
}

/// One client row.
#[repr(C)]
pub struct SlotRow {
    /// 0 = free, worker id + 1 = owned. The claim CAS is the only
    /// cross-worker write race in the table.
    claim: AtomicU32,
    state: AtomicU32,
    /// Set by any worker to ask the owner to close this client.
    kill: AtomicU32,
    bytes_sent: AtomicU64,
    updated_ms: AtomicU64,
    bw_bps: AtomicU64,
    /// Previous bandwidth sample (owner-only).
    sample_ms: AtomicU64,
    sample_bytes: AtomicU64,
    peer_len: AtomicU32,
    url_len: AtomicU32,
    peer: UnsafeCell<[u8; PEER_BYTES]>,
    url: UnsafeCell<[u8; URL_BYTES]>,
}

// SAFETY: the byte arrays are written only by the claiming worker while
// it owns the row; readers may observe a torn string only across a
// release/re-claim race, which yields garbage text but no UB on these
// plain byte arrays (loads/stores of u8 with the length published after
// the bytes).
unsafe impl Sync for SlotRow {}

impl SlotRow {
    /// Try to claim this row for `worker`. Owner-only writes follow.
    fn try_claim(&self, worker: u32) -> bool {
        self.claim
            .compare_exchange(0, worker + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn write_str(dst: &UnsafeCell<[u8; PEER_BYTES]>, len_field: &AtomicU32, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(PEER_BYTES);
        // SAFETY: called only by the row owner (single writer); readers
        // see the length only after the bytes via the Release store.
        unsafe {
            (&mut *dst.get())[..n].copy_from_slice(&bytes[..n]);
        }
        len_field.store(n as u32, Ordering::Release);
    }

    fn write_url(&self, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(URL_BYTES);
        // SAFETY: single writer, see write_str.
        unsafe {
            (&mut *self.url.get())[..n].copy_from_slice(&bytes[..n]);
        }
        self.url_len.store(n as u32, Ordering::Release);
    }

    fn read_peer(&self) -> String {
        let n = (self.peer_len.load(Ordering::Acquire) as usize).min(PEER_BYTES);
        // SAFETY: plain byte loads; a racing rewrite yields stale or
        // mixed text, never UB.
        let raw = unsafe { (&*self.peer.get())[..n].to_vec() };
        String::from_utf8_lossy(&raw).into_owned()
    }

    fn read_url(&self) -> String {
        let n = (self.url_len.load(Ordering::Acquire) as usize).min(URL_BYTES);
        // SAFETY: see read_peer.
        let raw = unsafe { (&*self.url.get())[..n].to_vec() };
        String::from_utf8_lossy(&raw).into_owned()
    }
}

/// Row snapshot handed to the SSE composer and the status page.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub slot: usize,
    pub worker: u32,
    pub peer: String,
    pub url: String,
    pub state: &'static str,
    pub bytes_sent: u64,
    pub bandwidth_bps: u64,
    pub updated_ms: u64,
}

/// Claim the first free row. Returns the slot index.
pub fn claim(
    slots: &[SlotRow],
    total: &AtomicU32,
    worker: u32,
    peer: &str,
    url: &str,
    state: ClientState,
    now_ms: u64,
) -> Option<usize> {
    for (i, row) in slots.iter().enumerate() {
        if row.claim.load(Ordering::Relaxed) != 0 {
            continue;
        }
        if !row.try_claim(worker) {
            continue; // lost the race for this row, keep scanning
        }
        row.kill.store(0, Ordering::Relaxed);
        row.bytes_sent.store(0, Ordering::Relaxed);
        row.bw_bps.store(0, Ordering::Relaxed);
        row.sample_ms.store(now_ms, Ordering::Relaxed);
        row.sample_bytes.store(0, Ordering::Relaxed);
        row.updated_ms.store(now_ms, Ordering::Relaxed);
        SlotRow::write_str(&row.peer, &row.peer_len, peer);
        row.write_url(url);
        row.state.store(state as u32, Ordering::Release);
        total.fetch_add(1, Ordering::AcqRel);
        return Some(i);
    }
    None
}

/// Release an owned row back to the free pool.
pub fn release(slots: &[SlotRow], total: &AtomicU32, slot: usize, worker: u32) {
    let row = &slots[slot];
    debug_assert_eq!(row.claim.load(Ordering::Relaxed), worker + 1);
    row.state.store(0, Ordering::Relaxed);
    row.peer_len.store(0, Ordering::Relaxed);
    row.url_len.store(0, Ordering::Relaxed);
    row.claim.store(0, Ordering::Release);
    total.fetch_sub(1, Ordering::AcqRel);
}

/// Owner-only state update. Returns true when the value actually moved
/// (the caller wakes observers only then).
pub fn set_state(slots: &[SlotRow], slot: usize, state: ClientState, now_ms: u64) -> bool {
    let row = &slots[slot];
    let prev = row.state.swap(state as u32, Ordering::AcqRel);
    row.updated_ms.store(now_ms, Ordering::Relaxed);
    prev != state as u32
}

/// Owner-only byte-counter bump; recomputes the short-window bandwidth
/// when at least a second elapsed since the previous sample. Never wakes
/// observers.
pub fn add_bytes(slots: &[SlotRow], slot: usize, n: u64, now_ms: u64) {
    let row = &slots[slot];
    let bytes = row.bytes_sent.fetch_add(n, Ordering::Relaxed) + n;
    row.updated_ms.store(now_ms, Ordering::Relaxed);
    resample(row, bytes, now_ms);
}

/// Owner-only periodic sample so an idle stream decays to zero.
pub fn sample(slots: &[SlotRow], slot: usize, now_ms: u64) {
    let row = &slots[slot];
    resample(row, row.bytes_sent.load(Ordering::Relaxed), now_ms);
}

fn resample(row: &SlotRow, bytes: u64, now_ms: u64) {
    let prev_ms = row.sample_ms.load(Ordering::Relaxed);
    let delta = now_ms.saturating_sub(prev_ms);
    if delta < 1000 {
        return;
    }
    let prev_bytes = row.sample_bytes.load(Ordering::Relaxed);
    let bps = bytes.saturating_sub(prev_bytes) * 1000 / delta;
    row.bw_bps.store(bps, Ordering::Relaxed);
    row.sample_ms.store(now_ms, Ordering::Relaxed);
    row.sample_bytes.store(bytes, Ordering::Relaxed);
}

/// Ask the owner of `slot` to close its client. Any worker may call.
/// Returns false when the slot is free.
pub fn request_kill(slots: &[SlotRow], slot: usize) -> bool {
    let row = match slots.get(slot) {
        Some(r) => r,
        None => return false,
    };
    if row.claim.load(Ordering::Acquire) == 0 {
        return false;
    }
    row.kill.store(1, Ordering::Release);
    true
}

/// Owner-side check-and-clear of the kill flag.
pub fn take_kill(slots: &[SlotRow], slot: usize) -> bool {
    slots[slot].kill.swap(0, Ordering::AcqRel) != 0
}

/// Collect every claimed row.
pub fn snapshot(slots: &[SlotRow]) -> Vec<SlotSnapshot> {
    let mut out = Vec::new();
    for (i, row) in slots.iter().enumerate() {
        let claim = row.claim.load(Ordering::Acquire);
        if claim == 0 {
            continue;
        }
        let state = match ClientState::from_u32(row.state.load(Ordering::Acquire)) {
            Some(s) => s.as_str(),
            None => continue, // claimed but not yet published
        };
        out.push(SlotSnapshot {
            slot: i,
            worker: claim - 1,
            peer: row.read_peer(),
            url: row.read_url(),
            state,
            bytes_sent: row.bytes_sent.load(Ordering::Relaxed),
            bandwidth_bps: row.bw_bps.load(Ordering::Relaxed),
            updated_ms: row.updated_ms.load(Ordering::Relaxed),
        });
    }
    out
}
