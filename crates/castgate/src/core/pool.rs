// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size packet pool with reference-counted buffer handles.
//!
//! Pre-allocates N slots of [`PKT_BUF_SIZE`] bytes once at worker start.
//! The ingress fills a slot straight from `recv`, then the same bytes are
//! shared with the output queue (and the FCC pending list) by reference;
//! no payload copy happens between the socket and the client.
//!
//! The pool is strictly per-worker and single-threaded, so refcounts are
//! plain [`Cell`] counters, not atomics. A [`PktBuf`] handle retains on
//! clone and releases on drop; a slot returns to the free list when the
//! last handle goes away. Raw slot indices never leave this module.

use crate::config::PKT_BUF_SIZE;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::rc::Rc;

struct Slot {
    data: UnsafeCell<[u8; PKT_BUF_SIZE]>,
    len: Cell<u16>,
    refs: Cell<u16>,
}

struct PoolInner {
    slots: Box<[Slot]>,
    free: RefCell<Vec<u16>>,
    starved: Cell<u64>,
}

/// Per-worker packet pool.
pub struct PacketPool {
    inner: Rc<PoolInner>,
}

impl PacketPool {
    /// Allocate all slots up front. No growth, no shrink afterwards.
    ///
    /// # Panics
    /// Panics if `capacity` is 0 or exceeds `u16::MAX` slots (handles
    /// index with u16).
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= usize::from(u16::MAX),
            "pool capacity must be 1..=65535"
        );
        let slots: Box<[Slot]> = (0..capacity)
            .map(|_| Slot {
                data: UnsafeCell::new([0u8; PKT_BUF_SIZE]),
                len: Cell::new(0),
                refs: Cell::new(0),
            })
            .collect();
        // Free list is LIFO so recently-used slots stay cache-warm.
        let free: Vec<u16> = (0..capacity as u16).rev().collect();
        Self {
            inner: Rc::new(PoolInner {
                slots,
                free: RefCell::new(free),
                starved: Cell::new(0),
            }),
        }
    }

    /// Take a free slot, refcount 1. `None` when the free list is empty;
    /// starvation is counted and the caller drops the packet.
    pub fn acquire(&self) -> Option<PktBuf> {
        match self.inner.free.borrow_mut().pop() {
            Some(idx) => {
                let slot = &self.inner.slots[usize::from(idx)];
                debug_assert_eq!(slot.refs.get(), 0, "free slot with live refs");
                slot.refs.set(1);
                slot.len.set(0);
                Some(PktBuf {
                    pool: Rc::clone(&self.inner),
                    idx,
                })
            }
            None => {
                self.inner.starved.set(self.inner.starved.get() + 1);
                None
            }
        }
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Currently free slots.
    pub fn available(&self) -> usize {
        self.inner.free.borrow().len()
    }

    /// Times `acquire` came back empty.
    pub fn starved_count(&self) -> u64 {
        self.inner.starved.get()
    }
}

/// Reference-counted handle to one pool slot.
///
/// Cloning retains the slot, dropping releases it; the slot returns to
/// the free list when the last handle drops.
pub struct PktBuf {
    pool: Rc<PoolInner>,
    idx: u16,
}

impl PktBuf {
    fn slot(&self) -> &Slot {
        &self.pool.slots[usize::from(self.idx)]
    }

    /// Whole slot as a write target, for `recv` to fill directly.
    ///
    /// Only callable while this is the sole handle (freshly acquired);
    /// sharing starts after the payload is in place.
    pub fn write_slot(&mut self) -> &mut [u8] {
        let slot = self.slot();
        debug_assert_eq!(slot.refs.get(), 1, "write into a shared buffer");
        // SAFETY: refs == 1 means no other handle can read or write this
        // slot, and the pool is single-threaded; the returned borrow is
        // tied to &mut self so it cannot outlive nor alias a later read.
        unsafe { &mut *slot.data.get() }
    }

    /// Record how many bytes of the slot are valid.
    ///
    /// # Panics
    /// Panics if `len` exceeds the slot size.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= PKT_BUF_SIZE, "len beyond slot size");
        self.slot().len.set(len as u16);
    }

    /// Valid bytes of the slot.
    pub fn bytes(&self) -> &[u8] {
        let slot = self.slot();
        let len = usize::from(slot.len.get());
        // SAFETY: writes happen only through `write_slot` while refs == 1;
        // once a second handle exists the contents are frozen, so shared
        // reads cannot race a write on this single-threaded pool.
        unsafe { &(&*slot.data.get())[..len] }
    }

    /// Valid payload length.
    pub fn len(&self) -> usize {
        usize::from(self.slot().len.get())
    }

    /// True when no payload bytes were recorded.
    pub fn is_empty(&self) -> bool {
        self.slot().len.get() == 0
    }
}

impl Clone for PktBuf {
    fn clone(&self) -> Self {
        let slot = self.slot();
        slot.refs.set(slot.refs.get() + 1);
        Self {
            pool: Rc::clone(&self.pool),
            idx: self.idx,
        }
    }
}

impl Drop for PktBuf {
    fn drop(&mut self) {
        let slot = self.slot();
        let refs = slot.refs.get();
        debug_assert!(refs > 0, "refcount underflow");
        slot.refs.set(refs - 1);
        if refs == 1 {
            self.pool.free.borrow_mut().push(self.idx);
        }
    }
}

impl std::fmt::Debug for PktBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PktBuf")
            .field("idx", &self.idx)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_cycle() {
        let pool = PacketPool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);

        let bufs: Vec<PktBuf> = (0..4).filter_map(|_| pool.acquire()).collect();
        assert_eq!(bufs.len(), 4);
        assert_eq!(pool.available(), 0);

        assert!(pool.acquire().is_none());
        assert_eq!(pool.starved_count(), 1);

        drop(bufs);
        assert_eq!(pool.available(), 4);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn clone_retains_slot() {
        let pool = PacketPool::new(1);
        let mut buf = pool.acquire().expect("one free slot");
        buf.write_slot()[..5].copy_from_slice(b"ABCDE");
        buf.set_len(5);

        let shared = buf.clone();
        drop(buf);
        // Still one live handle, slot must not be reusable yet.
        assert_eq!(pool.available(), 0);
        assert_eq!(shared.bytes(), b"ABCDE");

        drop(shared);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn fresh_slot_has_no_payload() {
        let pool = PacketPool::new(2);
        let mut buf = pool.acquire().expect("free slot");
        buf.write_slot()[0] = 0xFF;
        buf.set_len(1);
        drop(buf);

        let buf = pool.acquire().expect("free slot");
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), b"");
    }

    #[test]
    #[should_panic(expected = "len beyond slot size")]
    fn set_len_bounds() {
        let pool = PacketPool::new(1);
        let mut buf = pool.acquire().expect("free slot");
        buf.set_len(PKT_BUF_SIZE + 1);
    }
}
