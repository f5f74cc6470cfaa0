// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client bounded output queue.
//!
//! Holds references into the packet pool (media path, zero copy) and
//! owned byte chunks (response headers, SSE frames). Drained on writable
//! readiness in strict FIFO order, with a gathered write when more than
//! one entry is pending. Partial writes advance an offset into the head
//! entry; a retired pool entry releases its buffer exactly once, via the
//! handle's `Drop`.
//!
//! Back-pressure: above the high watermark the ingress must stop
//! enqueuing (UDP flows drop packets, RTSP pauses reads) until the queue
//! drains below the low watermark.

use super::pool::PktBuf;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

/// Gather at most this many slices per `write_vectored` call.
const MAX_GATHER: usize = 16;

enum QueueItem {
    /// Shared pool buffer; `off`/`len` select the payload range.
    Pkt { buf: PktBuf, off: u16, len: u16 },
    /// Owned control bytes.
    Bytes(Vec<u8>),
}

impl QueueItem {
    fn as_slice(&self) -> &[u8] {
        match self {
            QueueItem::Pkt { buf, off, len } => {
                &buf.bytes()[usize::from(*off)..usize::from(*off) + usize::from(*len)]
            }
            QueueItem::Bytes(b) => b,
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Queue fully drained.
    Empty,
    /// Socket stopped accepting bytes; wait for the next writable edge.
    WouldBlock,
}

/// Bounded FIFO of output entries with watermark accounting.
pub struct OutputQueue {
    items: VecDeque<QueueItem>,
    /// Bytes of the head entry already written.
    head_off: usize,
    /// Total unwritten bytes across all entries.
    queued: usize,
    high: usize,
    low: usize,
    /// Media packets refused because the queue was above high water.
    dropped_packets: u64,
}

impl OutputQueue {
    pub fn new(high: usize, low: usize) -> Self {
        debug_assert!(low <= high);
        Self {
            items: VecDeque::with_capacity(64),
            head_off: 0,
            queued: 0,
            high,
            low,
            dropped_packets: 0,
        }
    }

    /// Enqueue a media payload by reference. Returns `false` (and counts
    /// the drop) when the queue is already at or above the high
    /// watermark; the caller releases the buffer by dropping its handle.
    pub fn push_packet(&mut self, buf: PktBuf, off: usize, len: usize) -> bool {
        debug_assert!(off + len <= buf.len(), "range beyond payload");
        if len == 0 {
            return true;
        }
        if self.queued >= self.high {
            self.dropped_packets += 1;
            return false;
        }
        self.queued += len;
        self.items.push_back(QueueItem::Pkt {
            buf,
            off: off as u16,
            len: len as u16,
        });
        true
    }

    /// Enqueue owned control bytes. Control data is never dropped; the
    /// watermark applies to the media path only.
    pub fn push_bytes(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.queued += bytes.len();
        self.items.push_back(QueueItem::Bytes(bytes));
    }

    /// Unwritten bytes currently queued.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ingress must stop enqueuing media.
    pub fn over_high(&self) -> bool {
        self.queued >= self.high
    }

    /// Paused ingress may resume.
    pub fn below_low(&self) -> bool {
        self.queued < self.low
    }

    /// Media packets refused at the high watermark.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Write as much as the socket accepts. Returns the drain status and
    /// reports written bytes through `written` for byte accounting.
    pub fn drain_into<W: Write>(
        &mut self,
        sock: &mut W,
        written: &mut u64,
    ) -> io::Result<DrainStatus> {
        loop {
            if self.items.is_empty() {
                return Ok(DrainStatus::Empty);
            }

            let n = if self.items.len() == 1 {
                let head = self.items[0].as_slice();
                match sock.write(&head[self.head_off..]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(DrainStatus::WouldBlock)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            } else {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_GATHER);
                for (i, item) in self.items.iter().take(MAX_GATHER).enumerate() {
                    let s = item.as_slice();
                    slices.push(IoSlice::new(if i == 0 { &s[self.head_off..] } else { s }));
                }
                match sock.write_vectored(&slices) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(DrainStatus::WouldBlock)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            };

            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            *written += n as u64;
            self.queued -= n;
            self.advance(n);
        }
    }

    /// Retire fully-written entries and move the head offset.
    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let head_len = self.items[0].as_slice().len() - self.head_off;
            if n >= head_len {
                n -= head_len;
                self.head_off = 0;
                // Dropping a Pkt entry releases its pool reference.
                self.items.pop_front();
            } else {
                self.head_off += n;
                n = 0;
            }
        }
    }

    /// Drop everything still queued (connection teardown). Pool
    /// references are released by the entry drops.
    pub fn clear(&mut self) {
        self.items.clear();
        self.head_off = 0;
        self.queued = 0;
    }
}
