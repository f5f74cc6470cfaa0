// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observer wake pipes.
//!
//! One pipe per worker, all created by the supervisor before fork. Every
//! process holds every write end; a worker reads only its own read end,
//! registered in its poll set. An observable change (slot claim/release,
//! state transition, new log line) writes one byte into each pipe so SSE
//! observers on every worker wake; byte-counter updates never write.
//!
//! Writes are non-blocking and dropped when a pipe is full: the reader
//! coalesces pending bytes into one refresh pass anyway, so a later edge
//! is as good as the dropped one.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// The write side: one fd per worker, shared by every process.
#[derive(Clone)]
pub struct NotifyTx {
    write_fds: Arc<Vec<RawFd>>,
}

impl NotifyTx {
    /// One wake byte into every worker's pipe.
    pub fn wake_all(&self) {
        for &fd in self.write_fds.iter() {
            // SAFETY: fd is a pipe write end owned for process lifetime;
            // a failed or partial write is deliberately ignored (O_NONBLOCK
            // full-pipe drop semantics).
            unsafe {
                libc::write(fd, [0x6eu8].as_ptr().cast(), 1);
            }
        }
    }
}

/// The read side owned by exactly one worker. Plain fd wrapper (the fd
/// lives for the process lifetime, nothing closes it), so handing it
/// across the fork is a copy.
#[derive(Clone, Copy)]
pub struct NotifyRx {
    read_fd: RawFd,
}

impl NotifyRx {
    /// Raw fd for poll registration (`mio::unix::SourceFd`).
    pub fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Swallow every pending wake byte, coalescing bursts into one
    /// refresh. Returns true when at least one byte was pending.
    pub fn drain(&self) -> bool {
        let mut seen = false;
        let mut scratch = [0u8; 64];
        loop {
            // SAFETY: read_fd is our nonblocking pipe read end; scratch
            // is a valid 64-byte buffer.
            let n = unsafe { libc::read(self.read_fd, scratch.as_mut_ptr().cast(), scratch.len()) };
            if n > 0 {
                seen = true;
                continue;
            }
            return seen;
        }
    }
}

/// Build one pipe per worker. Returns the per-worker read ends and the
/// shared write set. Fds live for the process lifetime; they are
/// inherited across fork and never closed.
pub fn create(workers: usize) -> io::Result<(Vec<NotifyRx>, NotifyTx)> {
    let mut readers = Vec::with_capacity(workers);
    let mut writers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid two-int array; O_NONBLOCK on both ends
        // keeps the wake path and the drain loop from ever blocking.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        readers.push(NotifyRx { read_fd: fds[0] });
        writers.push(fds[1]);
    }
    Ok((
        readers,
        NotifyTx {
            write_fds: Arc::new(writers),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_reaches_every_reader() {
        let (readers, tx) = create(3).expect("pipes");
        tx.wake_all();
        for rx in &readers {
            assert!(rx.drain());
        }
    }

    #[test]
    fn drain_coalesces_bursts() {
        let (readers, tx) = create(1).expect("pipes");
        for _ in 0..10 {
            tx.wake_all();
        }
        assert!(readers[0].drain());
        // Fully drained: nothing left on the second pass.
        assert!(!readers[0].drain());
    }

    #[test]
    fn full_pipe_drops_writes() {
        let (readers, tx) = create(1).expect("pipes");
        // Far beyond any pipe buffer; must neither block nor fail.
        for _ in 0..200_000 {
            tx.wake_all();
        }
        assert!(readers[0].drain());
    }
}
