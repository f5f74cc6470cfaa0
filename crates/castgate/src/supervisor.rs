// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process supervisor.
//!
//! Binds the listening socket(s) with the reusable-port option, creates
//! the shared status region and the notification pipes, forks N workers
//! that inherit everything, and reaps/respawns crashed workers with a
//! linear backoff. The kernel shards accepts across the workers through
//! the shared listen fds.

use crate::config::{Config, RESPAWN_BACKOFF_CAP};
use crate::error::{Error, Result};
use crate::status::{notify, NotifyRx, NotifyTx, StatusPlane, StatusRegion};
use crate::worker::Worker;
use crate::logging;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Listen backlog.
const BACKLOG: i32 = 1024;

/// Supervisor loop cadence.
const REAP_TICK: Duration = Duration::from_millis(200);

/// A worker is considered stable (backoff reset) after this uptime.
const STABLE_UPTIME: Duration = Duration::from_secs(30);

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    // Async-signal-safe: one atomic store.
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Per-slot worker bookkeeping.
struct WorkerSlot {
    pid: Option<libc::pid_t>,
    spawned_at: Instant,
    consecutive_failures: u32,
    respawn_at: Option<Instant>,
}

/// Run the gateway: bind, fork, supervise. Only returns on shutdown or
/// a startup error.
pub fn run(cfg: Config) -> Result<()> {
    install_signal_handlers();

    let region = StatusRegion::create(cfg.verbosity)?;
    let (readers, tx) = notify::create(cfg.workers)?;
    logging::init(region, tx.clone());

    let listeners = bind_listeners(&cfg)?;
    for addr in &cfg.listen {
        log::info!("[sup] listening on {}", addr);
    }

    let cfg = Rc::new(cfg);
    let mut slots: Vec<WorkerSlot> = (0..cfg.workers)
        .map(|_| WorkerSlot {
            pid: None,
            spawned_at: Instant::now(),
            consecutive_failures: 0,
            respawn_at: None,
        })
        .collect();

    for idx in 0..cfg.workers {
        let pid = spawn_worker(idx, &cfg, region, &tx, readers[idx], &listeners)?;
        slots[idx].pid = Some(pid);
        slots[idx].spawned_at = Instant::now();
    }

    loop {
        if TERMINATE.load(Ordering::SeqCst) {
            log::info!("[sup] terminating, stopping workers");
            shutdown_workers(&mut slots);
            return Ok(());
        }

        reap(&mut slots, &cfg);

        // Respawn slots whose backoff elapsed.
        let now = Instant::now();
        for idx in 0..slots.len() {
            let due = slots[idx].pid.is_none()
                && cfg.respawn
                && slots[idx].respawn_at.map(|t| now >= t).unwrap_or(false);
            if due {
                match spawn_worker(idx, &cfg, region, &tx, readers[idx], &listeners) {
                    Ok(pid) => {
                        log::info!("[sup] worker {} respawned (pid {})", idx, pid);
                        slots[idx].pid = Some(pid);
                        slots[idx].spawned_at = now;
                        slots[idx].respawn_at = None;
                    }
                    Err(e) => {
                        log::warn!("[sup] worker {} respawn failed: {}", idx, e);
                        slots[idx].respawn_at = Some(now + Duration::from_secs(1));
                    }
                }
            }
        }

        std::thread::sleep(REAP_TICK);
    }
}

fn install_signal_handlers() {
    // SAFETY: installing signal dispositions before any worker forks;
    // the handler only stores an atomic flag. EPIPE must come back as
    // an errno, not a process kill, on every client disconnect.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        let handler = on_terminate as extern "C" fn(libc::c_int) as usize;
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// Bind every configured listen address with reuse-addr + reuse-port.
fn bind_listeners(cfg: &Config) -> Result<Vec<std::net::TcpListener>> {
    let mut listeners = Vec::with_capacity(cfg.listen.len());
    for addr in &cfg.listen {
        listeners.push(bind_one(*addr)?);
    }
    Ok(listeners)
}

fn bind_one(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    sock.set_reuse_address(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    sock.set_reuse_port(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    sock.set_nonblocking(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    sock.bind(&addr.into())
        .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;
    sock.listen(BACKLOG)
        .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;
    Ok(sock.into())
}

/// Fork one worker. The child never returns from this function.
fn spawn_worker(
    idx: usize,
    cfg: &Rc<Config>,
    region: &'static StatusRegion,
    tx: &NotifyTx,
    rx: NotifyRx,
    listeners: &[std::net::TcpListener],
) -> Result<libc::pid_t> {
    // SAFETY: the supervisor is single-threaded, so fork() is safe; the
    // child only uses inherited fds and its own memory.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(Error::Io(std::io::Error::last_os_error())),
        0 => {
            // Child: become worker `idx` and never return.
            logging::set_worker(idx as u32);
            let plane = StatusPlane::new(region, tx.clone(), idx as u32);
            let code = match worker_main(Rc::clone(cfg), plane, rx, listeners) {
                Ok(()) => 0,
                Err(e) => {
                    log::error!("[worker] worker {} died: {}", idx, e);
                    1
                }
            };
            std::process::exit(code);
        }
        pid => {
            log::info!("[sup] worker {} started (pid {})", idx, pid);
            Ok(pid)
        }
    }
}

fn worker_main(
    cfg: Rc<Config>,
    plane: StatusPlane,
    rx: NotifyRx,
    listeners: &[std::net::TcpListener],
) -> Result<()> {
    let mut own_listeners = Vec::with_capacity(listeners.len());
    for listener in listeners {
        own_listeners.push(listener.try_clone().map_err(Error::Io)?);
    }
    let mut worker = Worker::new(cfg, plane, own_listeners, rx)?;
    worker.run()
}

/// Collect exited children; schedule respawns with linear backoff.
fn reap(slots: &mut [WorkerSlot], cfg: &Config) {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid out-pointer; WNOHANG never blocks.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return;
        }
        let Some(idx) = slots.iter().position(|s| s.pid == Some(pid)) else {
            continue;
        };
        let slot = &mut slots[idx];
        slot.pid = None;
        if slot.spawned_at.elapsed() >= STABLE_UPTIME {
            slot.consecutive_failures = 0;
        }
        slot.consecutive_failures += 1;
        let backoff =
            Duration::from_secs(u64::from(slot.consecutive_failures)).min(RESPAWN_BACKOFF_CAP);
        log::warn!(
            "[sup] worker {} (pid {}) exited with status {}, {}",
            idx,
            pid,
            status,
            if cfg.respawn {
                format!("respawning in {:?}", backoff)
            } else {
                "respawn disabled".to_string()
            }
        );
        slot.respawn_at = Some(Instant::now() + backoff);
    }
}

/// SIGTERM every live worker and wait for them.
fn shutdown_workers(slots: &mut [WorkerSlot]) {
    for slot in slots.iter() {
        if let Some(pid) = slot.pid {
            // SAFETY: signalling a child we spawned.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }
    for slot in slots.iter_mut() {
        if let Some(pid) = slot.pid.take() {
            let mut status: libc::c_int = 0;
            // SAFETY: blocking wait on our own child.
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_has_reuse_flags() {
        let listener = bind_one("127.0.0.1:0".parse().expect("addr")).expect("bind");
        let addr = listener.local_addr().expect("bound");
        // A second bind on the same port must succeed thanks to
        // SO_REUSEPORT (this is what shards accepts across workers).
        let second = bind_one(addr).expect("reuse-port rebind");
        drop(listener);
        drop(second);
    }
}
