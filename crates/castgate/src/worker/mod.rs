// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-process worker loop.
//!
//! One mio poll set owns every socket of the worker: the shared listen
//! socket, the notification pipe, every client connection and every
//! upstream socket. Single-threaded, readiness-driven; user code never
//! blocks. The fd→connection map is authoritative: teardown removes a
//! socket from the map first, then from the poll set, then closes it —
//! any other order is an invariant violation.

/// Per-connection state.
pub mod conn;
/// Request routing.
mod route;
/// Coarse periodic timer.
pub mod timer;

use crate::config::{Config, CLOSE_FLUSH_TIMEOUT, POLL_TICK};
use crate::core::{DrainStatus, PacketPool};
use crate::error::{Error, Result};
use crate::http::{parser, response, sse};
use crate::ingress::fcc::FccUpdate;
use crate::ingress::rtsp::RtspAction;
use crate::ingress::udp::UdpIngress;
use crate::ingress::StreamCtx;
use crate::service::Service;
use crate::status::{ClientState, NotifyRx, StatusPlane};
use conn::{ConnState, Connection};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Read};
use std::rc::Rc;
use std::time::{Duration, Instant};
use timer::Interval;

const MAX_EVENTS: usize = 256;

/// Which upstream socket of a connection a token points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpKind {
    /// Control / unicast / sole socket.
    Primary,
    /// Multicast or UDP media socket.
    Mcast,
    /// RTCP drain socket.
    Rtcp,
}

/// Poll-token resolution.
#[derive(Debug, Clone, Copy)]
enum Target {
    Client(u64),
    Upstream(u64, UpKind),
}

/// Outcome of the client-read phase, computed under the connection
/// borrow and acted on after it ends.
enum ReadOutcome {
    Nothing,
    Eof,
    Request(parser::Request),
    Bad(Error),
}

/// One worker process.
pub struct Worker {
    cfg: Rc<Config>,
    plane: StatusPlane,
    pool: PacketPool,
    poll: Poll,
    /// Inherited listen sockets; tokens 0..n.
    listeners: Vec<mio::net::TcpListener>,
    /// Token n.
    notify: NotifyRx,
    notify_token: Token,
    conns: HashMap<u64, Connection>,
    targets: HashMap<Token, Target>,
    services: HashMap<String, Rc<Service>>,
    next_token: usize,
    next_conn: u64,
    sweep: Interval,
}

impl Worker {
    /// Build the poll set around the inherited listen sockets.
    pub fn new(
        cfg: Rc<Config>,
        plane: StatusPlane,
        listeners: Vec<std::net::TcpListener>,
        notify: NotifyRx,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let mut listeners: Vec<mio::net::TcpListener> = listeners
            .into_iter()
            .map(mio::net::TcpListener::from_std)
            .collect();
        for (i, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener, Token(i), Interest::READABLE)?;
        }
        let notify_token = Token(listeners.len());
        poll.registry().register(
            &mut SourceFd(&notify.as_raw_fd()),
            notify_token,
            Interest::READABLE,
        )?;

        // Inline services, indexed by URL path.
        let mut services = HashMap::new();
        for entry in &cfg.services {
            match Service::parse_url(&entry.url) {
                Ok(svc) => {
                    services.insert(entry.path.clone(), Rc::new(svc));
                }
                Err(e) => {
                    log::warn!("[worker] skipping service {}: {}", entry.path, e);
                }
            }
        }

        let pool = PacketPool::new(cfg.pool_capacity);
        let next_token = listeners.len() + 1;
        Ok(Self {
            cfg,
            plane,
            pool,
            poll,
            listeners,
            notify,
            notify_token,
            conns: HashMap::new(),
            targets: HashMap::new(),
            services,
            next_token,
            next_conn: 0,
            sweep: Interval::new(Duration::from_millis(100)),
        })
    }

    /// Run until a process-fatal invariant violation.
    pub fn run(&mut self) -> Result<()> {
        log::info!(
            "[worker] worker {} up ({} inline services, pool {})",
            self.plane.worker(),
            self.services.len(),
            self.pool.capacity()
        );
        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let batch: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in batch {
                if token.0 < self.listeners.len() {
                    self.accept_ready(token.0)?;
                } else if token == self.notify_token {
                    self.sse_wake();
                } else {
                    match self.targets.get(&token).copied() {
                        Some(Target::Client(id)) => self.client_event(id, readable, writable)?,
                        Some(Target::Upstream(id, kind)) => {
                            self.upstream_event(id, kind, readable, writable)?
                        }
                        None => {} // already torn down this batch
                    }
                }
            }

            let now = Instant::now();
            if self.sweep.poll(now) {
                self.run_sweep(now)?;
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // ------------------------------------------------------------------
    // Accept
    // ------------------------------------------------------------------

    fn accept_ready(&mut self, listener_idx: usize) -> Result<()> {
        loop {
            match self.listeners[listener_idx].accept() {
                Ok((mut stream, peer)) => {
                    let token = self.alloc_token();
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                    let id = self.next_conn;
                    self.next_conn += 1;
                    self.conns.insert(id, Connection::new(stream, peer, token));
                    self.targets.insert(token, Target::Client(id));
                    log::debug!("[worker] accepted {} (conn {})", peer, id);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Fd exhaustion and friends: survivable, log and move on.
                    log::warn!("[worker] accept failed: {}", e);
                    return Ok(());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Client socket events
    // ------------------------------------------------------------------

    fn client_event(&mut self, id: u64, readable: bool, writable: bool) -> Result<()> {
        if readable {
            self.client_readable(id)?;
        }
        if writable {
            self.flush_client(id);
        }
        Ok(())
    }

    fn client_readable(&mut self, id: u64) -> Result<()> {
        let outcome = {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            read_client(conn)
        };
        match outcome {
            ReadOutcome::Nothing => Ok(()),
            ReadOutcome::Eof => {
                log::debug!("[worker] conn {} closed by peer", id);
                self.destroy(id);
                Ok(())
            }
            ReadOutcome::Bad(e) => {
                log::debug!("[worker] conn {} bad request: {}", id, e);
                let status = response::Status::from_code(e.http_status().unwrap_or(400));
                self.respond(id, response::error(status));
                Ok(())
            }
            ReadOutcome::Request(req) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.state = ConnState::Route;
                }
                self.push_status(id);
                self.handle_request(id, req)
            }
        }
    }

    /// Drain the client socket and write queued output; errors and EOF
    /// tear the connection down.
    fn flush_client(&mut self, id: u64) {
        let (result, written, done_closing, resume) = {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            let mut written = 0u64;
            let result = conn.outq.drain_into(&mut conn.stream, &mut written);
            let done_closing = conn.state == ConnState::Closing && conn.outq.is_empty();
            let resume = conn.paused && conn.outq.below_low();
            (result, written, done_closing, resume)
        };

        if written > 0 {
            if let Some(slot) = self.conns.get(&id).and_then(|c| c.slot) {
                self.plane.add_bytes(slot, written);
            }
        }
        match result {
            Err(e) => {
                log::debug!("[worker] conn {} write failed: {}", id, e);
                self.destroy(id);
            }
            Ok(_) if done_closing => self.destroy(id),
            Ok(DrainStatus::Empty) | Ok(DrainStatus::WouldBlock) => {
                if resume {
                    self.set_stream_paused(id, false);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Upstream socket events
    // ------------------------------------------------------------------

    fn upstream_event(&mut self, id: u64, kind: UpKind, readable: bool, writable: bool) -> Result<()> {
        let mut bytes = 0u64;
        let mut fcc_updates: Vec<FccUpdate> = Vec::new();
        let mut rtsp_actions: Vec<RtspAction> = Vec::new();
        let mut relay_started = false;
        let mut failure: Option<Error> = None;

        {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            match conn.ctx.as_mut() {
                Some(StreamCtx::Udp(ingress)) => {
                    if readable {
                        match ingress.on_readable(&self.pool, &mut conn.outq) {
                            Ok(n) => bytes = n,
                            Err(e) => failure = Some(e),
                        }
                    }
                }
                Some(StreamCtx::Fcc(session)) => {
                    if readable {
                        let result = match kind {
                            UpKind::Primary => {
                                session.on_unicast_readable(&self.pool, &mut conn.outq)
                            }
                            UpKind::Mcast => session.on_mcast_readable(&self.pool, &mut conn.outq),
                            UpKind::Rtcp => Ok((0, Vec::new())),
                        };
                        match result {
                            Ok((n, updates)) => {
                                bytes = n;
                                fcc_updates = updates;
                            }
                            Err(e) => failure = Some(e),
                        }
                    }
                }
                Some(StreamCtx::Rtsp(session)) => match kind {
                    UpKind::Primary => {
                        if writable {
                            match session.on_writable() {
                                Ok(actions) => rtsp_actions.extend(actions),
                                Err(e) => failure = Some(e),
                            }
                        }
                        if readable && failure.is_none() {
                            match session.on_readable(&mut conn.outq) {
                                Ok((n, actions)) => {
                                    bytes = n;
                                    rtsp_actions.extend(actions);
                                }
                                Err(e) => failure = Some(e),
                            }
                        }
                    }
                    UpKind::Mcast | UpKind::Rtcp => {
                        if readable {
                            match session.on_udp_readable(&self.pool, &mut conn.outq) {
                                Ok(n) => bytes = n,
                                Err(e) => failure = Some(e),
                            }
                        }
                    }
                },
                Some(StreamCtx::Relay(relay)) => {
                    if writable {
                        if let Err(e) = relay.on_writable() {
                            failure = Some(e);
                        }
                    }
                    if readable && failure.is_none() {
                        match relay.on_readable(&mut conn.outq) {
                            Ok((n, started)) => {
                                bytes = n;
                                relay_started = started;
                            }
                            Err(e) => failure = Some(e),
                        }
                    }
                }
                None => return Ok(()),
            }
        }

        if let Some(e) = failure {
            return self.stream_error(id, e);
        }
        self.apply_fcc_updates(id, fcc_updates)?;
        self.apply_rtsp_actions(id, rtsp_actions)?;
        if relay_started {
            self.send_stream_head(id);
        }
        let _ = bytes; // client-byte accounting happens at the socket write
        self.push_status(id);
        self.flush_client(id);
        self.update_backpressure(id);
        Ok(())
    }

    fn apply_fcc_updates(&mut self, id: u64, updates: Vec<FccUpdate>) -> Result<()> {
        for update in updates {
            match update {
                FccUpdate::RegisterMcast => {
                    let token = self.alloc_token();
                    let Some(conn) = self.conns.get_mut(&id) else {
                        return Ok(());
                    };
                    if let Some(StreamCtx::Fcc(session)) = conn.ctx.as_mut() {
                        if let Some(socket) = session.mcast_socket_mut() {
                            self.poll
                                .registry()
                                .register(socket, token, Interest::READABLE)?;
                            conn.up_mcast = Some(token);
                            self.targets.insert(token, Target::Upstream(id, UpKind::Mcast));
                        }
                    }
                }
                FccUpdate::DropUnicast => {
                    let (token, socket) = {
                        let Some(conn) = self.conns.get_mut(&id) else {
                            return Ok(());
                        };
                        let token = conn.up_primary.take();
                        let socket = match conn.ctx.as_mut() {
                            Some(StreamCtx::Fcc(session)) => session.take_unicast_socket(),
                            _ => None,
                        };
                        (token, socket)
                    };
                    if let Some(token) = token {
                        self.targets.remove(&token);
                    }
                    if let Some(mut socket) = socket {
                        let _ = self.poll.registry().deregister(&mut socket);
                        // Dropping the socket closes the fd, last.
                    }
                }
                FccUpdate::Fallback => self.fcc_fallback(id)?,
            }
        }
        Ok(())
    }

    fn apply_rtsp_actions(&mut self, id: u64, actions: Vec<RtspAction>) -> Result<()> {
        for action in actions {
            match action {
                RtspAction::Reconnect => {
                    // The old socket is already closed; bind its token to
                    // the replacement stream.
                    let Some(conn) = self.conns.get_mut(&id) else {
                        return Ok(());
                    };
                    let Some(token) = conn.up_primary else {
                        return Err(Error::Internal("rtsp reconnect without token"));
                    };
                    if let Some(StreamCtx::Rtsp(session)) = conn.ctx.as_mut() {
                        self.poll.registry().register(
                            session.stream_mut(),
                            token,
                            Interest::READABLE | Interest::WRITABLE,
                        )?;
                    }
                }
                RtspAction::RegisterUdp => {
                    let media_token = self.alloc_token();
                    let rtcp_token = self.alloc_token();
                    let Some(conn) = self.conns.get_mut(&id) else {
                        return Ok(());
                    };
                    if let Some(StreamCtx::Rtsp(session)) = conn.ctx.as_mut() {
                        if let Some(socket) = session.udp_rtp_mut() {
                            self.poll
                                .registry()
                                .register(socket, media_token, Interest::READABLE)?;
                            conn.up_mcast = Some(media_token);
                            self.targets
                                .insert(media_token, Target::Upstream(id, UpKind::Mcast));
                        }
                        if let Some(socket) = session.udp_rtcp_mut() {
                            self.poll
                                .registry()
                                .register(socket, rtcp_token, Interest::READABLE)?;
                            conn.up_rtcp = Some(rtcp_token);
                            self.targets
                                .insert(rtcp_token, Target::Upstream(id, UpKind::Rtcp));
                        }
                    }
                }
                RtspAction::StreamingStarted => self.send_stream_head(id),
                RtspAction::Finished => self.begin_close(id),
            }
        }
        Ok(())
    }

    /// FCC gave up: surface the Error state, then run the same channel
    /// as a plain multicast join.
    fn fcc_fallback(&mut self, id: u64) -> Result<()> {
        self.push_status(id); // records FccError
        self.drop_ctx(id);

        let (group, source) = {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            let Some(service) = conn.service.as_deref() else {
                return Ok(());
            };
            match service.group {
                Some(group) => (group, service.source),
                None => return Ok(()),
            }
        };

        match UdpIngress::open(
            group,
            source,
            false,
            self.cfg.upstream_if_multicast.as_deref(),
            self.cfg.mcast_rejoin_interval,
        ) {
            Ok(mut ingress) => {
                let token = self.alloc_token();
                self.poll
                    .registry()
                    .register(ingress.socket_mut(), token, Interest::READABLE)?;
                let Some(conn) = self.conns.get_mut(&id) else {
                    return Ok(());
                };
                conn.ctx = Some(StreamCtx::Udp(ingress));
                conn.up_primary = Some(token);
                self.targets.insert(token, Target::Upstream(id, UpKind::Primary));
                if let Some(slot) = conn.slot {
                    self.plane.set_state(slot, ClientState::FccMcastActive);
                }
                Ok(())
            }
            Err(e) => self.stream_error(id, e),
        }
    }

    /// Queue the 200 + content-type preamble once.
    fn send_stream_head(&mut self, id: u64) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if conn.headers_sent {
            return;
        }
        conn.headers_sent = true;
        conn.outq.push_bytes(response::stream_head("video/mp2t"));
        self.flush_client(id);
    }

    /// RTSP back-pressure: PAUSE above high water, PLAY below low.
    fn update_backpressure(&mut self, id: u64) {
        let want_pause = {
            let Some(conn) = self.conns.get(&id) else {
                return;
            };
            match (&conn.ctx, conn.paused) {
                (Some(StreamCtx::Rtsp(_)), false) if conn.outq.over_high() => Some(true),
                _ => None,
            }
        };
        if let Some(paused) = want_pause {
            self.set_stream_paused(id, paused);
        }
    }

    fn set_stream_paused(&mut self, id: u64, paused: bool) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        if let Some(StreamCtx::Rtsp(session)) = conn.ctx.as_mut() {
            if session.set_paused(paused).is_ok() {
                conn.paused = paused;
                log::debug!(
                    "[worker] conn {} {} upstream",
                    id,
                    if paused { "paused" } else { "resumed" }
                );
            }
        } else {
            conn.paused = false;
        }
    }

    // ------------------------------------------------------------------
    // Status plane
    // ------------------------------------------------------------------

    /// Mirror the connection's current state into its table row.
    fn push_status(&mut self, id: u64) {
        let Some(conn) = self.conns.get(&id) else {
            return;
        };
        let Some(slot) = conn.slot else {
            return;
        };
        let state = match conn.state {
            ConnState::ReadReqLine | ConnState::ReadHeaders => ClientState::ReadRequest,
            ConnState::Route => ClientState::Routing,
            ConnState::SseActive => ClientState::Sse,
            ConnState::Closing => ClientState::Closing,
            ConnState::Streaming => match &conn.ctx {
                Some(StreamCtx::Fcc(session)) => session.client_state(),
                Some(StreamCtx::Rtsp(session)) => session.client_state(),
                _ => ClientState::Streaming,
            },
        };
        self.plane.set_state(slot, state);
    }

    // ------------------------------------------------------------------
    // SSE
    // ------------------------------------------------------------------

    /// Notification-pipe edge: one coalesced snapshot to every observer.
    fn sse_wake(&mut self) {
        if !self.notify.drain() {
            return;
        }
        let observers: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, c)| c.state == ConnState::SseActive)
            .map(|(id, _)| *id)
            .collect();
        if observers.is_empty() {
            return;
        }
        let frame = sse::compose_event(&self.plane, self.cfg.max_clients, self.cfg.workers);
        for id in observers {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.outq.push_bytes(frame.clone());
            }
            self.flush_client(id);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Queue a full response and move to Closing.
    fn respond(&mut self, id: u64, bytes: Vec<u8>) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.headers_sent = true;
            conn.outq.push_bytes(bytes);
        }
        self.begin_close(id);
    }

    /// Mid-stream failure: answer with a status if the preamble did not
    /// go out yet, otherwise just close. `Internal` aborts the worker.
    fn stream_error(&mut self, id: u64, e: Error) -> Result<()> {
        if e.is_fatal() {
            return Err(e);
        }
        log::warn!("[worker] conn {} stream error: {}", id, e);
        let headers_sent = self
            .conns
            .get(&id)
            .map(|c| c.headers_sent)
            .unwrap_or(true);
        if headers_sent {
            self.begin_close(id);
        } else {
            let status = response::Status::from_code(e.http_status().unwrap_or(503));
            self.respond(id, response::error(status));
        }
        Ok(())
    }

    /// Flush what is queued (short deadline), then destroy.
    fn begin_close(&mut self, id: u64) {
        let empty = {
            let Some(conn) = self.conns.get_mut(&id) else {
                return;
            };
            if conn.state == ConnState::Closing {
                return;
            }
            conn.state = ConnState::Closing;
            conn.close_deadline = Some(Instant::now() + CLOSE_FLUSH_TIMEOUT);
            if let Some(StreamCtx::Rtsp(session)) = conn.ctx.as_mut() {
                session.teardown();
            }
            conn.outq.is_empty()
        };
        self.push_status(id);
        if empty {
            self.destroy(id);
        } else {
            self.flush_client(id);
        }
    }

    /// Full teardown. Order is mandatory: fd map first, poll set second,
    /// close (drop) last.
    fn destroy(&mut self, id: u64) {
        let Some(mut connection) = self.conns.remove(&id) else {
            return;
        };
        self.targets.remove(&connection.token);
        for token in connection.upstream_tokens().collect::<Vec<_>>() {
            self.targets.remove(&token);
        }

        let registry = self.poll.registry();
        let _ = registry.deregister(&mut connection.stream);
        if let Some(ctx) = connection.ctx.as_mut() {
            deregister_ctx(registry, ctx);
        }

        connection.outq.clear();
        if let Some(slot) = connection.slot {
            self.plane.release(slot);
        }
        log::debug!("[worker] conn {} destroyed", id);
        // Dropping `connection` closes every fd.
    }

    /// Drop the upstream context without touching the client socket
    /// (FCC fallback swaps contexts mid-stream).
    fn drop_ctx(&mut self, id: u64) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        for token in conn.upstream_tokens().collect::<Vec<_>>() {
            self.targets.remove(&token);
        }
        conn.up_primary = None;
        conn.up_mcast = None;
        conn.up_rtcp = None;
        if let Some(mut ctx) = conn.ctx.take() {
            deregister_ctx(self.poll.registry(), &mut ctx);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn run_sweep(&mut self, now: Instant) -> Result<()> {
        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            // Cross-worker disconnect requests.
            let killed = self
                .conns
                .get(&id)
                .and_then(|c| c.slot)
                .map(|slot| self.plane.take_kill(slot))
                .unwrap_or(false);
            if killed {
                log::info!("[worker] conn {} disconnected via api", id);
                self.begin_close(id);
                continue;
            }

            enum TickResult {
                None,
                Destroy,
                Fail(Error),
                Fcc(Vec<FccUpdate>),
            }
            let result = {
                let Some(conn) = self.conns.get_mut(&id) else {
                    continue;
                };
                match conn.state {
                    ConnState::ReadReqLine | ConnState::ReadHeaders => {
                        if now >= conn.header_deadline {
                            log::debug!("[worker] conn {} header timeout", id);
                            TickResult::Destroy
                        } else {
                            TickResult::None
                        }
                    }
                    ConnState::Closing => {
                        let expired = conn.close_deadline.map(|d| now >= d).unwrap_or(true);
                        if expired || conn.outq.is_empty() {
                            TickResult::Destroy
                        } else {
                            TickResult::None
                        }
                    }
                    ConnState::Streaming => match conn.ctx.as_mut() {
                        Some(StreamCtx::Udp(ingress)) => {
                            ingress.on_tick(now);
                            TickResult::None
                        }
                        Some(StreamCtx::Fcc(session)) => {
                            match session.on_tick(now, &mut conn.outq) {
                                Ok((_, updates)) => TickResult::Fcc(updates),
                                Err(e) => TickResult::Fail(e),
                            }
                        }
                        Some(StreamCtx::Rtsp(session)) => match session.on_tick(now) {
                            Ok(()) => TickResult::None,
                            Err(e) => TickResult::Fail(e),
                        },
                        Some(StreamCtx::Relay(relay)) => match relay.on_tick(now) {
                            Ok(()) => TickResult::None,
                            Err(e) => TickResult::Fail(e),
                        },
                        None => TickResult::None,
                    },
                    _ => TickResult::None,
                }
            };

            match result {
                TickResult::None => {}
                TickResult::Destroy => {
                    self.destroy(id);
                    continue;
                }
                TickResult::Fail(e) => {
                    self.stream_error(id, e)?;
                    continue;
                }
                TickResult::Fcc(updates) => {
                    self.apply_fcc_updates(id, updates)?;
                }
            }

            if let Some(slot) = self.conns.get(&id).and_then(|c| c.slot) {
                self.plane.sample(slot);
            }
            self.push_status(id);
        }
        Ok(())
    }
}

/// Read pending client bytes under the connection borrow.
fn read_client(conn: &mut Connection) -> ReadOutcome {
    let mut chunk = [0u8; 512];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => {
                match conn.state {
                    ConnState::ReadReqLine | ConnState::ReadHeaders => {
                        conn.inbuf.extend_from_slice(&chunk[..n]);
                    }
                    // Anything after the request head is discarded.
                    _ => continue,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return ReadOutcome::Eof,
        }
    }
    if !matches!(conn.state, ConnState::ReadReqLine | ConnState::ReadHeaders) {
        return ReadOutcome::Nothing;
    }
    if conn.state == ConnState::ReadReqLine && conn.inbuf.windows(2).any(|w| w == b"\r\n") {
        conn.state = ConnState::ReadHeaders;
    }
    match parser::try_parse(&conn.inbuf) {
        Ok(Some((request, consumed))) => {
            conn.inbuf.drain(..consumed);
            ReadOutcome::Request(request)
        }
        Ok(None) => ReadOutcome::Nothing,
        Err(e) => ReadOutcome::Bad(e),
    }
}

/// Deregister every socket a context owns. Errors are ignored: a socket
/// replaced after a redirect was already removed when its fd closed.
fn deregister_ctx(registry: &mio::Registry, ctx: &mut StreamCtx) {
    match ctx {
        StreamCtx::Udp(ingress) => {
            let _ = registry.deregister(ingress.socket_mut());
        }
        StreamCtx::Fcc(session) => {
            if let Some(socket) = session.unicast_socket_mut() {
                let _ = registry.deregister(socket);
            }
            if let Some(socket) = session.mcast_socket_mut() {
                let _ = registry.deregister(socket);
            }
        }
        StreamCtx::Rtsp(session) => {
            let _ = registry.deregister(session.stream_mut());
            if let Some(socket) = session.udp_rtp_mut() {
                let _ = registry.deregister(socket);
            }
            if let Some(socket) = session.udp_rtcp_mut() {
                let _ = registry.deregister(socket);
            }
        }
        StreamCtx::Relay(relay) => {
            let _ = registry.deregister(relay.stream_mut());
        }
    }
}
