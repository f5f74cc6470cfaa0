// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fast Channel Change engine.
//!
//! A burst server unicasts a key-frame-aligned prefix of the channel so
//! the decoder starts immediately; meanwhile the engine silently joins
//! the real multicast group and, once the unicast stream reaches the
//! server-advertised handover sequence (or the pending buffer fills),
//! flushes the buffered multicast packets and switches over.
//!
//! ```text
//!  Init -> Requested -> UnicastActive -> McastRequested
//!                                            |
//!                                      McastTransition -> McastActive
//! ```
//!
//! Transitions never go backward; every transition is surfaced in the
//! status table. Any unrecoverable condition enters `Error`, after
//! which the worker falls back to a plain multicast join.

/// Telecom/Huawei wire codecs.
pub mod flavor;
/// NAT pinhole / NAT-PMP helpers.
pub mod nat;

use crate::config::{FccNatMode, FCC_IDLE_TIMEOUT, FCC_PENDING_LIMIT};
use crate::core::{rtp, OutputQueue, PacketPool, PktBuf, SeqTracker, SeqVerdict};
use crate::error::{Error, Result};
use crate::ingress::udp::open_multicast_socket;
use crate::status::ClientState;
use flavor::{Flavor, ServerDatagram};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Engine states. Terminal: `McastActive`, `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccState {
    Init,
    Requested,
    UnicastActive,
    McastRequested,
    McastTransition,
    McastActive,
    Error,
}

/// What the worker must do after an engine callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FccUpdate {
    /// The engine joined the multicast group; register its socket.
    RegisterMcast,
    /// Handover done; deregister and close the unicast socket
    /// (`take_unicast_socket`).
    DropUnicast,
    /// The engine gave up; tear it down and fall back to a plain
    /// multicast join of the same group.
    Fallback,
}

/// A multicast packet retained during the transition window.
struct PendingPkt {
    seq: u16,
    buf: PktBuf,
    off: u16,
    len: u16,
}

/// One FCC session, owned by one streaming connection.
pub struct FccSession {
    state: FccState,
    flavor: Flavor,
    server: SocketAddr,
    group: SocketAddrV4,
    source: Option<IpAddr>,
    iface: Ipv4Addr,
    unicast: Option<mio::net::UdpSocket>,
    mcast: Option<mio::net::UdpSocket>,
    uni_tracker: SeqTracker,
    mcast_tracker: SeqTracker,
    handover_seq: Option<u16>,
    pending: Vec<PendingPkt>,
    term_sent: bool,
    last_rx: Instant,
    /// Cap on how long the transition window may stay open.
    transition_since: Option<Instant>,
}

impl FccSession {
    /// Bind the unicast socket, run NAT preparation and send the burst
    /// request. The caller registers `unicast_socket_mut` for readiness.
    pub fn start(
        group: SocketAddrV4,
        source: Option<IpAddr>,
        server: SocketAddr,
        flavor: Flavor,
        nat_mode: FccNatMode,
        port_range: Option<(u16, u16)>,
        iface: Ipv4Addr,
    ) -> Result<Self> {
        let unicast = bind_unicast(port_range)?;
        let local_port = unicast.local_addr()?.port();

        let advertised_port = match nat_mode {
            FccNatMode::None => local_port,
            FccNatMode::HolePunch => {
                nat::hole_punch(&unicast, server)?;
                local_port
            }
            FccNatMode::NatPmp => nat::request_pmp_mapping(local_port).unwrap_or(local_port),
        };

        let request = flavor.encode_request(*group.ip(), group.port(), advertised_port);
        unicast.send_to(&request, server)?;
        log::info!(
            "[fcc] {} burst requested from {} for {} (downstream port {})",
            flavor.as_str(),
            server,
            group,
            advertised_port
        );

        let mut session = Self {
            state: FccState::Init,
            flavor,
            server,
            group,
            source,
            iface,
            unicast: Some(unicast),
            mcast: None,
            uni_tracker: SeqTracker::new(),
            mcast_tracker: SeqTracker::new(),
            handover_seq: None,
            pending: Vec::new(),
            term_sent: false,
            last_rx: Instant::now(),
            transition_since: None,
        };
        session.state = FccState::Requested;
        Ok(session)
    }

    pub fn state(&self) -> FccState {
        self.state
    }

    /// Status-table projection of the engine state.
    pub fn client_state(&self) -> ClientState {
        match self.state {
            FccState::Init => ClientState::FccInit,
            FccState::Requested => ClientState::FccRequested,
            FccState::UnicastActive => ClientState::FccUnicast,
            FccState::McastRequested => ClientState::FccMcastRequested,
            FccState::McastTransition => ClientState::FccMcastTransition,
            FccState::McastActive => ClientState::FccMcastActive,
            FccState::Error => ClientState::FccError,
        }
    }

    pub fn unicast_socket_mut(&mut self) -> Option<&mut mio::net::UdpSocket> {
        self.unicast.as_mut()
    }

    pub fn mcast_socket_mut(&mut self) -> Option<&mut mio::net::UdpSocket> {
        self.mcast.as_mut()
    }

    /// Hand the unicast socket to the worker for deregistration.
    pub fn take_unicast_socket(&mut self) -> Option<mio::net::UdpSocket> {
        self.unicast.take()
    }

    /// Drain the unicast socket. Returns enqueued payload bytes and
    /// follow-up work for the worker.
    pub fn on_unicast_readable(
        &mut self,
        pool: &PacketPool,
        outq: &mut OutputQueue,
    ) -> Result<(u64, Vec<FccUpdate>)> {
        let mut enqueued = 0u64;
        let mut updates = Vec::new();
        loop {
            let Some(socket) = self.unicast.as_ref() else {
                break;
            };
            let mut buf = match pool.acquire() {
                Some(b) => b,
                None => {
                    let mut scratch = [0u8; crate::config::PKT_BUF_SIZE];
                    match socket.recv_from(&mut scratch) {
                        Ok(_) => {
                            log::debug!("[fcc] pool exhausted, unicast datagram dropped");
                            continue;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            let n = match socket.recv_from(buf.write_slot()) {
                Ok((n, _from)) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            buf.set_len(n);
            self.last_rx = Instant::now();

            match self.flavor.parse_server_datagram(buf.bytes()) {
                ServerDatagram::Media => {
                    enqueued += self.forward_unicast(buf, outq, &mut updates)?;
                }
                ServerDatagram::SyncNotify { handover_seq } => {
                    self.on_sync_notify(handover_seq, &mut updates)?;
                }
                ServerDatagram::TermAck => {
                    log::debug!("[fcc] termination acknowledged by {}", self.server);
                }
                ServerDatagram::Other => {}
            }
        }
        Ok((enqueued, updates))
    }

    /// Drain the multicast socket (silent join, transition, steady
    /// state).
    pub fn on_mcast_readable(
        &mut self,
        pool: &PacketPool,
        outq: &mut OutputQueue,
    ) -> Result<(u64, Vec<FccUpdate>)> {
        let mut enqueued = 0u64;
        let mut updates = Vec::new();
        loop {
            let Some(socket) = self.mcast.as_ref() else {
                break;
            };
            let mut buf = match pool.acquire() {
                Some(b) => b,
                None => {
                    let mut scratch = [0u8; crate::config::PKT_BUF_SIZE];
                    match socket.recv_from(&mut scratch) {
                        Ok(_) => {
                            log::debug!("[fcc] pool exhausted, multicast datagram dropped");
                            continue;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            let n = match socket.recv_from(buf.write_slot()) {
                Ok((n, _from)) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            buf.set_len(n);

            if rtp::is_rtcp(buf.bytes()) {
                continue;
            }
            let (hdr, range) = match rtp::parse(buf.bytes()) {
                Ok(ok) => ok,
                Err(_) => continue,
            };

            match self.state {
                FccState::McastRequested => {
                    // First multicast media opens the transition window.
                    self.state = FccState::McastTransition;
                    self.transition_since = Some(Instant::now());
                    self.retain_pending(hdr.seq, buf, range, outq, &mut updates);
                }
                FccState::McastTransition => {
                    self.retain_pending(hdr.seq, buf, range, outq, &mut updates);
                }
                FccState::McastActive => {
                    if self.mcast_tracker.accept(hdr.seq) == SeqVerdict::Accept {
                        let len = range.len();
                        if outq.push_packet(buf, range.start, len) {
                            enqueued += len as u64;
                        }
                    }
                }
                // Stray packets before the join completed bookkeeping.
                _ => {}
            }
        }
        Ok((enqueued, updates))
    }

    /// Timer duty: idle timeout before the burst flows, stuck-transition
    /// flush. Returns enqueued bytes (a forced handover flushes media)
    /// and follow-up work.
    pub fn on_tick(
        &mut self,
        now: Instant,
        outq: &mut OutputQueue,
    ) -> Result<(u64, Vec<FccUpdate>)> {
        let mut updates = Vec::new();
        let mut enqueued = 0u64;
        match self.state {
            FccState::Requested | FccState::UnicastActive | FccState::McastRequested => {
                if now.duration_since(self.last_rx) > FCC_IDLE_TIMEOUT {
                    log::warn!(
                        "[fcc] no traffic from {} for {:?}, falling back to multicast",
                        self.server,
                        FCC_IDLE_TIMEOUT
                    );
                    self.state = FccState::Error;
                    updates.push(FccUpdate::Fallback);
                }
            }
            FccState::McastTransition => {
                let stuck = self
                    .transition_since
                    .map(|t| now.duration_since(t) > FCC_IDLE_TIMEOUT)
                    .unwrap_or(false);
                if stuck {
                    log::debug!("[fcc] transition window expired, forcing handover");
                    enqueued = self.do_handover(outq, &mut updates);
                }
            }
            _ => {}
        }
        Ok((enqueued, updates))
    }

    /// Forward one burst media packet and check the handover condition.
    fn forward_unicast(
        &mut self,
        buf: PktBuf,
        outq: &mut OutputQueue,
        updates: &mut Vec<FccUpdate>,
    ) -> Result<u64> {
        let (hdr, range) = match rtp::parse(buf.bytes()) {
            Ok(ok) => ok,
            Err(_) => return Ok(0),
        };
        if self.state == FccState::Requested {
            self.state = FccState::UnicastActive;
            log::debug!("[fcc] burst media flowing (seq {})", hdr.seq);
        }
        let mut enqueued = 0u64;
        if self.uni_tracker.accept(hdr.seq) == SeqVerdict::Accept {
            let len = range.len();
            if outq.push_packet(buf, range.start, len) {
                enqueued = len as u64;
            }
        }
        // Handover once the burst caught up to the advertised sequence
        // (the server advertises the last sequence of the burst).
        if matches!(
            self.state,
            FccState::McastRequested | FccState::McastTransition
        ) {
            if let Some(handover) = self.handover_seq {
                let reached = hdr.seq.wrapping_sub(handover) < 0x8000;
                if reached {
                    enqueued += self.do_handover(outq, updates);
                }
            }
        }
        Ok(enqueued)
    }

    /// Server told us to join the real group.
    fn on_sync_notify(&mut self, handover_seq: u16, updates: &mut Vec<FccUpdate>) -> Result<()> {
        if !matches!(self.state, FccState::Requested | FccState::UnicastActive) {
            return Ok(()); // duplicate notification
        }
        self.handover_seq = Some(handover_seq);
        let socket = open_multicast_socket(
            SocketAddr::V4(self.group),
            self.source,
            self.iface,
        )?;
        self.mcast = Some(socket);
        self.state = FccState::McastRequested;
        updates.push(FccUpdate::RegisterMcast);
        log::info!(
            "[fcc] sync from {}: joining {} (handover at seq {})",
            self.server,
            self.group,
            handover_seq
        );
        Ok(())
    }

    /// Buffer one multicast packet during the transition window; a full
    /// buffer forces the handover.
    fn retain_pending(
        &mut self,
        seq: u16,
        buf: PktBuf,
        range: std::ops::Range<usize>,
        outq: &mut OutputQueue,
        updates: &mut Vec<FccUpdate>,
    ) {
        if self.pending.iter().any(|p| p.seq == seq) {
            return;
        }
        self.pending.push(PendingPkt {
            seq,
            buf,
            off: range.start as u16,
            len: range.len() as u16,
        });
        if self.pending.len() >= FCC_PENDING_LIMIT {
            log::debug!("[fcc] pending watermark reached, forcing handover");
            self.do_handover(outq, updates);
        }
    }

    /// Flush the pending list in sequence order (deduplicated against
    /// the unicast position), release the server and go steady-state.
    /// Returns the flushed payload bytes.
    fn do_handover(&mut self, outq: &mut OutputQueue, updates: &mut Vec<FccUpdate>) -> u64 {
        debug_assert!(matches!(
            self.state,
            FccState::McastRequested | FccState::McastTransition
        ));
        let last_uni = self
            .uni_tracker
            .last()
            .or(self.handover_seq.map(|h| h.wrapping_sub(1)))
            .unwrap_or(0);

        let mut pending = std::mem::take(&mut self.pending);
        // Wrapping order relative to the unicast position; packets at or
        // behind it were already delivered over unicast.
        pending.sort_by_key(|p| p.seq.wrapping_sub(last_uni));
        let mut flushed = 0usize;
        let mut enqueued = 0u64;
        for pkt in pending {
            let ahead = pkt.seq.wrapping_sub(last_uni);
            if ahead == 0 || ahead >= 0x8000 {
                continue;
            }
            self.mcast_tracker.seed(pkt.seq);
            if outq.push_packet(pkt.buf, usize::from(pkt.off), usize::from(pkt.len)) {
                enqueued += u64::from(pkt.len);
            }
            flushed += 1;
        }
        self.send_termination(last_uni);
        self.state = FccState::McastActive;
        updates.push(FccUpdate::DropUnicast);
        log::info!(
            "[fcc] handover to {} complete ({} buffered packets flushed)",
            self.group,
            flushed
        );
        enqueued
    }

    /// One-shot release of server-side burst resources.
    fn send_termination(&mut self, final_seq: u16) {
        if self.term_sent {
            return;
        }
        self.term_sent = true;
        let msg = self
            .flavor
            .encode_termination(*self.group.ip(), self.group.port(), final_seq);
        if let Some(sock) = self.unicast.as_ref() {
            if let Err(e) = sock.send_to(&msg, self.server) {
                log::debug!("[fcc] termination send failed: {}", e);
            }
        }
    }
}

/// Bind the FCC unicast socket, honoring the configured port range.
fn bind_unicast(port_range: Option<(u16, u16)>) -> Result<mio::net::UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    sock.set_nonblocking(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;

    match port_range {
        Some((lo, hi)) => {
            for port in lo..=hi {
                let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
                if sock.bind(&addr.into()).is_ok() {
                    return Ok(mio::net::UdpSocket::from_std(sock.into()));
                }
            }
            Err(Error::BindFailed(format!(
                "no free fcc port in {}..={}",
                lo, hi
            )))
        }
        None => {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
            sock.bind(&addr.into())
                .map_err(|e| Error::BindFailed(e.to_string()))?;
            Ok(mio::net::UdpSocket::from_std(sock.into()))
        }
    }
}
