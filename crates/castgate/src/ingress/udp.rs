// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plain multicast ingress (RTP and raw UDP).
//!
//! Joins the group (source-filtered when the service carries an SSM
//! source), reads datagrams straight into pool buffers and enqueues the
//! extracted payload by reference. An optional periodic rejoin re-sends
//! the membership to survive routers that expire silent groups.

use crate::config::PKT_BUF_SIZE;
use crate::core::{rtp, OutputQueue, PacketPool, SeqTracker, SeqVerdict};
use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// Resolve a configured interface name to its IPv4 address for
/// membership messages. No name (or an unknown one) selects the
/// kernel's default interface.
pub fn resolve_iface(name: Option<&str>) -> Ipv4Addr {
    let Some(wanted) = name else {
        return Ipv4Addr::UNSPECIFIED;
    };
    match local_ip_address::list_afinet_netifas() {
        Ok(ifas) => {
            for (ifname, ip) in ifas {
                if ifname == wanted {
                    if let IpAddr::V4(v4) = ip {
                        return v4;
                    }
                }
            }
            log::warn!("[udp] interface {} not found, using default", wanted);
            Ipv4Addr::UNSPECIFIED
        }
        Err(e) => {
            log::warn!("[udp] interface enumeration failed: {}", e);
            Ipv4Addr::UNSPECIFIED
        }
    }
}

/// Bind to the group port, join the group (source-filtered when `source`
/// is set) and return the nonblocking socket. Shared by the plain
/// multicast path and the FCC engine's silent join.
pub fn open_multicast_socket(
    group: SocketAddr,
    source: Option<IpAddr>,
    iface: Ipv4Addr,
) -> Result<mio::net::UdpSocket> {
    let domain = match group {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    sock.set_reuse_address(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    let bind_addr: SocketAddr = match group {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port()),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), group.port()),
    };
    sock.bind(&bind_addr.into())
        .map_err(|e| Error::BindFailed(format!("{}: {}", bind_addr, e)))?;
    sock.set_nonblocking(true)
        .map_err(|e| Error::BindFailed(e.to_string()))?;
    join(&sock, group, source, iface)?;
    Ok(mio::net::UdpSocket::from_std(sock.into()))
}

/// One joined multicast group feeding one client.
pub struct UdpIngress {
    socket: mio::net::UdpSocket,
    group: SocketAddr,
    source: Option<IpAddr>,
    iface: Ipv4Addr,
    /// Forward datagrams verbatim instead of stripping RTP framing.
    raw_udp: bool,
    tracker: SeqTracker,
    rejoin_interval: Option<Duration>,
    next_rejoin: Option<Instant>,
    malformed: u64,
    dropped: u64,
}

impl UdpIngress {
    /// Bind to the group port, join the group and go nonblocking.
    pub fn open(
        group: SocketAddr,
        source: Option<IpAddr>,
        raw_udp: bool,
        iface_name: Option<&str>,
        rejoin_interval: Option<Duration>,
    ) -> Result<Self> {
        let iface = resolve_iface(iface_name);
        let socket = open_multicast_socket(group, source, iface)?;
        log::info!(
            "[udp] joined {}{}",
            group,
            source
                .map(|s| format!(" (source {})", s))
                .unwrap_or_default()
        );
        Ok(Self {
            socket,
            group,
            source,
            iface,
            raw_udp,
            tracker: SeqTracker::new(),
            rejoin_interval,
            next_rejoin: rejoin_interval.map(|d| Instant::now() + d),
            malformed: 0,
            dropped: 0,
        })
    }

    /// Socket handle for poll registration.
    pub fn socket_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }

    /// Seed the duplicate tracker (FCC handover carries the position over).
    pub fn seed_tracker(&mut self, seq: u16) {
        self.tracker.seed(seq);
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// Packets rejected by the header validator.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// Packets dropped for back-pressure or pool starvation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Drain the socket; returns payload bytes enqueued to the client.
    pub fn on_readable(&mut self, pool: &PacketPool, outq: &mut OutputQueue) -> Result<u64> {
        let mut enqueued = 0u64;
        loop {
            let mut buf = match pool.acquire() {
                Some(b) => b,
                None => {
                    // Starved: still drain the socket so readiness clears.
                    let mut scratch = [0u8; PKT_BUF_SIZE];
                    match self.socket.recv_from(&mut scratch) {
                        Ok(_) => {
                            self.dropped += 1;
                            log::debug!("[udp] pool exhausted, datagram dropped");
                            continue;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            let n = match self.socket.recv_from(buf.write_slot()) {
                Ok((n, _from)) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            buf.set_len(n);
            enqueued += self.accept(buf, outq);
        }
        Ok(enqueued)
    }

    /// Validate one datagram and enqueue its payload.
    fn accept(&mut self, buf: crate::core::PktBuf, outq: &mut OutputQueue) -> u64 {
        if self.raw_udp {
            let len = buf.len();
            if len == 0 || !outq.push_packet(buf, 0, len) {
                self.dropped += 1;
                return 0;
            }
            return len as u64;
        }
        if rtp::is_rtcp(buf.bytes()) {
            return 0;
        }
        let (hdr, range) = match rtp::parse(buf.bytes()) {
            Ok(ok) => ok,
            Err(e) => {
                self.malformed += 1;
                log::trace!("[udp] malformed rtp ({}) from {}", e.as_str(), self.group);
                return 0;
            }
        };
        match self.tracker.accept(hdr.seq) {
            SeqVerdict::Accept => {
                let len = range.len();
                if outq.push_packet(buf, range.start, len) {
                    len as u64
                } else {
                    self.dropped += 1;
                    0
                }
            }
            SeqVerdict::Duplicate | SeqVerdict::Late => 0,
        }
    }

    /// Timer duty: periodic rejoin.
    pub fn on_tick(&mut self, now: Instant) {
        let Some(interval) = self.rejoin_interval else {
            return;
        };
        let Some(due) = self.next_rejoin else { return };
        if now < due {
            return;
        }
        self.next_rejoin = Some(now + interval);
        // Re-sending the membership on a joined socket gets EADDRINUSE
        // from some stacks; that still refreshes the router state.
        let sock = socket2::SockRef::from(&self.socket);
        match join(&sock, self.group, self.source, self.iface) {
            Ok(()) => log::debug!("[udp] rejoined {}", self.group),
            Err(e) => log::debug!("[udp] rejoin of {} failed: {}", self.group, e),
        }
    }
}

/// Issue the (source-specific) membership message.
fn join(sock: &Socket, group: SocketAddr, source: Option<IpAddr>, iface: Ipv4Addr) -> Result<()> {
    let outcome = match (group.ip(), source) {
        (IpAddr::V4(g), Some(IpAddr::V4(s))) => sock.join_ssm_v4(&s, &g, &iface),
        (IpAddr::V4(g), None) => sock.join_multicast_v4(&g, &iface),
        (IpAddr::V6(g), None) => sock.join_multicast_v6(&g, 0),
        (IpAddr::V6(_), Some(_)) => {
            return Err(Error::MulticastJoinFailed(
                "source-specific join is IPv4 only".into(),
            ))
        }
        (IpAddr::V4(_), Some(IpAddr::V6(_))) => {
            return Err(Error::MulticastJoinFailed(
                "v6 source for v4 group".into(),
            ))
        }
    };
    match outcome {
        Ok(()) => Ok(()),
        // Already a member: fine for the rejoin path.
        Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => Ok(()),
        Err(e) => Err(Error::MulticastJoinFailed(format!("{}: {}", group, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK};
    use crate::core::rtp::RtpHeader;

    fn media(seq: u16, payload: &[u8]) -> Vec<u8> {
        RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 33,
            seq,
            timestamp: 0,
            ssrc: 7,
        }
        .synthesize(payload)
    }

    fn loopback_ingress(raw_udp: bool) -> (UdpIngress, std::net::UdpSocket) {
        // Loopback multicast keeps the test self-contained.
        let ingress = UdpIngress::open(
            "239.255.42.42:0".parse::<SocketAddr>().expect("addr"),
            None,
            raw_udp,
            None,
            None,
        )
        .expect("open ingress");
        let local_port = ingress
            .socket
            .local_addr()
            .expect("bound socket")
            .port();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").expect("sender bind");
        sender
            .connect(("127.0.0.1", local_port))
            .expect("connect loopback");
        (ingress, sender)
    }

    fn drain(ingress: &mut UdpIngress, pool: &PacketPool, outq: &mut OutputQueue) -> u64 {
        // Let loopback delivery land before draining.
        std::thread::sleep(Duration::from_millis(30));
        ingress.on_readable(pool, outq).expect("drain socket")
    }

    fn queued_payload(outq: &mut OutputQueue) -> Vec<u8> {
        let mut sink = Vec::new();
        let mut written = 0u64;
        outq.drain_into(&mut sink, &mut written).expect("drain queue");
        sink
    }

    #[test]
    fn rtp_payload_extracted_and_deduplicated() {
        let (mut ingress, sender) = loopback_ingress(false);
        let pool = PacketPool::new(16);
        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);

        for (seq, payload) in [(100u16, "A"), (100, "A"), (101, "B"), (101, "B"), (102, "C")] {
            sender
                .send(&media(seq, payload.as_bytes()))
                .expect("send datagram");
        }
        let bytes = drain(&mut ingress, &pool, &mut outq);
        assert_eq!(bytes, 3);
        assert_eq!(queued_payload(&mut outq), b"ABC");
    }

    #[test]
    fn raw_udp_forwards_verbatim() {
        let (mut ingress, sender) = loopback_ingress(true);
        let pool = PacketPool::new(4);
        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);

        sender.send(b"\x47TSPACKET").expect("send datagram");
        let bytes = drain(&mut ingress, &pool, &mut outq);
        assert_eq!(bytes, 9);
        assert_eq!(queued_payload(&mut outq), b"\x47TSPACKET");
    }

    #[test]
    fn malformed_counted_and_buffer_released() {
        let (mut ingress, sender) = loopback_ingress(false);
        let pool = PacketPool::new(4);
        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);

        sender.send(&[0x40, 1, 2, 3]).expect("send datagram"); // version 1
        let bytes = drain(&mut ingress, &pool, &mut outq);
        assert_eq!(bytes, 0);
        assert_eq!(ingress.malformed_count(), 1);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn backpressure_drops_and_counts() {
        let (mut ingress, sender) = loopback_ingress(false);
        let pool = PacketPool::new(8);
        // Tiny watermark: the first packet saturates the queue.
        let mut outq = OutputQueue::new(4, 2);

        sender.send(&media(1, b"AAAAAAAA")).expect("send datagram");
        sender.send(&media(2, b"BBBBBBBB")).expect("send datagram");
        drain(&mut ingress, &pool, &mut outq);
        assert_eq!(ingress.dropped_count(), 1);
        assert_eq!(queued_payload(&mut outq), b"AAAAAAAA");
        // Dropped packet's buffer went back to the pool.
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn iface_fallback_is_unspecified() {
        assert_eq!(resolve_iface(None), Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            resolve_iface(Some("definitely-no-such-iface0")),
            Ipv4Addr::UNSPECIFIED
        );
    }
}
