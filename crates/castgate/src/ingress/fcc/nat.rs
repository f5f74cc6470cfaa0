// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NAT traversal for the FCC unicast socket.
//!
//! Both modes only change the downstream port advertised inside the FCC
//! request; the media path is untouched.
//!
//! - Hole punch: one empty datagram towards the server opens the
//!   conntrack pinhole so the burst can come back in.
//! - NAT-PMP (RFC 6886): ask the default gateway for a UDP mapping and
//!   advertise the external port from the reply.
//!
//! # NAT-PMP wire format (RFC 6886 Section 3.3)
//!
//! ```text
//! Request (12 bytes):           Response (16 bytes):
//!  0: version = 0                0: version = 0
//!  1: opcode  = 1 (map UDP)      1: opcode  = 129
//!  2-3: reserved                 2-3: result code (0 = success)
//!  4-5: internal port            4-7: seconds since epoch
//!  6-7: suggested external port  8-9: internal port
//!  8-11: lifetime (seconds)     10-11: mapped external port
//!                               12-15: lifetime (seconds)
//! ```

use std::io::{self, BufRead};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// NAT-PMP control port on the gateway.
const PMP_PORT: u16 = 5351;
/// Requested mapping lifetime. FCC sessions are short; an hour is ample.
const PMP_LIFETIME_SECS: u32 = 3600;
/// One-shot control exchange budget.
const PMP_TIMEOUT: Duration = Duration::from_millis(250);

const PMP_VERSION: u8 = 0;
const PMP_OP_MAP_UDP: u8 = 1;
const PMP_OP_MAP_UDP_RESPONSE: u8 = 129;

/// Open the conntrack pinhole towards the FCC server.
pub fn hole_punch(socket: &mio::net::UdpSocket, server: SocketAddr) -> io::Result<()> {
    socket.send_to(&[], server)?;
    Ok(())
}

/// Encode a NAT-PMP UDP mapping request for `internal_port`.
pub fn encode_pmp_request(internal_port: u16) -> [u8; 12] {
    let mut req = [0u8; 12];
    req[0] = PMP_VERSION;
    req[1] = PMP_OP_MAP_UDP;
    req[4..6].copy_from_slice(&internal_port.to_be_bytes());
    // Suggested external port 0: let the gateway pick.
    req[8..12].copy_from_slice(&PMP_LIFETIME_SECS.to_be_bytes());
    req
}

/// Extract the mapped external port from a NAT-PMP response for
/// `internal_port`. `None` for malformed, failed or mismatched replies.
pub fn parse_pmp_response(buf: &[u8], internal_port: u16) -> Option<u16> {
    if buf.len() < 16 || buf[0] != PMP_VERSION || buf[1] != PMP_OP_MAP_UDP_RESPONSE {
        return None;
    }
    let result = u16::from_be_bytes([buf[2], buf[3]]);
    if result != 0 {
        return None;
    }
    if u16::from_be_bytes([buf[8], buf[9]]) != internal_port {
        return None;
    }
    Some(u16::from_be_bytes([buf[10], buf[11]]))
}

/// Best-effort NAT-PMP mapping. Returns the external port to advertise,
/// or `None` when no gateway answered in time (the caller falls back to
/// the local port).
///
/// This is a one-shot blocking exchange with a 250 ms budget, done once
/// per FCC session before any media flows.
pub fn request_pmp_mapping(internal_port: u16) -> Option<u16> {
    let gateway = default_gateway()?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.set_read_timeout(Some(PMP_TIMEOUT)).ok()?;
    let target = SocketAddrV4::new(gateway, PMP_PORT);
    socket.send_to(&encode_pmp_request(internal_port), target).ok()?;

    let mut buf = [0u8; 32];
    let (n, from) = socket.recv_from(&mut buf).ok()?;
    if from.ip() != std::net::IpAddr::V4(gateway) {
        return None;
    }
    let mapped = parse_pmp_response(&buf[..n], internal_port);
    match mapped {
        Some(port) => {
            log::debug!(
                "[fcc] NAT-PMP mapped {} -> external {} via {}",
                internal_port,
                port,
                gateway
            );
            Some(port)
        }
        None => {
            log::debug!("[fcc] NAT-PMP gateway {} refused mapping", gateway);
            None
        }
    }
}

/// Default IPv4 gateway from `/proc/net/route`.
#[cfg(target_os = "linux")]
pub fn default_gateway() -> Option<Ipv4Addr> {
    let file = std::fs::File::open("/proc/net/route").ok()?;
    for line in io::BufReader::new(file).lines().map_while(|l| l.ok()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Iface Destination Gateway Flags ...; default route has dest 0.
        if fields.len() < 3 || fields[1] != "00000000" {
            continue;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        // /proc/net/route stores the address in host byte order of the
        // little-endian kernel dump; the octets come out reversed.
        let octets = raw.to_le_bytes();
        return Some(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]));
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn default_gateway() -> Option<Ipv4Addr> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmp_request_bytes() {
        let req = encode_pmp_request(40000);
        assert_eq!(
            req,
            [0, 1, 0, 0, 0x9C, 0x40, 0, 0, 0x00, 0x00, 0x0E, 0x10]
        );
    }

    #[test]
    fn pmp_response_happy_path() {
        let mut resp = [0u8; 16];
        resp[1] = PMP_OP_MAP_UDP_RESPONSE;
        resp[8..10].copy_from_slice(&40000u16.to_be_bytes());
        resp[10..12].copy_from_slice(&51234u16.to_be_bytes());
        assert_eq!(parse_pmp_response(&resp, 40000), Some(51234));
    }

    #[test]
    fn pmp_response_rejections() {
        let mut resp = [0u8; 16];
        resp[1] = PMP_OP_MAP_UDP_RESPONSE;
        resp[8..10].copy_from_slice(&40000u16.to_be_bytes());
        resp[10..12].copy_from_slice(&51234u16.to_be_bytes());

        // Error result code.
        let mut failed = resp;
        failed[3] = 2;
        assert_eq!(parse_pmp_response(&failed, 40000), None);

        // Reply for a different internal port.
        assert_eq!(parse_pmp_response(&resp, 40001), None);

        // Wrong opcode, short packet.
        let mut wrong_op = resp;
        wrong_op[1] = 1;
        assert_eq!(parse_pmp_response(&wrong_op, 40000), None);
        assert_eq!(parse_pmp_response(&resp[..10], 40000), None);
    }
}
