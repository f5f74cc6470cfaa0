// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FCC wire flavors.
//!
//! Two server dialects exist in the field. The state machine never
//! looks at bytes itself; it goes through [`Flavor`], which encodes the
//! request and termination messages and classifies every datagram the
//! server sends back. The layouts below are the bit-exact contract of
//! this gateway; interop with a different server build means editing
//! this module only.
//!
//! # Telecom dialect (RTCP-shaped)
//!
//! Request, RTPFB FMT=5, 24 bytes:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  FMT=5  |    PT=205     |          length=5             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     sender SSRC = "FCCR"                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        media SSRC = 0                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        client media port      |            flags=0            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    multicast group address                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        multicast port         |           reserved            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Termination is the same shape with FMT=6, length=4 (20 bytes): the
//! FCI carries the final unicast sequence instead of the client port.
//!
//! Server control traffic is an RTCP APP packet (PT=204) named "TFCC";
//! subtype 1 is the multicast-sync notification (FCI word: handover
//! sequence), subtype 2 acknowledges termination. Anything RTP-shaped
//! that is not RTCP is burst media.
//!
//! # Huawei dialect (16-byte control header)
//!
//! ```text
//!  0        1        2        3        4..5     6..7     8..11    12..13   14..15
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! | 0xFC   | ver=1  | type   | flags  | length | seq/port| group  | gport  | rsvd  |
//! +--------+--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! type: 0x01 request (field 6..7 = client port), 0x02 sync notify
//! (6..7 = handover sequence), 0x03 termination (6..7 = final unicast
//! sequence), 0x04 termination ack. Burst media is plain RTP and never
//! starts with 0xFC since RTP version 2 needs the top bits to be 10.

use crate::core::rtp;
use std::net::{Ipv4Addr, SocketAddr};

/// RTCP payload types used by the Telecom dialect.
const RTCP_PT_RTPFB: u8 = 205;
const RTCP_PT_APP: u8 = 204;
/// RTPFB FMT codes.
const TELECOM_FMT_REQUEST: u8 = 5;
const TELECOM_FMT_TERMINATION: u8 = 6;
/// Fixed sender SSRC in client-originated messages: "FCCR".
const TELECOM_SSRC: u32 = 0x4643_4352;
/// APP packet name: "TFCC".
const TELECOM_APP_NAME: [u8; 4] = *b"TFCC";
/// APP subtypes.
const TELECOM_SUB_SYNC: u8 = 1;
const TELECOM_SUB_TERM_ACK: u8 = 2;

/// Huawei control header.
const HUAWEI_MAGIC: u8 = 0xFC;
const HUAWEI_VERSION: u8 = 0x01;
const HUAWEI_LEN: usize = 16;
const HUAWEI_TYPE_REQUEST: u8 = 0x01;
const HUAWEI_TYPE_SYNC: u8 = 0x02;
const HUAWEI_TYPE_TERMINATION: u8 = 0x03;
const HUAWEI_TYPE_TERM_ACK: u8 = 0x04;

/// What a server datagram turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerDatagram {
    /// RTP burst media; run it through the normal acceptance path.
    Media,
    /// Join the multicast group; hand over at `handover_seq`.
    SyncNotify { handover_seq: u16 },
    /// Server released the session.
    TermAck,
    /// Unparseable or irrelevant; drop silently.
    Other,
}

/// FCC server dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Telecom,
    Huawei,
}

impl Flavor {
    /// Explicit `fcc-type` query value.
    pub fn from_param(s: &str) -> Option<Flavor> {
        match s.to_ascii_lowercase().as_str() {
            "telecom" => Some(Flavor::Telecom),
            "huawei" => Some(Flavor::Huawei),
            _ => None,
        }
    }

    /// Port-parity convention when `fcc-type` is absent: deployments put
    /// Huawei burst servers on odd ports.
    pub fn infer(server: SocketAddr) -> Flavor {
        if server.port() % 2 == 1 {
            Flavor::Huawei
        } else {
            Flavor::Telecom
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Flavor::Telecom => "telecom",
            Flavor::Huawei => "huawei",
        }
    }

    /// Burst request datagram. `client_port` is the (possibly
    /// NAT-mapped) port the server should unicast media to.
    pub fn encode_request(self, group: Ipv4Addr, group_port: u16, client_port: u16) -> Vec<u8> {
        match self {
            Flavor::Telecom => {
                let mut out = Vec::with_capacity(24);
                out.push(0x80 | TELECOM_FMT_REQUEST);
                out.push(RTCP_PT_RTPFB);
                out.extend_from_slice(&5u16.to_be_bytes());
                out.extend_from_slice(&TELECOM_SSRC.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&client_port.to_be_bytes());
                out.extend_from_slice(&0u16.to_be_bytes());
                out.extend_from_slice(&group.octets());
                out.extend_from_slice(&group_port.to_be_bytes());
                out.extend_from_slice(&0u16.to_be_bytes());
                out
            }
            Flavor::Huawei => {
                huawei_message(HUAWEI_TYPE_REQUEST, client_port, group, group_port)
            }
        }
    }

    /// One-shot termination datagram releasing server-side resources.
    /// `final_seq` is the last unicast sequence the client consumed.
    pub fn encode_termination(self, group: Ipv4Addr, group_port: u16, final_seq: u16) -> Vec<u8> {
        match self {
            Flavor::Telecom => {
                let mut out = Vec::with_capacity(20);
                out.push(0x80 | TELECOM_FMT_TERMINATION);
                out.push(RTCP_PT_RTPFB);
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&TELECOM_SSRC.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&final_seq.to_be_bytes());
                out.extend_from_slice(&0u16.to_be_bytes());
                out.extend_from_slice(&group.octets());
                out
            }
            Flavor::Huawei => {
                huawei_message(HUAWEI_TYPE_TERMINATION, final_seq, group, group_port)
            }
        }
    }

    /// Classify an incoming datagram from the unicast socket.
    pub fn parse_server_datagram(self, buf: &[u8]) -> ServerDatagram {
        match self {
            Flavor::Telecom => parse_telecom(buf),
            Flavor::Huawei => parse_huawei(buf),
        }
    }
}

fn huawei_message(msg_type: u8, field: u16, group: Ipv4Addr, group_port: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HUAWEI_LEN);
    out.push(HUAWEI_MAGIC);
    out.push(HUAWEI_VERSION);
    out.push(msg_type);
    out.push(0); // flags
    out.extend_from_slice(&(HUAWEI_LEN as u16).to_be_bytes());
    out.extend_from_slice(&field.to_be_bytes());
    out.extend_from_slice(&group.octets());
    out.extend_from_slice(&group_port.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

fn parse_telecom(buf: &[u8]) -> ServerDatagram {
    if !rtp::is_rtcp(buf) {
        return if rtp::parse(buf).is_ok() {
            ServerDatagram::Media
        } else {
            ServerDatagram::Other
        };
    }
    // APP "TFCC": 4 header + 4 ssrc + 4 name + 4 FCI.
    if buf.len() >= 16 && buf[1] & 0x7F == RTCP_PT_APP && buf[8..12] == TELECOM_APP_NAME {
        let subtype = buf[0] & 0x1F;
        match subtype {
            TELECOM_SUB_SYNC => ServerDatagram::SyncNotify {
                handover_seq: u16::from_be_bytes([buf[12], buf[13]]),
            },
            TELECOM_SUB_TERM_ACK => ServerDatagram::TermAck,
            _ => ServerDatagram::Other,
        }
    } else {
        ServerDatagram::Other
    }
}

fn parse_huawei(buf: &[u8]) -> ServerDatagram {
    if buf.len() >= HUAWEI_LEN && buf[0] == HUAWEI_MAGIC && buf[1] == HUAWEI_VERSION {
        return match buf[2] {
            HUAWEI_TYPE_SYNC => ServerDatagram::SyncNotify {
                handover_seq: u16::from_be_bytes([buf[6], buf[7]]),
            },
            HUAWEI_TYPE_TERM_ACK => ServerDatagram::TermAck,
            _ => ServerDatagram::Other,
        };
    }
    if rtp::parse(buf).is_ok() && !rtp::is_rtcp(buf) {
        ServerDatagram::Media
    } else {
        ServerDatagram::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rtp::RtpHeader;

    const GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 1);

    #[test]
    fn telecom_request_bytes() {
        let pkt = Flavor::Telecom.encode_request(GROUP, 5000, 0x3039);
        assert_eq!(
            pkt,
            [
                0x85, 205, 0x00, 0x05, // header, length 5 words
                0x46, 0x43, 0x43, 0x52, // "FCCR"
                0x00, 0x00, 0x00, 0x00, // media ssrc
                0x30, 0x39, 0x00, 0x00, // client port 12345, flags
                239, 1, 1, 1, // group
                0x13, 0x88, 0x00, 0x00, // port 5000, reserved
            ]
        );
    }

    #[test]
    fn telecom_termination_bytes() {
        let pkt = Flavor::Telecom.encode_termination(GROUP, 5000, 0xABCD);
        assert_eq!(
            pkt,
            [
                0x86, 205, 0x00, 0x04, 0x46, 0x43, 0x43, 0x52, 0x00, 0x00, 0x00, 0x00, 0xAB,
                0xCD, 0x00, 0x00, 239, 1, 1, 1,
            ]
        );
    }

    #[test]
    fn huawei_request_bytes() {
        let pkt = Flavor::Huawei.encode_request(GROUP, 5000, 40000);
        assert_eq!(
            pkt,
            [
                0xFC, 0x01, 0x01, 0x00, 0x00, 0x10, 0x9C, 0x40, 239, 1, 1, 1, 0x13, 0x88, 0x00,
                0x00,
            ]
        );
    }

    #[test]
    fn huawei_termination_bytes() {
        let pkt = Flavor::Huawei.encode_termination(GROUP, 5000, 0x0102);
        assert_eq!(pkt[2], 0x03);
        assert_eq!(&pkt[6..8], &[0x01, 0x02]);
        assert_eq!(pkt.len(), 16);
    }

    #[test]
    fn telecom_sync_notification_parses() {
        // APP "TFCC" subtype 1 carrying handover seq 0x1234.
        let pkt = [
            0x81, 204, 0x00, 0x04, 0x00, 0x00, 0x00, 0x07, b'T', b'F', b'C', b'C', 0x12, 0x34,
            0x00, 0x00,
        ];
        assert_eq!(
            Flavor::Telecom.parse_server_datagram(&pkt),
            ServerDatagram::SyncNotify {
                handover_seq: 0x1234
            }
        );
        let mut ack = pkt;
        ack[0] = 0x82;
        assert_eq!(
            Flavor::Telecom.parse_server_datagram(&ack),
            ServerDatagram::TermAck
        );
    }

    #[test]
    fn huawei_sync_notification_parses() {
        let pkt = Flavor::Huawei.encode_request(GROUP, 5000, 0);
        // Rewrite as a server sync with handover 0xBEEF.
        let mut sync = pkt;
        sync[2] = 0x02;
        sync[6] = 0xBE;
        sync[7] = 0xEF;
        assert_eq!(
            Flavor::Huawei.parse_server_datagram(&sync),
            ServerDatagram::SyncNotify {
                handover_seq: 0xBEEF
            }
        );
    }

    #[test]
    fn media_classified_for_both_flavors() {
        let media = RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 33,
            seq: 9,
            timestamp: 0,
            ssrc: 1,
        }
        .synthesize(b"TSDATA");
        assert_eq!(
            Flavor::Telecom.parse_server_datagram(&media),
            ServerDatagram::Media
        );
        assert_eq!(
            Flavor::Huawei.parse_server_datagram(&media),
            ServerDatagram::Media
        );
    }

    #[test]
    fn junk_is_other() {
        assert_eq!(
            Flavor::Telecom.parse_server_datagram(&[0u8; 7]),
            ServerDatagram::Other
        );
        assert_eq!(
            Flavor::Huawei.parse_server_datagram(&[0xFC, 0x02, 0, 0]),
            ServerDatagram::Other
        );
    }

    #[test]
    fn param_and_port_inference() {
        assert_eq!(Flavor::from_param("telecom"), Some(Flavor::Telecom));
        assert_eq!(Flavor::from_param("HUAWEI"), Some(Flavor::Huawei));
        assert_eq!(Flavor::from_param("zte"), None);
        assert_eq!(
            Flavor::infer("1.2.3.4:8027".parse().expect("addr")),
            Flavor::Huawei
        );
        assert_eq!(
            Flavor::infer("1.2.3.4:8028".parse().expect("addr")),
            Flavor::Telecom
        );
    }
}
