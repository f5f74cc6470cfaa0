// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream ingress paths.
//!
//! Each streaming connection owns exactly one of these: a plain
//! multicast join, an FCC burst session, an RTSP session or an HTTP
//! relay. The worker dispatches readiness and timer events into the
//! owning context; all of them feed the same per-client output queue.

/// FCC burst → multicast handover engine.
pub mod fcc;
/// HTTP upstream pass-through.
pub mod relay;
/// RTSP client state machine.
pub mod rtsp;
/// Plain multicast (RTP / raw UDP) ingress.
pub mod udp;

use fcc::FccSession;
use relay::HttpRelay;
use rtsp::RtspSession;
use udp::UdpIngress;

/// The per-connection stream context.
pub enum StreamCtx {
    Udp(UdpIngress),
    Fcc(FccSession),
    Rtsp(RtspSession),
    Relay(HttpRelay),
}

impl StreamCtx {
    pub fn kind_str(&self) -> &'static str {
        match self {
            StreamCtx::Udp(_) => "udp",
            StreamCtx::Fcc(_) => "fcc",
            StreamCtx::Rtsp(_) => "rtsp",
            StreamCtx::Relay(_) => "relay",
        }
    }
}
