// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTSP client.
//!
//! Drives DESCRIBE → SETUP → PLAY against the upstream server over one
//! nonblocking TCP connection, demuxes interleaved media off the same
//! socket and forwards the payload to the client queue. Redirects
//! reconnect against the new URL (bounded hops); a `461 Unsupported
//! Transport` on SETUP falls back to UDP transport. TEARDOWN is
//! best-effort on every clean or unclean end.

/// `$`-framed channel demux.
pub mod interleave;
/// Request building / response parsing.
pub mod message;
/// SDP control/track extraction.
pub mod sdp;
/// Time-shift `Range` translation.
pub mod seek;

use crate::config::{RTSP_MAX_REDIRECTS, RTSP_RESPONSE_TIMEOUT};
use crate::core::{rtp, OutputQueue, PacketPool, SeqTracker, SeqVerdict};
use crate::error::{Error, Result};
use crate::service::{RtspTarget, SeekSpec};
use crate::status::ClientState;
use interleave::{Demuxed, InterleavedBuf};
use message::RtspRequest;
use sdp::PayloadProto;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

/// Interleaved channel pair requested at SETUP.
const CHANNEL_RTP: u8 = 0;
const CHANNEL_RTCP: u8 = 1;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Connecting,
    Describing,
    SettingUp,
    Starting,
    Playing,
    Paused,
    TearingDown,
    Terminated,
}

/// Transport negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportMode {
    TcpInterleaved,
    Udp,
}

/// Follow-up work for the worker after a session callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspAction {
    /// The control socket was replaced (redirect); re-register it.
    Reconnect,
    /// UDP fallback sockets exist; register them.
    RegisterUdp,
    /// PLAY succeeded; the stream preamble can go out.
    StreamingStarted,
    /// Session ended cleanly.
    Finished,
}

/// One upstream RTSP session.
pub struct RtspSession {
    state: RtspState,
    stream: mio::net::TcpStream,
    /// Current control URL (follows redirects and `a=control:`).
    url: String,
    session_url: String,
    cseq: u32,
    session_id: Option<String>,
    user_agent: Option<String>,
    range: Option<String>,
    mode: TransportMode,
    proto: PayloadProto,
    demux: InterleavedBuf,
    tracker: SeqTracker,
    redirects: u8,
    /// Pending outgoing control bytes (socket may be unwritable).
    txbuf: Vec<u8>,
    tx_off: usize,
    /// Set while a control response is owed.
    awaiting_since: Option<Instant>,
    udp_rtp: Option<mio::net::UdpSocket>,
    udp_rtcp: Option<mio::net::UdpSocket>,
    connected: bool,
    /// StreamingStarted was already reported (pause/resume must not
    /// re-emit it).
    started: bool,
}

impl RtspSession {
    /// Resolve the target, start the nonblocking connect and prepare the
    /// seek range. The caller registers `stream_mut` for read+write.
    pub fn start(
        target: &RtspTarget,
        seek: Option<&SeekSpec>,
        user_agent: Option<String>,
        tz_offset_secs: i32,
    ) -> Result<Self> {
        let range = match seek {
            Some(spec) => Some(
                seek::translate(&spec.value, tz_offset_secs, spec.offset_secs)
                    .map_err(|e| Error::BadUrl(e.to_string()))?,
            ),
            None => None,
        };
        let url = target.url();
        let stream = connect(&target.host, target.port)?;
        log::info!("[rtsp] connecting to {}:{}", target.host, target.port);
        Ok(Self {
            state: RtspState::Connecting,
            stream,
            session_url: url.clone(),
            url,
            cseq: 0,
            session_id: None,
            user_agent,
            range,
            mode: TransportMode::TcpInterleaved,
            proto: PayloadProto::Rtp,
            demux: InterleavedBuf::new(),
            tracker: SeqTracker::new(),
            redirects: 0,
            txbuf: Vec::new(),
            tx_off: 0,
            // The connect itself runs against the control timeout.
            awaiting_since: Some(Instant::now()),
            udp_rtp: None,
            udp_rtcp: None,
            connected: false,
            started: false,
        })
    }

    pub fn state(&self) -> RtspState {
        self.state
    }

    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    pub fn udp_rtp_mut(&mut self) -> Option<&mut mio::net::UdpSocket> {
        self.udp_rtp.as_mut()
    }

    pub fn udp_rtcp_mut(&mut self) -> Option<&mut mio::net::UdpSocket> {
        self.udp_rtcp.as_mut()
    }

    /// Status-table projection.
    pub fn client_state(&self) -> ClientState {
        match self.state {
            RtspState::Connecting => ClientState::RtspConnecting,
            RtspState::Describing => ClientState::RtspDescribing,
            RtspState::SettingUp | RtspState::Starting => ClientState::RtspSettingUp,
            RtspState::Playing => ClientState::RtspPlaying,
            RtspState::Paused => ClientState::RtspPaused,
            RtspState::TearingDown | RtspState::Terminated => ClientState::RtspTeardown,
        }
    }

    /// Writable edge: finish the connect, then flush queued control
    /// bytes.
    pub fn on_writable(&mut self) -> Result<Vec<RtspAction>> {
        let actions = Vec::new();
        if !self.connected {
            // A connect error surfaces through take_error on the first
            // writable edge.
            if let Some(e) = self.stream.take_error()? {
                return Err(Error::Io(e));
            }
            if self.stream.peer_addr().is_err() {
                return Ok(actions); // still in progress
            }
            self.connected = true;
            log::debug!("[rtsp] connected, describing {}", self.url);
            self.state = RtspState::Describing;
            let req = self
                .request("DESCRIBE", &self.url.clone())
                .header("Accept", "application/sdp");
            self.enqueue(req);
        }
        self.flush_tx()?;
        Ok(actions)
    }

    /// Readable edge on the control socket.
    pub fn on_readable(
        &mut self,
        outq: &mut OutputQueue,
    ) -> Result<(u64, Vec<RtspAction>)> {
        let mut enqueued = 0u64;
        let mut actions = Vec::new();
        let mut chunk = [0u8; 8 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if self.state == RtspState::TearingDown {
                        self.state = RtspState::Terminated;
                        actions.push(RtspAction::Finished);
                        return Ok((enqueued, actions));
                    }
                    return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
                }
                Ok(n) => self.demux.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        while let Some(unit) = self.demux.next()? {
            match unit {
                Demuxed::Media { channel, payload } => {
                    enqueued += self.forward_media(channel, &payload, outq);
                }
                Demuxed::Control(response) => {
                    self.handle_response(response, &mut actions)?;
                }
            }
        }
        self.flush_tx()?;
        Ok((enqueued, actions))
    }

    /// Readable edge on the UDP fallback media socket.
    pub fn on_udp_readable(
        &mut self,
        pool: &PacketPool,
        outq: &mut OutputQueue,
    ) -> Result<u64> {
        let mut enqueued = 0u64;
        loop {
            let Some(socket) = self.udp_rtp.as_ref() else {
                break;
            };
            let mut buf = match pool.acquire() {
                Some(b) => b,
                None => {
                    let mut scratch = [0u8; crate::config::PKT_BUF_SIZE];
                    match socket.recv_from(&mut scratch) {
                        Ok(_) => continue,
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
            match self.proto {
                PayloadProto::Mp2t => {
                    let len = buf.len();
                    if outq.push_packet(buf, 0, len) {
                        enqueued += len as u64;
                    }
                }
                PayloadProto::Rtp => {
                    if rtp::is_rtcp(buf.bytes()) {
                        continue;
                    }
                    if let Ok((hdr, range)) = rtp::parse(buf.bytes()) {
                        if self.tracker.accept(hdr.seq) == SeqVerdict::Accept {
                            let len = range.len();
                            if outq.push_packet(buf, range.start, len) {
                                enqueued += len as u64;
                            }
                        }
                    }
                }
            }
        }
        // RTCP: consume and drop.
        if let Some(socket) = self.udp_rtcp.as_ref() {
            let mut scratch = [0u8; 1536];
            while socket.recv_from(&mut scratch).is_ok() {}
        }
        Ok(enqueued)
    }

    /// Timer duty: control-response timeout.
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        if let Some(since) = self.awaiting_since {
            if now.duration_since(since) > RTSP_RESPONSE_TIMEOUT {
                if self.state == RtspState::TearingDown {
                    // TEARDOWN is best-effort; stop waiting.
                    self.state = RtspState::Terminated;
                    return Ok(());
                }
                return Err(Error::Timeout("rtsp control response"));
            }
        }
        Ok(())
    }

    /// Back-pressure edge from the output queue: PAUSE above the high
    /// watermark, PLAY again below the low one.
    pub fn set_paused(&mut self, paused: bool) -> Result<()> {
        match (self.state, paused) {
            (RtspState::Playing, true) => {
                self.state = RtspState::Paused;
                let req = self.request("PAUSE", &self.session_url.clone());
                self.enqueue(req);
                self.flush_tx()
            }
            (RtspState::Paused, false) => {
                self.state = RtspState::Starting;
                let req = self.request("PLAY", &self.session_url.clone());
                self.enqueue(req);
                self.flush_tx()
            }
            _ => Ok(()),
        }
    }

    /// Best-effort TEARDOWN; the response is not awaited beyond the
    /// normal control timeout.
    pub fn teardown(&mut self) {
        if matches!(
            self.state,
            RtspState::Connecting | RtspState::TearingDown | RtspState::Terminated
        ) || self.session_id.is_none()
        {
            self.state = RtspState::Terminated;
            return;
        }
        self.state = RtspState::TearingDown;
        let req = self.request("TEARDOWN", &self.session_url.clone());
        self.enqueue(req);
        let _ = self.flush_tx();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn request(&mut self, method: &'static str, url: &str) -> RtspRequest {
        self.cseq += 1;
        let mut req = RtspRequest::new(method, url, self.cseq);
        if let Some(ua) = &self.user_agent {
            req = req.header("User-Agent", ua);
        }
        if let Some(session) = &self.session_id {
            req = req.header("Session", session);
        }
        self.awaiting_since = Some(Instant::now());
        req
    }

    fn enqueue(&mut self, req: RtspRequest) {
        log::debug!("[rtsp] -> {} {}", req.method(), self.url);
        self.txbuf.extend_from_slice(&req.encode());
    }

    fn flush_tx(&mut self) -> Result<()> {
        while self.tx_off < self.txbuf.len() {
            match self.stream.write(&self.txbuf[self.tx_off..]) {
                Ok(n) => self.tx_off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.txbuf.clear();
        self.tx_off = 0;
        Ok(())
    }

    fn forward_media(&mut self, channel: u8, payload: &[u8], outq: &mut OutputQueue) -> u64 {
        if channel != CHANNEL_RTP || payload.is_empty() {
            return 0; // RTCP and unknown channels are consumed silently
        }
        match self.proto {
            PayloadProto::Mp2t => {
                let len = payload.len();
                outq.push_bytes(payload.to_vec());
                len as u64
            }
            PayloadProto::Rtp => match rtp::parse(payload) {
                Ok((hdr, range)) => {
                    if self.tracker.accept(hdr.seq) == SeqVerdict::Accept {
                        outq.push_bytes(payload[range.clone()].to_vec());
                        range.len() as u64
                    } else {
                        0
                    }
                }
                Err(_) => 0,
            },
        }
    }

    fn handle_response(
        &mut self,
        response: message::RtspResponse,
        actions: &mut Vec<RtspAction>,
    ) -> Result<()> {
        self.awaiting_since = None;
        log::debug!(
            "[rtsp] <- {} in {:?} (cseq {:?})",
            response.status,
            self.state,
            response.cseq()
        );

        // Redirects rewind to Connecting against the new URL.
        if (300..400).contains(&response.status) {
            return self.follow_redirect(&response, actions);
        }

        match self.state {
            RtspState::Describing => {
                if response.status != 200 {
                    return Err(Error::RtspStatus(response.status));
                }
                let body = String::from_utf8_lossy(&response.body);
                let info = sdp::parse(&body).ok_or(Error::MediaFormatUnsupported)?;
                self.proto = info.proto;
                self.url = sdp::resolve_control(&self.session_url, info.control.as_deref());
                self.state = RtspState::SettingUp;
                let transport = format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{}",
                    CHANNEL_RTP, CHANNEL_RTCP
                );
                let req = self
                    .request("SETUP", &self.url.clone())
                    .header("Transport", &transport);
                self.enqueue(req);
            }
            RtspState::SettingUp => match response.status {
                200 => {
                    self.session_id = response.session_id();
                    self.state = RtspState::Starting;
                    let url = self.session_url.clone();
                    let range = self.range.clone();
                    let mut req = self.request("PLAY", &url);
                    if let Some(range) = range {
                        req = req.header("Range", &range);
                    }
                    self.enqueue(req);
                }
                461 if self.mode == TransportMode::TcpInterleaved => {
                    // Server refused interleaving; negotiate UDP ports.
                    self.mode = TransportMode::Udp;
                    let (rtp_sock, rtcp_sock, rtp_port) = bind_udp_pair()?;
                    self.udp_rtp = Some(rtp_sock);
                    self.udp_rtcp = Some(rtcp_sock);
                    actions.push(RtspAction::RegisterUdp);
                    let transport = format!(
                        "RTP/AVP;unicast;client_port={}-{}",
                        rtp_port,
                        rtp_port + 1
                    );
                    let req = self
                        .request("SETUP", &self.url.clone())
                        .header("Transport", &transport);
                    self.enqueue(req);
                }
                status => return Err(Error::RtspStatus(status)),
            },
            RtspState::Starting => {
                if response.status != 200 {
                    return Err(Error::RtspStatus(response.status));
                }
                self.state = RtspState::Playing;
                if !self.started {
                    self.started = true;
                    actions.push(RtspAction::StreamingStarted);
                }
                log::info!("[rtsp] playing {}", self.session_url);
            }
            RtspState::Paused => {
                // PAUSE acknowledged; nothing to do.
                if response.status != 200 {
                    return Err(Error::RtspStatus(response.status));
                }
            }
            RtspState::TearingDown => {
                self.state = RtspState::Terminated;
                actions.push(RtspAction::Finished);
            }
            state => {
                log::debug!("[rtsp] unexpected response {} in {:?}", response.status, state);
            }
        }
        Ok(())
    }

    fn follow_redirect(
        &mut self,
        response: &message::RtspResponse,
        actions: &mut Vec<RtspAction>,
    ) -> Result<()> {
        self.redirects += 1;
        if self.redirects > RTSP_MAX_REDIRECTS {
            return Err(Error::RedirectLoop);
        }
        let location = response
            .header("Location")
            .ok_or_else(|| Error::BadRequest("redirect without Location".into()))?
            .to_string();
        let (host, port) = parse_rtsp_url(&location)?;
        log::info!("[rtsp] redirect {} -> {}", self.session_url, location);

        self.session_url = location.clone();
        self.url = location;
        self.session_id = None;
        self.demux = InterleavedBuf::new();
        self.txbuf.clear();
        self.tx_off = 0;
        self.connected = false;
        self.awaiting_since = Some(Instant::now());
        self.state = RtspState::Connecting;
        self.stream = connect(&host, port)?;
        actions.push(RtspAction::Reconnect);
        Ok(())
    }
}

/// Nonblocking connect to the first resolved address.
fn connect(host: &str, port: u16) -> Result<mio::net::TcpStream> {
    let addr = resolve(host, port)?;
    let stream = mio::net::TcpStream::connect(addr)?;
    Ok(stream)
}

/// Blocking DNS resolution (control plane, once per session).
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let host_trimmed = host.trim_start_matches('[').trim_end_matches(']');
    (host_trimmed, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| Error::Resolve(host.to_string()))
}

/// `rtsp://host[:port]/...` → (host, port).
fn parse_rtsp_url(url: &str) -> Result<(String, u16)> {
    let rest = url
        .strip_prefix("rtsp://")
        .ok_or_else(|| Error::BadUrl(format!("not an rtsp url: {}", url)))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::BadUrl(format!("bad port in {}", url)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), 554)),
    }
}

/// Even/odd UDP port pair for the RTP/RTCP fallback.
fn bind_udp_pair() -> Result<(mio::net::UdpSocket, mio::net::UdpSocket, u16)> {
    for _ in 0..16 {
        let probe = std::net::UdpSocket::bind("0.0.0.0:0").map_err(Error::Io)?;
        let port = probe.local_addr()?.port() & !1; // round down to even
        drop(probe);
        let rtp = match std::net::UdpSocket::bind(("0.0.0.0", port)) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let rtcp = match std::net::UdpSocket::bind(("0.0.0.0", port + 1)) {
            Ok(s) => s,
            Err(_) => continue,
        };
        rtp.set_nonblocking(true).map_err(Error::Io)?;
        rtcp.set_nonblocking(true).map_err(Error::Io)?;
        return Ok((
            mio::net::UdpSocket::from_std(rtp),
            mio::net::UdpSocket::from_std(rtcp),
            port,
        ));
    }
    Err(Error::BindFailed("no free udp port pair".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK};
    use crate::core::rtp::RtpHeader;
    use crate::http::QueryMap;
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::time::Duration;

    fn target(addr: SocketAddr) -> RtspTarget {
        RtspTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            path: "/ch01".to_string(),
            query: QueryMap::default(),
        }
    }

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![b'$', channel];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Fake RTSP server: accepts one connection, answers from a script.
    struct FakeServer {
        stream: std::net::TcpStream,
    }

    impl FakeServer {
        fn accept(listener: &TcpListener) -> FakeServer {
            let (stream, _) = listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_millis(500)))
                .expect("timeout");
            FakeServer { stream }
        }

        fn read_request(&mut self) -> String {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = self.stream.read(&mut chunk).expect("request bytes");
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            String::from_utf8(buf).expect("ascii request")
        }

        fn send(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).expect("send");
        }
    }

    fn pump(
        session: &mut RtspSession,
        outq: &mut OutputQueue,
    ) -> (u64, Vec<RtspAction>) {
        std::thread::sleep(Duration::from_millis(30));
        let mut actions = session.on_writable().expect("writable");
        let (bytes, mut more) = session.on_readable(outq).expect("readable");
        actions.append(&mut more);
        (bytes, actions)
    }

    #[test]
    fn describe_setup_play_with_range() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let seek = SeekSpec {
            name: "playseek".into(),
            value: "20250101100000-20250101110000".into(),
            offset_secs: 0,
        };
        let mut session = RtspSession::start(
            &target(listener.local_addr().expect("addr")),
            Some(&seek),
            Some("vlc/3.0".into()),
            8 * 3600,
        )
        .expect("session start");
        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);
        let mut server = FakeServer::accept(&listener);

        // DESCRIBE
        std::thread::sleep(Duration::from_millis(30));
        session.on_writable().expect("connect finishes");
        session.on_writable().expect("flush describe");
        let req = server.read_request();
        assert!(req.starts_with("DESCRIBE rtsp://"), "got: {}", req);
        assert!(req.contains("User-Agent: vlc/3.0\r\n"));
        let sdp = "m=video 0 RTP/AVP 33\r\na=control:track1\r\n";
        server.send(
            format!(
                "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
                sdp.len(),
                sdp
            )
            .as_bytes(),
        );

        // SETUP
        pump(&mut session, &mut outq);
        let req = server.read_request();
        assert!(req.starts_with("SETUP rtsp://"), "got: {}", req);
        assert!(req.contains("/ch01/track1 RTSP/1.0"));
        assert!(req.contains("Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n"));
        server.send(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: 4711;timeout=60\r\n\r\n");

        // PLAY with translated Range
        pump(&mut session, &mut outq);
        let req = server.read_request();
        assert!(req.starts_with("PLAY rtsp://"), "got: {}", req);
        assert!(req.contains("Session: 4711\r\n"));
        assert!(
            req.contains("Range: clock=20250101T020000Z-20250101T030000Z\r\n"),
            "got: {}",
            req
        );
        server.send(b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\r\n");
        let (_, actions) = pump(&mut session, &mut outq);
        assert!(actions.contains(&RtspAction::StreamingStarted));
        assert_eq!(session.state(), RtspState::Playing);

        // Interleaved media: RTP payload extracted, RTCP dropped,
        // duplicates dropped.
        let media = |seq: u16, p: &[u8]| {
            RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: 33,
                seq,
                timestamp: 0,
                ssrc: 1,
            }
            .synthesize(p)
        };
        server.send(&frame(0, &media(10, b"AB")));
        server.send(&frame(1, b"rtcp-junk"));
        server.send(&frame(0, &media(10, b"AB")));
        server.send(&frame(0, &media(11, b"CD")));
        let (bytes, _) = pump(&mut session, &mut outq);
        assert_eq!(bytes, 4);

        let mut sink = Vec::new();
        let mut written = 0u64;
        outq.drain_into(&mut sink, &mut written).expect("drain");
        assert_eq!(sink, b"ABCD");

        // Clean teardown.
        session.teardown();
        std::thread::sleep(Duration::from_millis(20));
        let req = server.read_request();
        assert!(req.starts_with("TEARDOWN rtsp://"), "got: {}", req);
    }

    #[test]
    fn redirect_rewinds_and_limits() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let second = TcpListener::bind("127.0.0.1:0").expect("listen2");
        let mut session = RtspSession::start(
            &target(listener.local_addr().expect("addr")),
            None,
            None,
            0,
        )
        .expect("session start");
        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);

        let mut server = FakeServer::accept(&listener);
        std::thread::sleep(Duration::from_millis(30));
        session.on_writable().expect("connect");
        session.on_writable().expect("flush");
        server.read_request();
        let loc = format!(
            "RTSP/1.0 302 Moved\r\nCSeq: 1\r\nLocation: rtsp://{}/moved\r\n\r\n",
            second.local_addr().expect("addr2")
        );
        server.send(loc.as_bytes());

        let (_, actions) = pump(&mut session, &mut outq);
        assert!(actions.contains(&RtspAction::Reconnect));
        assert_eq!(session.state(), RtspState::Connecting);

        // The session reconnects against the second server.
        let mut server2 = FakeServer::accept(&second);
        std::thread::sleep(Duration::from_millis(30));
        session.on_writable().expect("connect2");
        session.on_writable().expect("flush2");
        let req = server2.read_request();
        assert!(req.contains("/moved RTSP/1.0"), "got: {}", req);
    }

    #[test]
    fn udp_fallback_on_461() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let mut session = RtspSession::start(
            &target(listener.local_addr().expect("addr")),
            None,
            None,
            0,
        )
        .expect("session start");
        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);
        let mut server = FakeServer::accept(&listener);

        std::thread::sleep(Duration::from_millis(30));
        session.on_writable().expect("connect");
        session.on_writable().expect("flush");
        server.read_request();
        let sdp = "m=video 0 RTP/AVP 33\r\n";
        server.send(
            format!(
                "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}",
                sdp.len(),
                sdp
            )
            .as_bytes(),
        );
        pump(&mut session, &mut outq);
        server.read_request(); // interleaved SETUP
        server.send(b"RTSP/1.0 461 Unsupported Transport\r\nCSeq: 2\r\n\r\n");

        let (_, actions) = pump(&mut session, &mut outq);
        assert!(actions.contains(&RtspAction::RegisterUdp));
        let req = server.read_request();
        assert!(
            req.contains("Transport: RTP/AVP;unicast;client_port="),
            "got: {}",
            req
        );
        assert!(session.udp_rtp_mut().is_some());
        assert!(session.udp_rtcp_mut().is_some());
    }

    #[test]
    fn control_timeout_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let mut session = RtspSession::start(
            &target(listener.local_addr().expect("addr")),
            None,
            None,
            0,
        )
        .expect("session start");
        let _server = FakeServer::accept(&listener);
        std::thread::sleep(Duration::from_millis(30));
        session.on_writable().expect("connect");

        let later = Instant::now() + RTSP_RESPONSE_TIMEOUT + Duration::from_secs(1);
        assert!(session.on_tick(later).is_err());
    }

    #[test]
    fn url_parse_helpers() {
        assert_eq!(
            parse_rtsp_url("rtsp://10.0.0.1:8554/a/b").expect("parse"),
            ("10.0.0.1".to_string(), 8554)
        );
        assert_eq!(
            parse_rtsp_url("rtsp://vod.example.com/ch").expect("parse"),
            ("vod.example.com".to_string(), 554)
        );
        assert!(parse_rtsp_url("http://x/").is_err());
    }
}
