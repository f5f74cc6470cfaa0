// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP upstream pass-through.
//!
//! One GET against the upstream, upstream response headers stripped,
//! body bytes forwarded verbatim. The gateway frames its own response
//! towards the client, so upstream headers never leak through.

use crate::core::OutputQueue;
use crate::error::{Error, Result};
use crate::service::HttpTarget;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Instant;

/// Upstream connect/response budget.
const RELAY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Connecting,
    AwaitingHead,
    Streaming,
}

/// One upstream HTTP fetch feeding one client.
pub struct HttpRelay {
    stream: mio::net::TcpStream,
    state: RelayState,
    request: Vec<u8>,
    request_off: usize,
    /// Accumulates the upstream head until `\r\n\r\n`.
    head: Vec<u8>,
    started_at: Instant,
    connected: bool,
}

impl HttpRelay {
    /// Resolve and start the nonblocking connect. The caller registers
    /// `stream_mut` for read+write readiness.
    pub fn start(target: &HttpTarget) -> Result<Self> {
        let addr = resolve(&target.host, target.port)?;
        let stream = mio::net::TcpStream::connect(addr)?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: close\r\n\r\n",
            target.path,
            target.host,
            crate::http::response::SERVER_TOKEN,
        )
        .into_bytes();
        log::info!("[relay] fetching http://{}:{}{}", target.host, target.port, target.path);
        Ok(Self {
            stream,
            state: RelayState::Connecting,
            request,
            request_off: 0,
            head: Vec::with_capacity(1024),
            started_at: Instant::now(),
            connected: false,
        })
    }

    pub fn stream_mut(&mut self) -> &mut mio::net::TcpStream {
        &mut self.stream
    }

    /// Writable edge: finish the connect, push the request out.
    pub fn on_writable(&mut self) -> Result<()> {
        if !self.connected {
            if let Some(e) = self.stream.take_error()? {
                return Err(Error::Io(e));
            }
            if self.stream.peer_addr().is_err() {
                return Ok(());
            }
            self.connected = true;
            self.state = RelayState::AwaitingHead;
        }
        while self.request_off < self.request.len() {
            match self.stream.write(&self.request[self.request_off..]) {
                Ok(n) => self.request_off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Readable edge. Returns forwarded body bytes plus a true flag on
    /// the edge where the upstream head completed with status 200 (the
    /// worker then sends the client preamble).
    pub fn on_readable(&mut self, outq: &mut OutputQueue) -> Result<(u64, bool)> {
        let mut forwarded = 0u64;
        let mut started = false;
        let mut chunk = [0u8; 8 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if self.state == RelayState::Streaming {
                        // Upstream finished; the client connection ends too.
                        return Err(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
                    }
                    return Err(Error::UpstreamStatus(0));
                }
                Ok(n) => {
                    let mut data = &chunk[..n];
                    if self.state == RelayState::AwaitingHead {
                        match self.consume_head(data)? {
                            Some(body_start) => {
                                started = true;
                                self.state = RelayState::Streaming;
                                data = &data[body_start..];
                            }
                            None => continue,
                        }
                    }
                    if self.state == RelayState::Streaming && !data.is_empty() {
                        forwarded += data.len() as u64;
                        outq.push_bytes(data.to_vec());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok((forwarded, started))
    }

    /// Timer duty: connect/head timeout.
    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        if self.state != RelayState::Streaming
            && now.duration_since(self.started_at) > RELAY_TIMEOUT
        {
            return Err(Error::Timeout("http upstream response"));
        }
        Ok(())
    }

    /// Accumulate head bytes out of `data`; on completion validate the
    /// status line and return the offset where the body starts within
    /// `data`.
    fn consume_head(&mut self, data: &[u8]) -> Result<Option<usize>> {
        let already = self.head.len();
        self.head.extend_from_slice(data);
        if self.head.len() > 16 * 1024 {
            return Err(Error::BadRequest("oversized upstream response head".into()));
        }
        let Some(end) = self.head.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok(None);
        };
        let head = String::from_utf8_lossy(&self.head[..end]);
        let status: u16 = head
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or(Error::UpstreamStatus(0))?;
        if status != 200 {
            return Err(Error::UpstreamStatus(status));
        }
        log::debug!("[relay] upstream answered 200, streaming body");
        // Body offset relative to the freshly passed slice.
        Ok(Some(end + 4 - already))
    }
}

/// Blocking DNS resolution (control plane, once per session).
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| Error::Resolve(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK};
    use std::io::Write as _;
    use std::net::TcpListener;
    use std::time::Duration;

    fn start_relay(addr: SocketAddr) -> HttpRelay {
        HttpRelay::start(&HttpTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            path: "/live/ch1.ts".to_string(),
        })
        .expect("relay start")
    }

    #[test]
    fn strips_upstream_head_and_forwards_body() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let mut relay = start_relay(listener.local_addr().expect("addr"));
        let (mut upstream, _) = listener.accept().expect("accept");
        upstream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .expect("timeout");

        std::thread::sleep(Duration::from_millis(30));
        relay.on_writable().expect("connect");
        relay.on_writable().expect("send request");

        let mut req = [0u8; 1024];
        let n = upstream.read(&mut req).expect("request");
        let req = String::from_utf8_lossy(&req[..n]);
        assert!(req.starts_with("GET /live/ch1.ts HTTP/1.1\r\n"), "got: {}", req);
        assert!(req.contains("Connection: close\r\n"));

        // Head split across the body boundary on purpose.
        upstream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: video/mp2t\r\n\r\nTSBODY")
            .expect("respond");

        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);
        std::thread::sleep(Duration::from_millis(30));
        let (bytes, started) = relay.on_readable(&mut outq).expect("read body");
        assert!(started);
        assert_eq!(bytes, 6);

        upstream.write_all(b"MORE").expect("more body");
        std::thread::sleep(Duration::from_millis(30));
        let (bytes, started) = relay.on_readable(&mut outq).expect("read more");
        assert!(!started);
        assert_eq!(bytes, 4);

        let mut sink = Vec::new();
        let mut written = 0u64;
        outq.drain_into(&mut sink, &mut written).expect("drain");
        assert_eq!(sink, b"TSBODYMORE");
    }

    #[test]
    fn upstream_error_status_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let mut relay = start_relay(listener.local_addr().expect("addr"));
        let (mut upstream, _) = listener.accept().expect("accept");

        std::thread::sleep(Duration::from_millis(30));
        relay.on_writable().expect("connect");
        upstream
            .write_all(b"HTTP/1.1 404 Not Found\r\n\r\n")
            .expect("respond");

        let mut outq = OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK);
        std::thread::sleep(Duration::from_millis(30));
        match relay.on_readable(&mut outq) {
            Err(Error::UpstreamStatus(404)) => {}
            other => panic!("expected UpstreamStatus(404), got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn head_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listen");
        let mut relay = start_relay(listener.local_addr().expect("addr"));
        let later = Instant::now() + RELAY_TIMEOUT + Duration::from_secs(1);
        assert!(relay.on_tick(later).is_err());
    }
}
