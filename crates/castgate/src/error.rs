// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Errors returned by castgate operations.
//!
//! The taxonomy mirrors how failures propagate: parse errors answer the
//! HTTP request with a 4xx before any media flows, resource errors answer
//! 503, and everything that happens after the 200 response headers went
//! out only closes the TCP connection and records the reason in the
//! status table.

use std::io;

/// Process-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the streaming data plane.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Parse errors (per-request: 400, per-packet: drop + count)
    // ========================================================================
    /// Malformed HTTP request (request line, headers, or size caps).
    BadRequest(String),
    /// Request target could not be parsed into a service descriptor.
    BadUrl(String),
    /// Malformed upstream packet (RTP header, interleaved frame, ...).
    MalformedPacket(&'static str),

    // ========================================================================
    // Resource errors
    // ========================================================================
    /// Packet pool free list is empty; the packet is dropped.
    OutOfBuffers,
    /// No free slot in the shared status table.
    TableFull,
    /// `total_clients` reached `max_clients`; request answered 503.
    Capacity,

    // ========================================================================
    // Access errors
    // ========================================================================
    /// Bearer token or hostname filter rejected the request (403).
    Forbidden,
    /// No configured service matches and dynamic routing is off (404).
    NotFound,

    // ========================================================================
    // Network errors (session fatal, no retry within the request)
    // ========================================================================
    /// I/O error with underlying cause.
    Io(io::Error),
    /// Failed to bind a socket.
    BindFailed(String),
    /// Failed to join a multicast group.
    MulticastJoinFailed(String),
    /// Host name resolution failed.
    Resolve(String),

    // ========================================================================
    // Protocol errors (session fatal after attempted fallback)
    // ========================================================================
    /// RTSP server answered with an error status.
    RtspStatus(u16),
    /// HTTP upstream answered with a non-200 status.
    UpstreamStatus(u16),
    /// More than the allowed number of RTSP redirect hops.
    RedirectLoop,
    /// SDP carried no media section with a recognized RTP or MP2T track.
    MediaFormatUnsupported,
    /// FCC server rejected or misbehaved.
    FccRejected(&'static str),

    // ========================================================================
    // Timeouts (session fatal)
    // ========================================================================
    /// Idle read beyond the per-phase threshold; the label names the phase.
    Timeout(&'static str),

    // ========================================================================
    // Internal (process fatal; the supervisor respawns the worker)
    // ========================================================================
    /// Invariant violation (fd map desync, state transition gap).
    Internal(&'static str),
}

impl Error {
    /// HTTP status to answer with when the error is hit before the 200
    /// response headers were sent. `None` means the connection is simply
    /// closed (error surfaced mid-stream).
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::BadRequest(_) | Error::BadUrl(_) => Some(400),
            Error::Forbidden => Some(403),
            Error::NotFound => Some(404),
            Error::Capacity | Error::TableFull => Some(503),
            Error::Resolve(_) => Some(502),
            _ => None,
        }
    }

    /// True for invariant violations that must take the worker down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::BadRequest(msg) => write!(f, "bad request: {}", msg),
            Error::BadUrl(msg) => write!(f, "bad url: {}", msg),
            Error::MalformedPacket(what) => write!(f, "malformed packet: {}", what),
            Error::OutOfBuffers => write!(f, "packet pool exhausted"),
            Error::TableFull => write!(f, "status table full"),
            Error::Capacity => write!(f, "max_clients reached"),
            Error::Forbidden => write!(f, "forbidden"),
            Error::NotFound => write!(f, "no such service"),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::MulticastJoinFailed(msg) => write!(f, "multicast join failed: {}", msg),
            Error::Resolve(host) => write!(f, "cannot resolve: {}", host),
            Error::RtspStatus(code) => write!(f, "rtsp error status {}", code),
            Error::UpstreamStatus(code) => write!(f, "upstream http status {}", code),
            Error::RedirectLoop => write!(f, "rtsp redirect limit exceeded"),
            Error::MediaFormatUnsupported => write!(f, "no supported media track"),
            Error::FccRejected(why) => write!(f, "fcc server rejected: {}", why),
            Error::Timeout(phase) => write!(f, "timeout in {}", phase),
            Error::Internal(what) => write!(f, "internal invariant violated: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(Error::BadRequest("x".into()).http_status(), Some(400));
        assert_eq!(Error::Forbidden.http_status(), Some(403));
        assert_eq!(Error::NotFound.http_status(), Some(404));
        assert_eq!(Error::Capacity.http_status(), Some(503));
        assert_eq!(Error::Timeout("fcc").http_status(), None);
        assert_eq!(Error::RtspStatus(454).http_status(), None);
    }

    #[test]
    fn only_internal_is_fatal() {
        assert!(Error::Internal("fd map desync").is_fatal());
        assert!(!Error::OutOfBuffers.is_fatal());
        assert!(!Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
    }
}
