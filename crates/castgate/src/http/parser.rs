// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental HTTP request parsing.
//!
//! Accumulates bytes until the blank line terminating the headers, then
//! parses the request line and the handful of headers the gateway cares
//! about. Size caps are enforced while the request is still incomplete
//! so an attacker cannot grow the input buffer unboundedly.

use crate::config::{MAX_HEADER_BYTES, MAX_URL_BYTES};
use crate::error::Error;

/// Methods the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            _ => None,
        }
    }
}

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target (path + optional query).
    pub target: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub connection: Option<String>,
}

impl Request {
    /// Target path without the query string.
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(i) => &self.target[..i],
            None => &self.target,
        }
    }

    /// Raw query string, empty when absent.
    pub fn query(&self) -> &str {
        match self.target.find('?') {
            Some(i) => &self.target[i + 1..],
            None => "",
        }
    }
}

/// Try to parse a complete request head out of `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, or the request plus
/// the number of consumed bytes once the head is complete.
pub fn try_parse(buf: &[u8]) -> Result<Option<(Request, usize)>, Error> {
    let head_end = match find_head_end(buf) {
        Some(n) => n,
        None => {
            // Incomplete: the caps still apply to what already arrived.
            if buf.len() > MAX_URL_BYTES + MAX_HEADER_BYTES + 32 {
                return Err(Error::BadRequest("request head too large".into()));
            }
            return Ok(None);
        }
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::BadRequest("non-ascii request head".into()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| Error::BadRequest("empty request".into()))?;
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .and_then(Method::parse)
        .ok_or_else(|| Error::BadRequest("unsupported method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| Error::BadRequest("missing request target".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::BadRequest("missing http version".into()))?;
    if parts.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(Error::BadRequest("malformed request line".into()));
    }
    if target.len() > MAX_URL_BYTES {
        return Err(Error::BadRequest("url too long".into()));
    }
    if !target.starts_with('/') {
        return Err(Error::BadRequest("target must be origin-form".into()));
    }

    let headers_len = head_end - request_line.len();
    if headers_len > MAX_HEADER_BYTES {
        return Err(Error::BadRequest("headers too large".into()));
    }

    let mut req = Request {
        method,
        target: target.to_string(),
        host: None,
        user_agent: None,
        connection: None,
    };

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::BadRequest("malformed header line".into()))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            req.host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("user-agent") {
            req.user_agent = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("connection") {
            req.connection = Some(value.to_string());
        }
        // Unrecognized headers are skipped; the size cap already bounded
        // them.
    }

    Ok(Some((req, head_end + 4)))
}

/// Offset of the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_get() {
        let raw = b"GET /rtp/239.1.1.1:5000 HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, consumed) = try_parse(raw).expect("parse").expect("complete");
        assert_eq!(consumed, raw.len());
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path(), "/rtp/239.1.1.1:5000");
        assert_eq!(req.query(), "");
        assert_eq!(req.host.as_deref(), Some("x"));
    }

    #[test]
    fn query_split_and_headers() {
        let raw = b"GET /ch1?playseek=123-456 HTTP/1.1\r\nUser-Agent: vlc/3.0\r\nConnection: close\r\n\r\ntrailing";
        let (req, consumed) = try_parse(raw).expect("parse").expect("complete");
        assert_eq!(req.path(), "/ch1");
        assert_eq!(req.query(), "playseek=123-456");
        assert_eq!(req.user_agent.as_deref(), Some("vlc/3.0"));
        assert_eq!(req.connection.as_deref(), Some("close"));
        assert_eq!(&raw[consumed..], b"trailing");
    }

    #[test]
    fn incremental_returns_none() {
        assert!(try_parse(b"GET / HTT").expect("parse").is_none());
        assert!(try_parse(b"GET / HTTP/1.1\r\nHost: x\r\n")
            .expect("parse")
            .is_none());
    }

    #[test]
    fn post_accepted_other_methods_rejected() {
        let post = b"POST /api/disconnect?key=3 HTTP/1.1\r\n\r\n";
        let (req, _) = try_parse(post).expect("parse").expect("complete");
        assert_eq!(req.method, Method::Post);

        let delete = b"DELETE / HTTP/1.1\r\n\r\n";
        assert!(try_parse(delete).is_err());
    }

    #[test]
    fn url_cap_enforced() {
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(MAX_URL_BYTES + 1));
        assert!(try_parse(long.as_bytes()).is_err());
    }

    #[test]
    fn header_cap_enforced() {
        let raw = format!(
            "GET / HTTP/1.1\r\nX-Pad: {}\r\n\r\n",
            "b".repeat(MAX_HEADER_BYTES + 1)
        );
        assert!(try_parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn oversized_incomplete_head_rejected() {
        let raw = vec![b'a'; MAX_URL_BYTES + MAX_HEADER_BYTES + 64];
        assert!(try_parse(&raw).is_err());
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(try_parse(b"GET /\r\n\r\n").is_err());
        assert!(try_parse(b"GET / SPDY/3\r\n\r\n").is_err());
        assert!(try_parse(b"GET / HTTP/1.1\r\nbadheader\r\n\r\n").is_err());
        assert!(try_parse(b"GET example.com HTTP/1.1\r\n\r\n").is_err());
    }
}
