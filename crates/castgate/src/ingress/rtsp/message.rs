// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTSP request building and response parsing.
//!
//! RTSP/1.0 control messages are CRLF-delimited like HTTP; responses may
//! carry a `Content-Length` body (SDP). The response parser works on an
//! accumulating buffer and reports how many bytes it consumed so media
//! frames interleaved behind a response stay untouched.

use crate::error::{Error, Result};

/// Outgoing request.
#[derive(Debug)]
pub struct RtspRequest {
    method: &'static str,
    url: String,
    cseq: u32,
    headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn new(method: &'static str, url: &str, cseq: u32) -> Self {
        Self {
            method,
            url: url.to_string(),
            cseq,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Wire bytes, `CSeq` first per convention.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", self.method, self.url, self.cseq);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Parsed response.
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// `Session` value with any `;timeout=` suffix stripped.
    pub fn session_id(&self) -> Option<String> {
        self.header("Session").map(|v| {
            match v.split_once(';') {
                Some((id, _)) => id.trim().to_string(),
                None => v.trim().to_string(),
            }
        })
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Try to parse one complete response off the front of `buf`.
///
/// `Ok(None)` while the head or body is still incomplete; otherwise the
/// response and the consumed byte count.
pub fn parse_response(buf: &[u8]) -> Result<Option<(RtspResponse, usize)>> {
    let head_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(i) => i,
        None => return Ok(None),
    };
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::BadRequest("non-ascii rtsp response".into()))?;
    let mut lines = head.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| Error::BadRequest("empty rtsp response".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("RTSP/1.") {
        return Err(Error::BadRequest(format!(
            "bad rtsp status line: {}",
            status_line
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::BadRequest(format!("bad rtsp status: {}", status_line)))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::BadRequest(format!("bad rtsp header: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut response = RtspResponse {
        status,
        headers,
        body: Vec::new(),
    };
    let body_len = response.content_length();
    let total = head_end + 4 + body_len;
    if buf.len() < total {
        return Ok(None);
    }
    response.body = buf[head_end + 4..total].to_vec();
    Ok(Some((response, total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encoding() {
        let req = RtspRequest::new("DESCRIBE", "rtsp://10.0.0.1:554/ch01", 2)
            .header("User-Agent", "vlc/3.0")
            .header("Accept", "application/sdp");
        let text = String::from_utf8(req.encode()).expect("ascii");
        assert_eq!(
            text,
            "DESCRIBE rtsp://10.0.0.1:554/ch01 RTSP/1.0\r\nCSeq: 2\r\nUser-Agent: vlc/3.0\r\nAccept: application/sdp\r\n\r\n"
        );
    }

    #[test]
    fn response_without_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 12345678;timeout=60\r\n\r\n";
        let (resp, consumed) = parse_response(raw).expect("parse").expect("complete");
        assert_eq!(consumed, raw.len());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.cseq(), Some(3));
        assert_eq!(resp.session_id().as_deref(), Some("12345678"));
        assert!(resp.body.is_empty());
    }

    #[test]
    fn response_with_sdp_body() {
        let body = "v=0\r\na=control:track1\r\n";
        let raw = format!(
            "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n{}extra",
            body.len(),
            body
        );
        let (resp, consumed) = parse_response(raw.as_bytes())
            .expect("parse")
            .expect("complete");
        assert_eq!(resp.body, body.as_bytes());
        assert_eq!(&raw.as_bytes()[consumed..], b"extra");
    }

    #[test]
    fn incomplete_stays_pending() {
        assert!(parse_response(b"RTSP/1.0 200 OK\r\nCSeq").expect("parse").is_none());
        let raw = b"RTSP/1.0 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(parse_response(raw).expect("parse").is_none());
    }

    #[test]
    fn garbage_rejected() {
        assert!(parse_response(b"HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(parse_response(b"RTSP/1.0 abc\r\n\r\n").is_err());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let raw = b"RTSP/1.0 302 Moved\r\nLOCATION: rtsp://other/ch\r\n\r\n";
        let (resp, _) = parse_response(raw).expect("parse").expect("complete");
        assert_eq!(resp.header("Location"), Some("rtsp://other/ch"));
    }
}
