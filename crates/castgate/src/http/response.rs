// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP response framing.
//!
//! Everything the gateway sends is HTTP/1.1 with `Connection: close`;
//! streams have no length, short control answers carry Content-Length.

/// Advertised in the `Server` header.
pub const SERVER_TOKEN: &str = concat!("castgate/", env!("CARGO_PKG_VERSION"));

/// Status lines the gateway emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    BadGateway,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::BadGateway => 502,
            Status::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::BadGateway => "Bad Gateway",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }

    pub fn from_code(code: u16) -> Status {
        match code {
            200 => Status::Ok,
            400 => Status::BadRequest,
            403 => Status::Forbidden,
            404 => Status::NotFound,
            502 => Status::BadGateway,
            _ => Status::ServiceUnavailable,
        }
    }
}

/// Headers that open an unbounded media stream.
pub fn stream_head(content_type: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        SERVER_TOKEN, content_type
    )
    .into_bytes()
}

/// Headers that open an SSE stream.
pub fn sse_head() -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        SERVER_TOKEN
    )
    .into_bytes()
}

/// A short, fully-framed answer (control endpoints and errors).
pub fn simple(status: Status, content_type: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nServer: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.code(),
        status.reason(),
        SERVER_TOKEN,
        content_type,
        body.len(),
        body
    )
    .into_bytes()
}

/// Plain-text error answer.
pub fn error(status: Status) -> Vec<u8> {
    simple(status, "text/plain", status.reason())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_head_shape() {
        let head = stream_head("video/mp2t");
        let text = String::from_utf8(head).expect("ascii head");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: video/mp2t\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn simple_carries_length() {
        let resp = simple(Status::NotFound, "text/plain", "nope");
        let text = String::from_utf8(resp).expect("ascii response");
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }

    #[test]
    fn code_round_trip() {
        for s in [
            Status::Ok,
            Status::BadRequest,
            Status::Forbidden,
            Status::NotFound,
            Status::BadGateway,
            Status::ServiceUnavailable,
        ] {
            assert_eq!(Status::from_code(s.code()), s);
        }
    }
}
