// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interleaved TCP demux.
//!
//! RFC 2326 Section 10.12: media frames share the control connection,
//! framed as `$ <channel:u8> <length:u16-be> <payload>`. Control
//! responses are ordinary CRLF messages. The demuxer accumulates raw
//! TCP bytes and routes by the leading byte.

use super::message::{self, RtspResponse};
use crate::error::{Error, Result};

/// Initial accumulator capacity; frames up to 64 KiB can still grow it.
const BUF_CAPACITY: usize = 8 * 1024;

/// A control message mid-accumulation may never exceed this.
const MAX_CONTROL_BYTES: usize = 64 * 1024;

/// One demuxed unit.
#[derive(Debug)]
pub enum Demuxed {
    /// Interleaved media frame.
    Media { channel: u8, payload: Vec<u8> },
    /// Control response.
    Control(RtspResponse),
}

/// Persistent per-session accumulator.
pub struct InterleavedBuf {
    buf: Vec<u8>,
}

impl InterleavedBuf {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(BUF_CAPACITY),
        }
    }

    /// Append freshly read TCP bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pending unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete unit, or `None` when more bytes are needed.
    pub fn next(&mut self) -> Result<Option<Demuxed>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] == b'$' {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let channel = self.buf[1];
            let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
            if self.buf.len() < 4 + len {
                return Ok(None);
            }
            let payload = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            return Ok(Some(Demuxed::Media { channel, payload }));
        }
        match message::parse_response(&self.buf)? {
            Some((response, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(Demuxed::Control(response)))
            }
            None if self.buf.len() > MAX_CONTROL_BYTES => {
                Err(Error::BadRequest("oversized rtsp control message".into()))
            }
            None => Ok(None),
        }
    }
}

impl Default for InterleavedBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![b'$', channel];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn media_and_control_interleaved() {
        let mut demux = InterleavedBuf::new();
        demux.extend(&frame(0, b"RTPDATA"));
        demux.extend(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n");
        demux.extend(&frame(1, b"RTCP"));

        match demux.next().expect("demux").expect("unit") {
            Demuxed::Media { channel, payload } => {
                assert_eq!(channel, 0);
                assert_eq!(payload, b"RTPDATA");
            }
            other => panic!("expected media, got {:?}", other),
        }
        match demux.next().expect("demux").expect("unit") {
            Demuxed::Control(resp) => assert_eq!(resp.cseq(), Some(5)),
            other => panic!("expected control, got {:?}", other),
        }
        match demux.next().expect("demux").expect("unit") {
            Demuxed::Media { channel, .. } => assert_eq!(channel, 1),
            other => panic!("expected media, got {:?}", other),
        }
        assert!(demux.next().expect("demux").is_none());
    }

    #[test]
    fn partial_frame_waits() {
        let mut demux = InterleavedBuf::new();
        let full = frame(0, &[0xAB; 100]);
        demux.extend(&full[..50]);
        assert!(demux.next().expect("demux").is_none());
        demux.extend(&full[50..]);
        match demux.next().expect("demux").expect("unit") {
            Demuxed::Media { payload, .. } => assert_eq!(payload.len(), 100),
            other => panic!("expected media, got {:?}", other),
        }
    }

    #[test]
    fn partial_header_prefix_waits() {
        let mut demux = InterleavedBuf::new();
        demux.extend(b"$\x00");
        assert!(demux.next().expect("demux").is_none());
    }

    #[test]
    fn runaway_control_is_fatal() {
        let mut demux = InterleavedBuf::new();
        demux.extend(&vec![b'R'; MAX_CONTROL_BYTES + 1]);
        assert!(demux.next().is_err());
    }

    #[test]
    fn zero_length_frame() {
        let mut demux = InterleavedBuf::new();
        demux.extend(&frame(1, b""));
        match demux.next().expect("demux").expect("unit") {
            Demuxed::Media { channel, payload } => {
                assert_eq!(channel, 1);
                assert!(payload.is_empty());
            }
            other => panic!("expected media, got {:?}", other),
        }
    }
}
