// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection state.
//!
//! One accepted TCP client, its input buffer, its output queue and the
//! optional upstream stream context. A connection belongs to exactly
//! one worker and appears in exactly one fd map for its whole life.

use crate::config::{HEADER_TIMEOUT, OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK};
use crate::core::OutputQueue;
use crate::ingress::StreamCtx;
use crate::service::Service;
use mio::Token;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the request line.
    ReadReqLine,
    /// Request line seen, headers incomplete.
    ReadHeaders,
    /// Request complete, being dispatched.
    Route,
    /// Media flowing.
    Streaming,
    /// Attached to the notification pipe.
    SseActive,
    /// Flushing remaining output before close.
    Closing,
}

/// One accepted client.
pub struct Connection {
    pub stream: mio::net::TcpStream,
    pub peer: SocketAddr,
    /// Poll token of the client socket.
    pub token: Token,
    pub state: ConnState,
    pub inbuf: Vec<u8>,
    pub outq: OutputQueue,
    /// Inline services are borrowed (`Rc` into the worker map); dynamic
    /// ones are owned by this single `Rc`.
    pub service: Option<Rc<Service>>,
    pub ctx: Option<StreamCtx>,
    /// Status-table slot, claimed while the row exists.
    pub slot: Option<usize>,
    /// 200 + content-type already queued towards the client.
    pub headers_sent: bool,
    pub header_deadline: Instant,
    pub close_deadline: Option<Instant>,
    /// Upstream poll tokens: control/unicast, multicast/media, RTCP.
    pub up_primary: Option<Token>,
    pub up_mcast: Option<Token>,
    pub up_rtcp: Option<Token>,
    /// RTSP back-pressure pause in effect.
    pub paused: bool,
}

impl Connection {
    pub fn new(stream: mio::net::TcpStream, peer: SocketAddr, token: Token) -> Self {
        Self {
            stream,
            peer,
            token,
            state: ConnState::ReadReqLine,
            inbuf: Vec::with_capacity(512),
            outq: OutputQueue::new(OUTQ_HIGH_WATERMARK, OUTQ_LOW_WATERMARK),
            service: None,
            ctx: None,
            slot: None,
            headers_sent: false,
            header_deadline: Instant::now() + HEADER_TIMEOUT,
            close_deadline: None,
            up_primary: None,
            up_mcast: None,
            up_rtcp: None,
            paused: false,
        }
    }

    /// All upstream tokens currently registered.
    pub fn upstream_tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.up_primary
            .into_iter()
            .chain(self.up_mcast)
            .chain(self.up_rtcp)
    }
}
