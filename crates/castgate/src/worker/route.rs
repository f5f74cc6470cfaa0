// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request routing.
//!
//! Dispatch order: bearer token and hostname filter, the fixed control
//! endpoints (`/status`, `/status/sse`, `/api/...`), the configured
//! service map, then udpxy-style dynamic paths when open routing is
//! enabled.

use super::conn::ConnState;
use super::{Target, UpKind, Worker};
use crate::error::{Error, Result};
use crate::http::{parser, query::QueryMap, response, sse, status_page};
use crate::ingress::fcc::FccSession;
use crate::ingress::relay::HttpRelay;
use crate::ingress::rtsp::RtspSession;
use crate::ingress::udp::{resolve_iface, UdpIngress};
use crate::ingress::StreamCtx;
use crate::service::{Service, ServiceKind};
use crate::status::ClientState;
use mio::Interest;
use std::net::SocketAddr;
use std::rc::Rc;

impl Worker {
    /// A complete request head arrived on `id`.
    pub(super) fn handle_request(&mut self, id: u64, req: parser::Request) -> Result<()> {
        let mut query = QueryMap::parse(req.query());

        // Bearer token, when configured, gates every route.
        let presented = query.remove("r2h-token");
        if let Some(expected) = &self.cfg.token {
            if presented.as_deref() != Some(expected.as_str()) {
                log::debug!("[worker] conn {} rejected: bad token", id);
                self.respond(id, response::error(response::Status::Forbidden));
                return Ok(());
            }
        }
        // Hostname filter on the Host header (port stripped).
        if let Some(expected) = &self.cfg.hostname {
            let host = req
                .host
                .as_deref()
                .map(|h| h.split(':').next().unwrap_or(h))
                .unwrap_or("");
            if !host.eq_ignore_ascii_case(expected) {
                log::debug!("[worker] conn {} rejected: host {:?}", id, req.host);
                self.respond(id, response::error(response::Status::Forbidden));
                return Ok(());
            }
        }

        let path = req.path().to_string();
        match path.as_str() {
            "/status" => {
                self.respond(
                    id,
                    response::simple(response::Status::Ok, "text/html", status_page::STATUS_HTML),
                );
                Ok(())
            }
            "/status/sse" => self.start_sse(id),
            "/api/disconnect" => {
                let ok = query
                    .get("key")
                    .and_then(|k| k.parse::<usize>().ok())
                    .map(|slot| self.plane.request_kill(slot))
                    .unwrap_or(false);
                let (status, body) = if ok {
                    (response::Status::Ok, "{\"ok\":true}")
                } else {
                    (response::Status::NotFound, "{\"ok\":false}")
                };
                self.respond(id, response::simple(status, "application/json", body));
                Ok(())
            }
            "/api/loglevel" => {
                match query.get("level").and_then(|l| l.parse::<u8>().ok()) {
                    Some(level) if level <= 4 => {
                        self.plane.set_log_level(level);
                        log::info!("[worker] log level set to {}", level);
                        self.respond(
                            id,
                            response::simple(response::Status::Ok, "application/json", "{\"ok\":true}"),
                        );
                    }
                    _ => {
                        self.respond(id, response::error(response::Status::BadRequest));
                    }
                }
                Ok(())
            }
            _ => self.route_stream(id, path, query, req),
        }
    }

    /// Stream routes: configured map first, then dynamic parse.
    fn route_stream(
        &mut self,
        id: u64,
        path: String,
        query: QueryMap,
        req: parser::Request,
    ) -> Result<()> {
        let resolved = if let Some(configured) = self.services.get(&path) {
            configured.apply_request_query(&query)
        } else if self.cfg.udpxy_routing {
            Service::parse_path(&path, &query)
        } else {
            Err(Error::NotFound)
        };

        match resolved {
            Ok(service) => self.start_stream(id, service, &req),
            Err(e) => {
                log::debug!("[worker] conn {} route failed: {}", id, e);
                let status = response::Status::from_code(e.http_status().unwrap_or(404));
                self.respond(id, response::error(status));
                Ok(())
            }
        }
    }

    /// Attach an SSE observer.
    fn start_sse(&mut self, id: u64) -> Result<()> {
        let peer = match self.conns.get(&id) {
            Some(conn) => conn.peer.to_string(),
            None => return Ok(()),
        };
        let Some(slot) = self.plane.claim(&peer, "/status/sse", ClientState::Sse) else {
            self.respond(id, response::error(response::Status::ServiceUnavailable));
            return Ok(());
        };
        let frame = sse::compose_event(&self.plane, self.cfg.max_clients, self.cfg.workers);
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.state = ConnState::SseActive;
            conn.slot = Some(slot);
            conn.headers_sent = true;
            conn.outq.push_bytes(response::sse_head());
            conn.outq.push_bytes(frame);
        }
        self.flush_client(id);
        log::debug!("[worker] conn {} attached to sse (slot {})", id, slot);
        Ok(())
    }

    /// Admission, slot claim, upstream setup, preamble.
    fn start_stream(&mut self, id: u64, service: Service, req: &parser::Request) -> Result<()> {
        if self.plane.total_clients() >= self.cfg.max_clients as u32 {
            log::info!("[worker] conn {} rejected: max_clients reached", id);
            self.respond(id, response::error(response::Status::ServiceUnavailable));
            return Ok(());
        }
        let peer = match self.conns.get(&id) {
            Some(conn) => conn.peer.to_string(),
            None => return Ok(()),
        };
        let initial_state = match service.kind {
            ServiceKind::Rtp if service.fcc.is_some() => ClientState::FccInit,
            ServiceKind::Rtp | ServiceKind::Udp => ClientState::Streaming,
            ServiceKind::Rtsp => ClientState::RtspConnecting,
            ServiceKind::HttpProxy => ClientState::Routing,
        };
        let Some(slot) =
            self.plane
                .claim(&peer, &service.display_url, initial_state)
        else {
            self.respond(id, response::error(response::Status::ServiceUnavailable));
            return Ok(());
        };
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.slot = Some(slot);
        }

        let outcome = self.build_ctx(id, &service, req);
        match outcome {
            Ok(()) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.state = ConnState::Streaming;
                    conn.service = Some(Rc::new(service));
                }
                self.push_status(id);
                Ok(())
            }
            Err(e) => {
                log::warn!("[worker] conn {} stream setup failed: {}", id, e);
                // The row was claimed above; release it with the close.
                let status = response::Status::from_code(e.http_status().unwrap_or(503));
                self.respond(id, response::error(status));
                Ok(())
            }
        }
    }

    /// Open the upstream and register its sockets.
    fn build_ctx(&mut self, id: u64, service: &Service, req: &parser::Request) -> Result<()> {
        match service.kind {
            ServiceKind::Rtp | ServiceKind::Udp => {
                let group = service
                    .group
                    .ok_or(Error::Internal("stream service without group"))?;
                if service.kind == ServiceKind::Rtp {
                    if let Some(server) = service.fcc {
                        match self.start_fcc(id, group, service, server) {
                            Ok(()) => {
                                self.send_stream_head(id);
                                return Ok(());
                            }
                            Err(e) => {
                                // Burst setup failed; degrade to the plain
                                // join rather than losing the channel.
                                log::warn!("[worker] conn {} fcc setup failed: {}", id, e);
                                if let Some(slot) = self.conns.get(&id).and_then(|c| c.slot) {
                                    self.plane.set_state(slot, ClientState::FccError);
                                }
                            }
                        }
                    }
                }
                let mut ingress = UdpIngress::open(
                    group,
                    service.source,
                    service.kind == ServiceKind::Udp,
                    self.cfg.upstream_if_multicast.as_deref(),
                    self.cfg.mcast_rejoin_interval,
                )?;
                let token = self.alloc_token();
                self.poll
                    .registry()
                    .register(ingress.socket_mut(), token, Interest::READABLE)?;
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.ctx = Some(StreamCtx::Udp(ingress));
                    conn.up_primary = Some(token);
                }
                self.targets.insert(token, Target::Upstream(id, UpKind::Primary));
                if service.fcc.is_some() {
                    if let Some(slot) = self.conns.get(&id).and_then(|c| c.slot) {
                        self.plane.set_state(slot, ClientState::FccMcastActive);
                    }
                }
                self.send_stream_head(id);
                Ok(())
            }
            ServiceKind::Rtsp => {
                let target = service
                    .rtsp
                    .as_ref()
                    .ok_or(Error::Internal("rtsp service without target"))?;
                let mut session = RtspSession::start(
                    target,
                    service.seek.as_ref(),
                    req.user_agent.clone(),
                    self.cfg.timezone_offset_secs,
                )?;
                let token = self.alloc_token();
                self.poll.registry().register(
                    session.stream_mut(),
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.ctx = Some(StreamCtx::Rtsp(session));
                    conn.up_primary = Some(token);
                }
                self.targets.insert(token, Target::Upstream(id, UpKind::Primary));
                Ok(())
            }
            ServiceKind::HttpProxy => {
                let target = service
                    .http
                    .as_ref()
                    .ok_or(Error::Internal("http service without target"))?;
                let mut relay = HttpRelay::start(target)?;
                let token = self.alloc_token();
                self.poll.registry().register(
                    relay.stream_mut(),
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.ctx = Some(StreamCtx::Relay(relay));
                    conn.up_primary = Some(token);
                }
                self.targets.insert(token, Target::Upstream(id, UpKind::Primary));
                Ok(())
            }
        }
    }

    /// Open the FCC burst session and register its unicast socket.
    fn start_fcc(
        &mut self,
        id: u64,
        group: SocketAddr,
        service: &Service,
        server: SocketAddr,
    ) -> Result<()> {
        let SocketAddr::V4(group) = group else {
            return Err(Error::BadUrl("fcc requires an ipv4 group".into()));
        };
        let iface = resolve_iface(self.cfg.upstream_if_multicast.as_deref());
        let mut session = FccSession::start(
            group,
            service.source,
            server,
            service.flavor,
            self.cfg.fcc_nat,
            self.cfg.fcc_port_range,
            iface,
        )?;
        let token = self.alloc_token();
        let socket = session
            .unicast_socket_mut()
            .ok_or(Error::Internal("fcc session without unicast socket"))?;
        self.poll
            .registry()
            .register(socket, token, Interest::READABLE)?;
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.ctx = Some(StreamCtx::Fcc(session));
            conn.up_primary = Some(token);
        }
        self.targets.insert(token, Target::Upstream(id, UpKind::Primary));
        if let Some(slot) = self.conns.get(&id).and_then(|c| c.slot) {
            self.plane.set_state(slot, ClientState::FccRequested);
        }
        Ok(())
    }
}
