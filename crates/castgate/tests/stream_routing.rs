// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end request-to-descriptor routing: HTTP head parsing, the
//! udpxy-style URL grammar, configured-service override merge and the
//! time-shift translation chain.

use castgate::http::{parser, QueryMap};
use castgate::ingress::rtsp::seek;
use castgate::service::{Origin, Service, ServiceKind};

#[test]
fn rtp_request_to_descriptor() {
    let raw = b"GET /rtp/239.1.1.1:5000 HTTP/1.1\r\nHost: x\r\n\r\n";
    let (req, _) = parser::try_parse(raw).expect("parse").expect("complete");
    let query = QueryMap::parse(req.query());
    let svc = Service::parse_path(req.path(), &query).expect("descriptor");

    assert_eq!(svc.kind, ServiceKind::Rtp);
    assert_eq!(svc.group, Some("239.1.1.1:5000".parse().expect("addr")));
    assert_eq!(svc.origin, Origin::DynamicFromUrl);
    assert!(svc.fcc.is_none());
}

#[test]
fn fcc_request_with_flavor_and_fec() {
    let raw =
        b"GET /rtp/239.1.1.1:5000?fcc=10.0.0.9:8028&fcc-type=telecom&fec=9000 HTTP/1.1\r\n\r\n";
    let (req, _) = parser::try_parse(raw).expect("parse").expect("complete");
    let query = QueryMap::parse(req.query());
    let svc = Service::parse_path(req.path(), &query).expect("descriptor");

    assert_eq!(svc.fcc, Some("10.0.0.9:8028".parse().expect("addr")));
    assert_eq!(svc.fec_port, Some(9000));
}

#[test]
fn configured_rtsp_with_playseek_override_translates_to_clock_range() {
    // The channel is configured with a dummy playseek; the request
    // carries the real one plus an extra parameter.
    let configured =
        Service::parse_url("rtsp://10.0.0.1:554/ch01?playseek=0&bw=8m").expect("config url");

    let raw =
        b"GET /ch01?playseek=20250101100000-20250101110000 HTTP/1.1\r\nUser-Agent: tvbox\r\n\r\n";
    let (req, _) = parser::try_parse(raw).expect("parse").expect("complete");
    let query = QueryMap::parse(req.query());
    let effective = configured.apply_request_query(&query).expect("merge");

    // Override merge replaced playseek in place, kept bw, and the seek
    // spec was extracted out of the forwarded query.
    let target = effective.rtsp.as_ref().expect("rtsp target");
    assert_eq!(target.url(), "rtsp://10.0.0.1:554/ch01?bw=8m");
    let spec = effective.seek.expect("seek spec");
    assert_eq!(spec.value, "20250101100000-20250101110000");

    // And the PLAY Range for a +08:00 deployment.
    let range = seek::translate(&spec.value, 8 * 3600, spec.offset_secs).expect("translate");
    assert_eq!(range, "clock=20250101T020000Z-20250101T030000Z");
}

#[test]
fn dynamic_rtsp_seek_offset() {
    let raw = b"GET /rtsp/10.0.0.1/ch?playseek=1735696800-&r2h-seek-offset=-60 HTTP/1.1\r\n\r\n";
    let (req, _) = parser::try_parse(raw).expect("parse").expect("complete");
    let query = QueryMap::parse(req.query());
    let svc = Service::parse_path(req.path(), &query).expect("descriptor");

    let spec = svc.seek.expect("seek spec");
    assert_eq!(spec.offset_secs, -60);
    let range = seek::translate(&spec.value, 0, spec.offset_secs).expect("translate");
    assert_eq!(range, "clock=20250101T015900Z-");
}

#[test]
fn http_relay_and_udp_paths() {
    let (req, _) = parser::try_parse(b"GET /http/cdn.example.com/live.ts HTTP/1.1\r\n\r\n")
        .expect("parse")
        .expect("complete");
    let svc = Service::parse_path(req.path(), &QueryMap::parse(req.query())).expect("descriptor");
    assert_eq!(svc.kind, ServiceKind::HttpProxy);
    let target = svc.http.expect("http target");
    assert_eq!((target.host.as_str(), target.port), ("cdn.example.com", 80));

    let (req, _) = parser::try_parse(b"GET /udp/239.0.0.7:1234 HTTP/1.1\r\n\r\n")
        .expect("parse")
        .expect("complete");
    let svc = Service::parse_path(req.path(), &QueryMap::parse(req.query())).expect("descriptor");
    assert_eq!(svc.kind, ServiceKind::Udp);
}

#[test]
fn unknown_path_is_not_found() {
    let (req, _) = parser::try_parse(b"GET /favicon.ico HTTP/1.1\r\n\r\n")
        .expect("parse")
        .expect("complete");
    assert!(Service::parse_path(req.path(), &QueryMap::default()).is_err());
    let _ = req;
}
