// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service descriptors.
//!
//! A service is the normalized form of one upstream channel: the
//! multicast group (plus optional SSM source, FCC server and FEC port),
//! an RTSP target, or an HTTP upstream. Inline services are parsed from
//! the configuration at startup and live for the process lifetime,
//! indexed by URL path; dynamic services are parsed per request from
//! udpxy-style paths and owned by exactly one connection.

use crate::error::{Error, Result};
use crate::http::QueryMap;
use crate::ingress::fcc::flavor::Flavor;
use std::net::{IpAddr, SocketAddr};

/// Upstream transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// RTP over UDP multicast (framing stripped).
    Rtp,
    /// Plain UDP multicast (datagrams forwarded verbatim).
    Udp,
    /// RTSP catch-up / time-shift upstream.
    Rtsp,
    /// HTTP upstream pass-through.
    HttpProxy,
}

/// Where the descriptor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    InlineConfig,
    ExternalM3u,
    DynamicFromUrl,
}

/// RTSP upstream coordinates.
#[derive(Debug, Clone)]
pub struct RtspTarget {
    pub host: String,
    pub port: u16,
    /// Path with leading `/`; empty path is normalized to `/`.
    pub path: String,
    /// Query forwarded upstream (after override merge and after the
    /// gateway-internal parameters were stripped).
    pub query: QueryMap,
}

impl RtspTarget {
    /// Full `rtsp://` control URL.
    pub fn url(&self) -> String {
        let q = self.query.encode();
        if q.is_empty() {
            format!("rtsp://{}:{}{}", self.host, self.port, self.path)
        } else {
            format!("rtsp://{}:{}{}?{}", self.host, self.port, self.path, q)
        }
    }
}

/// HTTP upstream coordinates.
#[derive(Debug, Clone)]
pub struct HttpTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// A time-shift request: which parameter carried it, the raw value and
/// the signed offset applied to both range ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekSpec {
    pub name: String,
    pub value: String,
    pub offset_secs: i64,
}

/// Normalized upstream channel.
#[derive(Debug, Clone)]
pub struct Service {
    pub kind: ServiceKind,
    /// Multicast group for Rtp/Udp kinds.
    pub group: Option<SocketAddr>,
    /// Source-specific multicast sender filter.
    pub source: Option<IpAddr>,
    /// FCC burst server.
    pub fcc: Option<SocketAddr>,
    /// FCC wire flavor (meaningful only with `fcc`).
    pub flavor: Flavor,
    /// FEC port carried for URL fidelity; the core does not consume it.
    pub fec_port: Option<u16>,
    pub rtsp: Option<RtspTarget>,
    pub http: Option<HttpTarget>,
    pub seek: Option<SeekSpec>,
    pub origin: Origin,
    /// What the status table shows for this channel.
    pub display_url: String,
}

impl Service {
    fn empty(kind: ServiceKind, origin: Origin, display_url: String) -> Self {
        Self {
            kind,
            group: None,
            source: None,
            fcc: None,
            flavor: Flavor::Telecom,
            fec_port: None,
            rtsp: None,
            http: None,
            seek: None,
            origin,
            display_url,
        }
    }

    /// Parse a udpxy-style request path (`/rtp/...`, `/udp/...`,
    /// `/rtsp/...`, `/http/...`) plus its query into a dynamic service.
    pub fn parse_path(path: &str, query: &QueryMap) -> Result<Service> {
        let display_url = if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query.encode())
        };
        if let Some(rest) = path.strip_prefix("/rtp/") {
            let mut svc = Service::empty(ServiceKind::Rtp, Origin::DynamicFromUrl, display_url);
            let (group, source) = parse_group(rest)?;
            svc.group = Some(group);
            svc.source = source;
            let mut q = query.clone();
            apply_stream_params(&mut svc, &mut q)?;
            Ok(svc)
        } else if let Some(rest) = path.strip_prefix("/udp/") {
            let mut svc = Service::empty(ServiceKind::Udp, Origin::DynamicFromUrl, display_url);
            let (group, source) = parse_group(rest)?;
            svc.group = Some(group);
            svc.source = source;
            Ok(svc)
        } else if let Some(rest) = path.strip_prefix("/rtsp/") {
            let mut svc = Service::empty(ServiceKind::Rtsp, Origin::DynamicFromUrl, display_url);
            let mut q = query.clone();
            let seek = extract_seek(&mut q)?;
            let (host, port, tail) = parse_authority(rest, 554)?;
            svc.rtsp = Some(RtspTarget {
                host,
                port,
                path: tail,
                query: q,
            });
            svc.seek = seek;
            Ok(svc)
        } else if let Some(rest) = path.strip_prefix("/http/") {
            let mut svc =
                Service::empty(ServiceKind::HttpProxy, Origin::DynamicFromUrl, display_url);
            let (host, port, tail) = parse_authority(rest, 80)?;
            svc.http = Some(HttpTarget {
                host,
                port,
                path: tail,
            });
            Ok(svc)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Parse a configured upstream URL (`rtp://`, `udp://`, `rtsp://`,
    /// `http://`).
    pub fn parse_url(url: &str) -> Result<Service> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::BadUrl(format!("missing scheme: {}", url)))?;
        let (body, query) = match rest.split_once('?') {
            Some((b, q)) => (b, QueryMap::parse(q)),
            None => (rest, QueryMap::default()),
        };
        let path = match scheme {
            "rtp" => format!("/rtp/{}", body),
            "udp" => format!("/udp/{}", body),
            "rtsp" => format!("/rtsp/{}", body),
            "http" => format!("/http/{}", body),
            other => return Err(Error::BadUrl(format!("unknown scheme: {}", other))),
        };
        let mut svc = Service::parse_path(&path, &query)?;
        svc.origin = Origin::InlineConfig;
        svc.display_url = url.to_string();
        Ok(svc)
    }

    /// Produce the per-request effective service for a configured one:
    /// the request query is override-merged into the configured query,
    /// then FCC and seek parameters are re-extracted from the result.
    pub fn apply_request_query(&self, request: &QueryMap) -> Result<Service> {
        if request.is_empty() {
            return Ok(self.clone());
        }
        let mut svc = self.clone();
        match svc.kind {
            ServiceKind::Rtp => {
                // Configured stream params were consumed at parse time;
                // the request can still override or add them.
                let mut q = request.clone();
                apply_stream_params(&mut svc, &mut q)?;
            }
            ServiceKind::Rtsp => {
                let target = svc.rtsp.as_mut().ok_or(Error::Internal("rtsp service without target"))?;
                let mut merged = target.query.merge_override(request);
                if let Some(seek) = extract_seek(&mut merged)? {
                    svc.seek = Some(seek);
                }
                target.query = merged;
            }
            ServiceKind::Udp | ServiceKind::HttpProxy => {}
        }
        Ok(svc)
    }
}

/// Parse `<ip>:<port>[@<source>]`.
fn parse_group(spec: &str) -> Result<(SocketAddr, Option<IpAddr>)> {
    let (addr_part, source_part) = match spec.split_once('@') {
        Some((a, s)) => (a, Some(s)),
        None => (spec, None),
    };
    let group: SocketAddr = addr_part
        .parse()
        .map_err(|_| Error::BadUrl(format!("bad group address: {}", addr_part)))?;
    if !group.ip().is_multicast() {
        return Err(Error::BadUrl(format!("not a multicast group: {}", group)));
    }
    let source = match source_part {
        Some(s) => Some(
            s.parse::<IpAddr>()
                .map_err(|_| Error::BadUrl(format!("bad source address: {}", s)))?,
        ),
        None => None,
    };
    Ok((group, source))
}

/// Parse `<host>[:<port>]/<path...>`; the path may be empty.
fn parse_authority(spec: &str, default_port: u16) -> Result<(String, u16, String)> {
    let (authority, tail) = match spec.find('/') {
        Some(i) => (&spec[..i], spec[i..].to_string()),
        None => (spec, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(Error::BadUrl("empty host".into()));
    }
    // Bracketed IPv6 authority.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::BadUrl(format!("bad ipv6 authority: {}", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::BadUrl(format!("bad port: {}", p)))?,
            None => default_port,
        };
        return Ok((format!("[{}]", host), port, tail));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::BadUrl(format!("bad port: {}", port)))?;
            Ok((host.to_string(), port, tail))
        }
        None => Ok((authority.to_string(), default_port, tail)),
    }
}

/// Pull FCC / FEC parameters out of the query into the descriptor.
fn apply_stream_params(svc: &mut Service, q: &mut QueryMap) -> Result<()> {
    if let Some(spec) = q.remove("fcc") {
        let server: SocketAddr = spec
            .parse()
            .map_err(|_| Error::BadUrl(format!("bad fcc server: {}", spec)))?;
        svc.flavor = Flavor::infer(server);
        svc.fcc = Some(server);
    }
    if let Some(kind) = q.remove("fcc-type") {
        svc.flavor =
            Flavor::from_param(&kind).ok_or_else(|| Error::BadUrl(format!("bad fcc-type: {}", kind)))?;
    }
    if let Some(port) = q.remove("fec") {
        svc.fec_port = Some(
            port.parse()
                .map_err(|_| Error::BadUrl(format!("bad fec port: {}", port)))?,
        );
    }
    Ok(())
}

/// Pull the time-shift parameter out of the query, if any.
///
/// Priority: explicit `r2h-seek-name` (naming the parameter that holds
/// the value), then `playseek`, then `tvdr`. The carrying parameter is
/// consumed; its value is emitted later as an RTSP `Range` header, not
/// forwarded in the upstream URL.
fn extract_seek(q: &mut QueryMap) -> Result<Option<SeekSpec>> {
    let offset_secs = match q.remove("r2h-seek-offset") {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| Error::BadUrl(format!("bad seek offset: {}", raw)))?,
        None => 0,
    };
    if let Some(name) = q.remove("r2h-seek-name") {
        let value = q
            .remove(&name)
            .ok_or_else(|| Error::BadUrl(format!("seek parameter {} not present", name)))?;
        return Ok(Some(SeekSpec {
            name,
            value,
            offset_secs,
        }));
    }
    for name in ["playseek", "tvdr"] {
        if let Some(value) = q.remove(name) {
            return Ok(Some(SeekSpec {
                name: name.to_string(),
                value,
                offset_secs,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_path_with_ssm_and_fcc() {
        let q = QueryMap::parse("fcc=10.0.0.9:8027&fcc-type=huawei&fec=9000");
        let svc =
            Service::parse_path("/rtp/239.1.1.1:5000@192.168.1.10", &q).expect("valid path");
        assert_eq!(svc.kind, ServiceKind::Rtp);
        assert_eq!(
            svc.group,
            Some("239.1.1.1:5000".parse().expect("group addr"))
        );
        assert_eq!(
            svc.source,
            Some("192.168.1.10".parse::<IpAddr>().expect("source addr"))
        );
        assert_eq!(svc.fcc, Some("10.0.0.9:8027".parse().expect("fcc addr")));
        assert_eq!(svc.flavor, Flavor::Huawei);
        assert_eq!(svc.fec_port, Some(9000));
        assert_eq!(svc.origin, Origin::DynamicFromUrl);
    }

    #[test]
    fn flavor_inferred_from_port_when_unspecified() {
        let q = QueryMap::parse("fcc=10.0.0.9:8027");
        let svc = Service::parse_path("/rtp/239.1.1.1:5000", &q).expect("valid path");
        assert_eq!(svc.flavor, Flavor::Huawei); // odd port
        let q = QueryMap::parse("fcc=10.0.0.9:8028");
        let svc = Service::parse_path("/rtp/239.1.1.1:5000", &q).expect("valid path");
        assert_eq!(svc.flavor, Flavor::Telecom); // even port
    }

    #[test]
    fn udp_path_plain() {
        let svc =
            Service::parse_path("/udp/239.255.0.7:1234", &QueryMap::default()).expect("valid");
        assert_eq!(svc.kind, ServiceKind::Udp);
        assert!(svc.fcc.is_none());
    }

    #[test]
    fn non_multicast_group_rejected() {
        let err = Service::parse_path("/rtp/10.1.1.1:5000", &QueryMap::default());
        assert!(err.is_err());
    }

    #[test]
    fn rtsp_path_with_playseek() {
        let q = QueryMap::parse("playseek=20250101100000-20250101110000&bitrate=8000");
        let svc = Service::parse_path("/rtsp/10.0.0.1:554/ch01", &q).expect("valid path");
        assert_eq!(svc.kind, ServiceKind::Rtsp);
        let target = svc.rtsp.as_ref().expect("rtsp target");
        assert_eq!(target.host, "10.0.0.1");
        assert_eq!(target.port, 554);
        assert_eq!(target.path, "/ch01");
        // playseek consumed, bitrate forwarded.
        assert_eq!(target.url(), "rtsp://10.0.0.1:554/ch01?bitrate=8000");
        let seek = svc.seek.expect("seek spec");
        assert_eq!(seek.name, "playseek");
        assert_eq!(seek.value, "20250101100000-20250101110000");
        assert_eq!(seek.offset_secs, 0);
    }

    #[test]
    fn rtsp_default_port_and_root_path() {
        let svc = Service::parse_path("/rtsp/vod.example.com", &QueryMap::default())
            .expect("valid path");
        let target = svc.rtsp.expect("rtsp target");
        assert_eq!(target.port, 554);
        assert_eq!(target.path, "/");
    }

    #[test]
    fn explicit_seek_name_and_offset() {
        let q = QueryMap::parse("r2h-seek-name=starttime&r2h-seek-offset=-300&starttime=1735700000");
        let svc = Service::parse_path("/rtsp/10.0.0.1/ch", &q).expect("valid path");
        let seek = svc.seek.expect("seek spec");
        assert_eq!(seek.name, "starttime");
        assert_eq!(seek.value, "1735700000");
        assert_eq!(seek.offset_secs, -300);
        // Carrier parameter was consumed from the upstream query.
        assert!(svc.rtsp.expect("target").query.get("starttime").is_none());
    }

    #[test]
    fn http_proxy_path() {
        let svc = Service::parse_path("/http/cdn.example.com:8080/live/ch1.ts", &QueryMap::default())
            .expect("valid path");
        let target = svc.http.expect("http target");
        assert_eq!(target.host, "cdn.example.com");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/live/ch1.ts");
    }

    #[test]
    fn config_url_round_trip() {
        let svc = Service::parse_url("rtp://239.1.1.1:5000?fcc=10.0.0.2:8028").expect("valid url");
        assert_eq!(svc.kind, ServiceKind::Rtp);
        assert_eq!(svc.origin, Origin::InlineConfig);
        assert!(svc.fcc.is_some());
        assert_eq!(svc.display_url, "rtp://239.1.1.1:5000?fcc=10.0.0.2:8028");

        assert!(Service::parse_url("ftp://x/y").is_err());
        assert!(Service::parse_url("no-scheme").is_err());
    }

    #[test]
    fn request_query_overrides_configured_rtsp() {
        let svc = Service::parse_url("rtsp://10.0.0.1:554/ch01?playseek=0&bitrate=4000")
            .expect("valid url");
        // Configured playseek=0 stays in the query until a request merges.
        let req = QueryMap::parse("playseek=20250101100000-");
        let eff = svc.apply_request_query(&req).expect("merge");
        let seek = eff.seek.expect("seek spec");
        assert_eq!(seek.value, "20250101100000-");
        assert_eq!(
            eff.rtsp.expect("target").url(),
            "rtsp://10.0.0.1:554/ch01?bitrate=4000"
        );
    }

    #[test]
    fn request_query_adds_fcc_to_configured_rtp() {
        let svc = Service::parse_url("rtp://239.1.1.1:5000").expect("valid url");
        let req = QueryMap::parse("fcc=10.9.9.9:8028");
        let eff = svc.apply_request_query(&req).expect("merge");
        assert_eq!(eff.fcc, Some("10.9.9.9:8028".parse().expect("addr")));
    }

    #[test]
    fn ipv6_group_accepted() {
        let svc =
            Service::parse_path("/udp/[ff3e::8000:1]:5000", &QueryMap::default()).expect("valid");
        assert!(svc.group.expect("group").ip().is_multicast());
    }
}
