// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal SDP inspection.
//!
//! The gateway only needs two facts from a DESCRIBE body: which control
//! URL to SETUP, and whether any media section carries a payload we can
//! forward (an RTP/AVP profile or an MP2T track). Everything else in the
//! SDP is ignored.

/// Payload framing of the upstream media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadProto {
    /// RTP framing; strip headers with the normal extractor.
    Rtp,
    /// Raw MPEG-TS; forward interleaved payloads verbatim.
    Mp2t,
}

/// What DESCRIBE told us.
#[derive(Debug, Clone)]
pub struct SdpInfo {
    /// `a=control:` value, absolute or relative; `None` when absent or
    /// `*` (reuse the request URL).
    pub control: Option<String>,
    /// Framing of the first recognized media section.
    pub proto: PayloadProto,
}

/// Scan the SDP body. Returns `None` when no media section carries a
/// recognizable payload (the session then fails with
/// `MediaFormatUnsupported`).
pub fn parse(body: &str) -> Option<SdpInfo> {
    let mut session_control: Option<String> = None;
    let mut media_control: Option<String> = None;
    let mut proto: Option<PayloadProto> = None;
    let mut in_recognized_media = false;
    let mut seen_any_media = false;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(m) = line.strip_prefix("m=") {
            seen_any_media = true;
            let recognized = media_proto(m);
            // First recognized section wins; later ones are ignored.
            if proto.is_none() {
                proto = recognized;
                in_recognized_media = recognized.is_some();
            } else {
                in_recognized_media = false;
            }
        } else if let Some(value) = line.strip_prefix("a=control:") {
            let value = value.trim();
            if value.is_empty() || value == "*" {
                continue;
            }
            if !seen_any_media {
                session_control = Some(value.to_string());
            } else if in_recognized_media && media_control.is_none() {
                media_control = Some(value.to_string());
            }
        }
    }

    proto.map(|proto| SdpInfo {
        control: media_control.or(session_control),
        proto,
    })
}

/// `m=<type> <port> <proto> <fmt...>` — recognize the transport profile.
fn media_proto(media_line: &str) -> Option<PayloadProto> {
    let mut fields = media_line.split_whitespace();
    let _media_type = fields.next()?;
    let _port = fields.next()?;
    let profile = fields.next()?;
    if profile.contains("MP2T") {
        Some(PayloadProto::Mp2t)
    } else if profile.contains("RTP/AVP") {
        Some(PayloadProto::Rtp)
    } else {
        None
    }
}

/// Resolve a control value against the session URL. Relative values
/// append to the path, never to the query string.
pub fn resolve_control(base_url: &str, control: Option<&str>) -> String {
    match control {
        None => base_url.to_string(),
        Some(c) if c.starts_with("rtsp://") => c.to_string(),
        Some(relative) => {
            let base = match base_url.split_once('?') {
                Some((path, _)) => path,
                None => base_url,
            };
            let mut url = base.trim_end_matches('/').to_string();
            url.push('/');
            url.push_str(relative);
            url
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_rtp_avp_with_track_control() {
        let body = "v=0\r\no=- 0 0 IN IP4 10.0.0.1\r\ns=ch\r\na=control:*\r\nm=video 0 RTP/AVP 33\r\na=control:track1\r\n";
        let info = parse(body).expect("supported media");
        assert_eq!(info.proto, PayloadProto::Rtp);
        assert_eq!(info.control.as_deref(), Some("track1"));
    }

    #[test]
    fn mp2t_track_recognized() {
        let body = "v=0\nm=video 0 TCP/MP2T 33\n";
        let info = parse(body).expect("supported media");
        assert_eq!(info.proto, PayloadProto::Mp2t);
        assert!(info.control.is_none());
    }

    #[test]
    fn session_level_control_used_when_media_has_none() {
        let body = "v=0\r\na=control:rtsp://10.0.0.1/ch01\r\nm=video 0 RTP/AVP 33\r\n";
        let info = parse(body).expect("supported media");
        assert_eq!(info.control.as_deref(), Some("rtsp://10.0.0.1/ch01"));
    }

    #[test]
    fn unknown_sections_skipped() {
        let body = "v=0\r\nm=application 0 UDP wb\r\na=control:ignored\r\nm=video 0 RTP/AVP 96\r\na=control:video\r\n";
        let info = parse(body).expect("supported media");
        assert_eq!(info.control.as_deref(), Some("video"));
    }

    #[test]
    fn no_supported_media_is_none() {
        assert!(parse("v=0\r\ns=x\r\n").is_none());
        assert!(parse("v=0\r\nm=audio 0 VAT 0\r\n").is_none());
    }

    #[test]
    fn control_resolution() {
        let base = "rtsp://10.0.0.1:554/ch01";
        assert_eq!(resolve_control(base, None), base);
        assert_eq!(
            resolve_control(base, Some("track1")),
            "rtsp://10.0.0.1:554/ch01/track1"
        );
        assert_eq!(
            resolve_control(base, Some("rtsp://10.0.0.2/other")),
            "rtsp://10.0.0.2/other"
        );
        // Relative controls attach to the path, not the query.
        assert_eq!(
            resolve_control("rtsp://10.0.0.1/ch01?bw=8m", Some("track1")),
            "rtsp://10.0.0.1/ch01/track1"
        );
    }
}
