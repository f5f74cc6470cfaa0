// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SSE snapshot composition.
//!
//! Observers get the full picture on every notification edge: client
//! rows, the newest log lines and the global counters, as one
//! `data: <json>\n\n` block. Wake bytes are coalesced upstream, so one
//! burst of changes costs one snapshot.

use crate::status::{LogLine, SlotSnapshot, StatusPlane};
use serde::Serialize;

/// Log lines included per snapshot.
const SNAPSHOT_LOG_LINES: usize = 50;

#[derive(Debug, Serialize)]
struct Snapshot<'a> {
    total_clients: u32,
    max_clients: usize,
    worker_count: usize,
    clients: &'a [SlotSnapshot],
    log: &'a [LogLine],
}

/// Compose the current snapshot as an SSE event frame.
pub fn compose_event(plane: &StatusPlane, max_clients: usize, worker_count: usize) -> Vec<u8> {
    let clients = plane.snapshot();
    let log = plane.log_tail(SNAPSHOT_LOG_LINES);
    let snapshot = Snapshot {
        total_clients: plane.total_clients(),
        max_clients,
        worker_count,
        clients: &clients,
        log: &log,
    };
    let json = match serde_json::to_string(&snapshot) {
        Ok(j) => j,
        // Snapshot structs serialize infallibly in practice; degrade to
        // an empty object rather than killing the observer.
        Err(_) => "{}".to_string(),
    };
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(json.as_bytes());
    frame.extend_from_slice(b"\n\n");
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{notify, ClientState, StatusRegion};

    fn plane() -> StatusPlane {
        let region = StatusRegion::create(2).expect("mmap region");
        let (_rx, tx) = notify::create(1).expect("pipes");
        StatusPlane::new(region, tx, 0)
    }

    #[test]
    fn frame_shape_and_counters() {
        let plane = plane();
        plane
            .claim("10.1.1.1:4242", "/ch1", ClientState::Streaming)
            .expect("free slot");
        plane.append_log(2, "stream started");

        let frame = compose_event(&plane, 64, 2);
        let text = String::from_utf8(frame).expect("utf8 frame");
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));

        let json: serde_json::Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim()).expect("valid json");
        assert_eq!(json["total_clients"], 1);
        assert_eq!(json["max_clients"], 64);
        assert_eq!(json["clients"][0]["url"], "/ch1");
        assert_eq!(json["clients"][0]["state"], "streaming");
        assert_eq!(json["log"][0]["message"], "stream started");
    }

    #[test]
    fn total_clients_tracks_claims() {
        let plane = plane();
        let parse = |frame: Vec<u8>| -> serde_json::Value {
            let text = String::from_utf8(frame).expect("utf8");
            serde_json::from_str(text.trim_start_matches("data: ").trim()).expect("json")
        };
        let before = parse(compose_event(&plane, 8, 1));
        let slot = plane
            .claim("p", "/u", ClientState::Sse)
            .expect("free slot");
        let after = parse(compose_event(&plane, 8, 1));
        assert_eq!(
            after["total_clients"].as_u64().expect("count"),
            before["total_clients"].as_u64().expect("count") + 1
        );
        plane.release(slot);
    }
}
