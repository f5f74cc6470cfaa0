// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded status dashboard.
//!
//! One static page that subscribes to `/status/sse` and renders the
//! snapshots. The full web UI ships separately; this page only keeps
//! `/status` useful on a bare install.

pub const STATUS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>castgate status</title>
<style>
body { font-family: monospace; margin: 2em; background: #111; color: #ddd; }
table { border-collapse: collapse; width: 100%; margin-bottom: 2em; }
th, td { border: 1px solid #444; padding: 4px 8px; text-align: left; }
th { background: #222; }
#log { white-space: pre-wrap; font-size: 0.9em; color: #9a9; }
</style>
</head>
<body>
<h1>castgate</h1>
<p id="summary">connecting…</p>
<table>
<thead><tr><th>slot</th><th>worker</th><th>peer</th><th>url</th><th>state</th><th>bytes</th><th>bandwidth</th></tr></thead>
<tbody id="clients"></tbody>
</table>
<div id="log"></div>
<script>
const fmtBw = b => b > 1048576 ? (b/1048576).toFixed(1)+" MB/s" : (b/1024).toFixed(1)+" kB/s";
const es = new EventSource("/status/sse");
es.onmessage = ev => {
  const s = JSON.parse(ev.data);
  document.getElementById("summary").textContent =
    s.total_clients + " / " + s.max_clients + " clients, " + s.worker_count + " workers";
  document.getElementById("clients").innerHTML = s.clients.map(c =>
    "<tr><td>" + c.slot + "</td><td>" + c.worker + "</td><td>" + c.peer +
    "</td><td>" + c.url + "</td><td>" + c.state + "</td><td>" + c.bytes_sent +
    "</td><td>" + fmtBw(c.bandwidth_bps) + "</td></tr>").join("");
  document.getElementById("log").textContent =
    s.log.map(l => new Date(l.ts_ms).toISOString() + "  " + l.message).join("\n");
};
es.onerror = () => { document.getElementById("summary").textContent = "disconnected"; };
</script>
</body>
</html>
"#;
