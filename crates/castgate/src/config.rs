// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway configuration - single source of truth.
//!
//! This module centralizes the tuning constants of the data plane and the
//! runtime [`Config`] assembled from CLI flags and an optional TOML file.
//! **Never hardcode these values elsewhere!**
//!
//! # Layers
//!
//! - **Level 1 (static)**: compile-time constants (buffer sizes, watermarks,
//!   timeouts, table capacities)
//! - **Level 2 (dynamic)**: [`Config`] merged from file + CLI, immutable
//!   after startup (the process re-reads it only on restart)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// =======================================================================
// Packet pool
// =======================================================================

/// Payload slot size in bytes. Large enough for any UDP datagram carried
/// over standard Ethernet (1500 MTU) plus RTP framing slack.
pub const PKT_BUF_SIZE: usize = 1536;

/// Default pool capacity per worker. Allocated once at worker start,
/// never grown or shrunk.
pub const DEFAULT_POOL_CAPACITY: usize = 16384;

// =======================================================================
// Output queue back-pressure
// =======================================================================

/// Above this many queued bytes the ingress stops enqueuing for the
/// connection (UDP flows drop, RTSP pauses reads).
pub const OUTQ_HIGH_WATERMARK: usize = 4 * 1024 * 1024;

/// Ingress resumes once the queue drains below this.
pub const OUTQ_LOW_WATERMARK: usize = 1024 * 1024;

// =======================================================================
// HTTP front limits
// =======================================================================

/// Maximum accepted request-target length.
pub const MAX_URL_BYTES: usize = 1024;

/// Maximum accepted total header bytes (after the request line).
pub const MAX_HEADER_BYTES: usize = 1024;

/// A client must complete its request headers within this window.
pub const HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period to flush queued output after a connection enters Closing.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// =======================================================================
// Upstream timeouts
// =======================================================================

/// FCC receive-idle timeout in Requested / UnicastPending.
pub const FCC_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// RTSP control-response timeout.
pub const RTSP_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the FCC multicast-transition pending list, in packets.
/// Reaching it forces the handover flush.
pub const FCC_PENDING_LIMIT: usize = 2048;

/// Maximum RTSP redirect hops before the session fails.
pub const RTSP_MAX_REDIRECTS: u8 = 5;

// =======================================================================
// RTP acceptance
// =======================================================================

/// Backward sequence distance beyond which a late packet is treated as a
/// stream reset instead of being dropped.
pub const RTP_RESET_WINDOW: u16 = 32768;

// =======================================================================
// Status plane
// =======================================================================

/// Client table capacity (also the upper bound on `max_clients`).
pub const STATUS_SLOTS: usize = 256;

/// Log ring capacity in entries.
pub const LOG_RING_ENTRIES: usize = 256;

/// Per-entry message capacity in bytes (longer messages are truncated).
pub const LOG_MSG_BYTES: usize = 220;

/// Minimum wall-clock delta between bandwidth samples.
pub const BANDWIDTH_SAMPLE_MIN: Duration = Duration::from_secs(1);

// =======================================================================
// Supervisor
// =======================================================================

/// Linear respawn backoff cap.
pub const RESPAWN_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Worker poll timeout upper bound.
pub const POLL_TICK: Duration = Duration::from_millis(100);

/// NAT traversal mode for the FCC unicast socket.
///
/// Both modes only change the downstream port advertised in the FCC
/// request; media reception is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FccNatMode {
    /// Advertise the local bind port as-is.
    #[default]
    None,
    /// Pre-send an empty datagram to the server to open the NAT pinhole.
    HolePunch,
    /// Request a NAT-PMP mapping from the default gateway and advertise
    /// the external port from the reply.
    NatPmp,
}

impl std::str::FromStr for FccNatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(FccNatMode::None),
            "punch" | "hole-punch" | "holepunch" => Ok(FccNatMode::HolePunch),
            "pmp" | "nat-pmp" | "natpmp" => Ok(FccNatMode::NatPmp),
            other => Err(format!("unknown NAT mode: {}", other)),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// An inline service published under a fixed URL path.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    /// Request path the service is served under (e.g. `/ch1`).
    pub path: String,
    /// Upstream URL (`rtp://`, `udp://`, `rtsp://`, `http://`).
    pub url: String,
}

/// Runtime configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening TCP addresses.
    pub listen: Vec<SocketAddr>,
    /// Worker process count.
    pub workers: usize,
    /// Concurrent streaming client cap (bounded by [`STATUS_SLOTS`]).
    pub max_clients: usize,
    /// Packet pool capacity per worker.
    pub pool_capacity: usize,
    /// Verbosity 0..=4 (error..trace).
    pub verbosity: u8,
    /// When set, the `Host` header must match or the request is rejected.
    pub hostname: Option<String>,
    /// When set, every request must carry `r2h-token=<value>`.
    pub token: Option<String>,
    /// Periodic multicast rejoin interval; `None` disables rejoin.
    pub mcast_rejoin_interval: Option<Duration>,
    /// FCC NAT traversal mode.
    pub fcc_nat: FccNatMode,
    /// Local port range for FCC unicast sockets; `None` = ephemeral.
    pub fcc_port_range: Option<(u16, u16)>,
    /// Interface name for upstream unicast traffic (FCC, RTSP).
    pub upstream_if_unicast: Option<String>,
    /// Interface name for multicast joins.
    pub upstream_if_multicast: Option<String>,
    /// Timezone offset applied when translating 14-digit local time-shift
    /// tokens, in seconds east of UTC.
    pub timezone_offset_secs: i32,
    /// Enable udpxy-style open routing of `/rtp/...`-shaped paths.
    pub udpxy_routing: bool,
    /// Respawn crashed workers.
    pub respawn: bool,
    /// Inline services.
    pub services: Vec<ServiceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 5140))],
            workers: 1,
            max_clients: 64,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            verbosity: 2,
            hostname: None,
            token: None,
            mcast_rejoin_interval: None,
            fcc_nat: FccNatMode::None,
            fcc_port_range: None,
            upstream_if_unicast: None,
            upstream_if_multicast: None,
            timezone_offset_secs: 8 * 3600,
            udpxy_routing: true,
            respawn: true,
            services: Vec::new(),
        }
    }
}

/// File-level configuration. Every field is optional; absent fields keep
/// the built-in defaults or whatever the CLI set.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub listen: Option<Vec<String>>,
    pub workers: Option<usize>,
    pub max_clients: Option<usize>,
    pub pool_capacity: Option<usize>,
    pub verbosity: Option<u8>,
    pub hostname: Option<String>,
    pub token: Option<String>,
    pub mcast_rejoin_secs: Option<u64>,
    pub fcc_nat: Option<String>,
    pub fcc_port_min: Option<u16>,
    pub fcc_port_max: Option<u16>,
    pub upstream_if_unicast: Option<String>,
    pub upstream_if_multicast: Option<String>,
    pub timezone: Option<String>,
    pub udpxy_routing: Option<bool>,
    pub respawn: Option<bool>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceEntry>,
}

impl FileConfig {
    /// Load from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let parsed: FileConfig = toml::from_str(&content)?;
        Ok(parsed)
    }
}

impl Config {
    /// Fold a file configuration into this one. CLI-set values are applied
    /// afterwards by the caller and therefore win.
    pub fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(listen) = file.listen {
            let mut addrs = Vec::with_capacity(listen.len());
            for spec in &listen {
                let addr: SocketAddr = spec
                    .parse()
                    .map_err(|_| ConfigError::Invalid(format!("listen address: {}", spec)))?;
                addrs.push(addr);
            }
            self.listen = addrs;
        }
        if let Some(v) = file.workers {
            self.workers = v;
        }
        if let Some(v) = file.max_clients {
            self.max_clients = v;
        }
        if let Some(v) = file.pool_capacity {
            self.pool_capacity = v;
        }
        if let Some(v) = file.verbosity {
            self.verbosity = v;
        }
        if file.hostname.is_some() {
            self.hostname = file.hostname;
        }
        if file.token.is_some() {
            self.token = file.token;
        }
        if let Some(secs) = file.mcast_rejoin_secs {
            self.mcast_rejoin_interval = match secs {
                0 => None,
                n => Some(Duration::from_secs(n)),
            };
        }
        if let Some(mode) = file.fcc_nat {
            self.fcc_nat = mode.parse().map_err(ConfigError::Invalid)?;
        }
        match (file.fcc_port_min, file.fcc_port_max) {
            (Some(lo), Some(hi)) if lo <= hi => self.fcc_port_range = Some((lo, hi)),
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid("fcc_port_min > fcc_port_max".into()))
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "fcc_port_min and fcc_port_max must be set together".into(),
                ))
            }
        }
        if file.upstream_if_unicast.is_some() {
            self.upstream_if_unicast = file.upstream_if_unicast;
        }
        if file.upstream_if_multicast.is_some() {
            self.upstream_if_multicast = file.upstream_if_multicast;
        }
        if let Some(tz) = file.timezone {
            self.timezone_offset_secs = parse_timezone(&tz).map_err(ConfigError::Invalid)?;
        }
        if let Some(v) = file.udpxy_routing {
            self.udpxy_routing = v;
        }
        if let Some(v) = file.respawn {
            self.respawn = v;
        }
        if !file.services.is_empty() {
            self.services = file.services;
        }
        self.validate()
    }

    /// Reject configurations the data plane cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::Invalid("no listen address".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be >= 1".into()));
        }
        if self.max_clients == 0 || self.max_clients > STATUS_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "max_clients must be 1..={}",
                STATUS_SLOTS
            )));
        }
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be >= 1".into()));
        }
        if self.verbosity > 4 {
            return Err(ConfigError::Invalid("verbosity must be 0..=4".into()));
        }
        for svc in &self.services {
            if !svc.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "service path must start with '/': {}",
                    svc.path
                )));
            }
        }
        Ok(())
    }
}

/// Parse a `±HH:MM` / `±HHMM` / `±HH` timezone offset into seconds east
/// of UTC.
pub fn parse_timezone(spec: &str) -> Result<i32, String> {
    let bytes = spec.as_bytes();
    if bytes.is_empty() {
        return Err("empty timezone".into());
    }
    let (sign, rest) = match bytes[0] {
        b'+' => (1i32, &spec[1..]),
        b'-' => (-1i32, &spec[1..]),
        _ => (1i32, spec),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || digits.len() > 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad timezone offset: {}", spec));
    }
    let (hours, minutes) = if digits.len() <= 2 {
        (digits.parse::<i32>().map_err(|e| e.to_string())?, 0)
    } else {
        let split = digits.len() - 2;
        (
            digits[..split].parse::<i32>().map_err(|e| e.to_string())?,
            digits[split..].parse::<i32>().map_err(|e| e.to_string())?,
        )
    };
    if hours > 14 || minutes > 59 {
        return Err(format!("timezone offset out of range: {}", spec));
    }
    Ok(sign * (hours * 3600 + minutes * 60))
}
