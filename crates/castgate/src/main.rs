// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! castgate CLI.
//!
//! # Usage
//!
//! ```bash
//! # Open routing on the default port
//! castgate
//!
//! # Two workers, explicit listen address, hostname filter
//! castgate --listen 0.0.0.0:8080 --workers 2 --hostname tv.lan
//!
//! # Configuration file plus overrides
//! castgate --config /etc/castgate.toml --verbosity 3
//!
//! # FCC behind NAT, pinned port range
//! castgate --fcc-nat pmp --fcc-port-min 40000 --fcc-port-max 40100
//! ```

use castgate::config::{parse_timezone, Config, FccNatMode, FileConfig};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

/// IPTV multicast/RTSP to HTTP unicast streaming gateway.
#[derive(Parser, Debug)]
#[command(name = "castgate")]
#[command(about = "IPTV multicast/RTSP to HTTP unicast streaming gateway")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (repeatable)
    #[arg(short, long)]
    listen: Vec<SocketAddr>,

    /// Worker process count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum concurrent clients
    #[arg(long)]
    max_clients: Option<usize>,

    /// Packet pool capacity per worker
    #[arg(long)]
    pool_capacity: Option<usize>,

    /// Verbosity 0..=4 (error..trace)
    #[arg(short, long)]
    verbosity: Option<u8>,

    /// Reject requests whose Host header differs
    #[arg(long)]
    hostname: Option<String>,

    /// Require r2h-token=<value> on every request
    #[arg(long)]
    token: Option<String>,

    /// Periodic multicast rejoin interval in seconds (0 disables)
    #[arg(long)]
    mcast_rejoin: Option<u64>,

    /// FCC NAT mode: none | punch | pmp
    #[arg(long)]
    fcc_nat: Option<FccNatMode>,

    /// Lower bound of the FCC unicast port range
    #[arg(long)]
    fcc_port_min: Option<u16>,

    /// Upper bound of the FCC unicast port range
    #[arg(long)]
    fcc_port_max: Option<u16>,

    /// Interface name for upstream unicast traffic
    #[arg(long)]
    upstream_if_unicast: Option<String>,

    /// Interface name for multicast joins
    #[arg(long)]
    upstream_if_multicast: Option<String>,

    /// Timezone offset for 14-digit time-shift tokens, e.g. +08:00
    #[arg(long)]
    timezone: Option<String>,

    /// Disable udpxy-style open routing of /rtp, /udp, /rtsp, /http
    #[arg(long)]
    no_udpxy: bool,

    /// Do not respawn crashed workers
    #[arg(long)]
    no_respawn: bool,
}

fn build_config(args: Args) -> Result<Config, String> {
    let mut cfg = Config::default();

    if let Some(path) = &args.config {
        let file = FileConfig::from_file(path).map_err(|e| e.to_string())?;
        cfg.apply_file(file).map_err(|e| e.to_string())?;
    }

    // CLI flags win over the file.
    if !args.listen.is_empty() {
        cfg.listen = args.listen;
    }
    if let Some(v) = args.workers {
        cfg.workers = v;
    }
    if let Some(v) = args.max_clients {
        cfg.max_clients = v;
    }
    if let Some(v) = args.pool_capacity {
        cfg.pool_capacity = v;
    }
    if let Some(v) = args.verbosity {
        cfg.verbosity = v;
    }
    if args.hostname.is_some() {
        cfg.hostname = args.hostname;
    }
    if args.token.is_some() {
        cfg.token = args.token;
    }
    if let Some(secs) = args.mcast_rejoin {
        cfg.mcast_rejoin_interval = match secs {
            0 => None,
            n => Some(std::time::Duration::from_secs(n)),
        };
    }
    if let Some(mode) = args.fcc_nat {
        cfg.fcc_nat = mode;
    }
    match (args.fcc_port_min, args.fcc_port_max) {
        (Some(lo), Some(hi)) if lo <= hi => cfg.fcc_port_range = Some((lo, hi)),
        (None, None) => {}
        _ => return Err("--fcc-port-min/--fcc-port-max must form a valid range".into()),
    }
    if args.upstream_if_unicast.is_some() {
        cfg.upstream_if_unicast = args.upstream_if_unicast;
    }
    if args.upstream_if_multicast.is_some() {
        cfg.upstream_if_multicast = args.upstream_if_multicast;
    }
    if let Some(tz) = &args.timezone {
        cfg.timezone_offset_secs = parse_timezone(tz)?;
    }
    if args.no_udpxy {
        cfg.udpxy_routing = false;
    }
    if args.no_respawn {
        cfg.respawn = false;
    }

    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let cfg = match build_config(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("castgate: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match castgate::supervisor::run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("castgate: {}", e);
            ExitCode::FAILURE
        }
    }
}
