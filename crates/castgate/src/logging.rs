// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global logger: `log` facade → stderr + shared log ring.
//!
//! Installed once per process (the supervisor installs before fork, the
//! workers inherit and only rebadge their worker id). The active level
//! lives in the shared status region so `/api/loglevel` takes effect in
//! every worker without IPC.

use crate::status::{epoch_ms, NotifyTx, StatusRegion};
use log::{LevelFilter, Metadata, Record};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

static LOGGER: OnceLock<GateLogger> = OnceLock::new();

/// Map the gateway's 0..=4 verbosity scale onto `log` levels.
pub fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn verbosity_of(level: log::Level) -> u8 {
    match level {
        log::Level::Error => 0,
        log::Level::Warn => 1,
        log::Level::Info => 2,
        log::Level::Debug => 3,
        log::Level::Trace => 4,
    }
}

struct GateLogger {
    region: &'static StatusRegion,
    notify: NotifyTx,
    /// -1 = supervisor, >= 0 = worker id.
    worker: AtomicI32,
}

impl GateLogger {
    fn worker_label(&self) -> String {
        match self.worker.load(Ordering::Relaxed) {
            -1 => "sup".to_string(),
            id => format!("w{}", id),
        }
    }
}

impl log::Log for GateLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        let active = self.region.log_level.load(Ordering::Relaxed) as u8;
        verbosity_of(metadata.level()) <= active
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let label = self.worker_label();
        let msg = format!("[{}] {}", label, record.args());
        let now = epoch_ms();
        let secs = now / 1000;
        eprintln!(
            "{:02}:{:02}:{:02} {:5} {}",
            (secs / 3600) % 24,
            (secs / 60) % 60,
            secs % 60,
            record.level(),
            msg
        );
        self.region
            .ring
            .append(verbosity_of(record.level()), now, &msg);
        self.notify.wake_all();
    }

    fn flush(&self) {}
}

/// Install the global logger. Later calls are ignored (the logger is
/// process-wide and fork-inherited).
pub fn init(region: &'static StatusRegion, notify: NotifyTx) {
    let logger = LOGGER.get_or_init(|| GateLogger {
        region,
        notify,
        worker: AtomicI32::new(-1),
    });
    if log::set_logger(logger).is_ok() {
        // Filtering is dynamic against the shared region; let everything
        // through the facade.
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Rebadge log lines after fork.
pub fn set_worker(id: u32) {
    if let Some(logger) = LOGGER.get() {
        logger.worker.store(id as i32, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping_is_total() {
        assert_eq!(level_filter(0), LevelFilter::Error);
        assert_eq!(level_filter(2), LevelFilter::Info);
        assert_eq!(level_filter(4), LevelFilter::Trace);
        assert_eq!(level_filter(99), LevelFilter::Trace);
        assert_eq!(verbosity_of(log::Level::Error), 0);
        assert_eq!(verbosity_of(log::Level::Trace), 4);
    }
}
