//! Tracing setup for sgbench.
//!
//! Everything goes to stderr; stdout carries only the run summary (or the
//! rendered config with `--print-config`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output
    pub json: bool,
    /// Debug-level output for the sgbench target
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub fn default_directive(&self) -> &'static str {
        if self.verbose {
            "sgbench=debug"
        } else {
            "sgbench=info"
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
    });
    let pretty_layer = (!config.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();
}

/// Admits at most one log line per interval, across threads.
///
/// Used for the copier's progress line and the verifier's per-cycle status and
/// check-error warnings, which would otherwise fire once per file or per poll.
pub struct LogThrottle {
    interval: Duration,
    origin: Instant,
    /// Milliseconds since `origin` before which nothing is admitted
    next_allowed_ms: AtomicU64,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            next_allowed_ms: AtomicU64::new(0),
        }
    }

    pub fn should_log(&self) -> bool {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let next = self.next_allowed_ms.load(Ordering::Relaxed);
        if now_ms < next {
            return false;
        }
        let following = now_ms.saturating_add(self.interval.as_millis() as u64);
        self.next_allowed_ms
            .compare_exchange(next, following, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
