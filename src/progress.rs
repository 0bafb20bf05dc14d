//! Progress tracking, stall detection and progress-line parsing

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum elapsed time before a progress event is reported
///
/// Rates computed over shorter windows are meaningless.
pub const MIN_REPORT_ELAPSED: Duration = Duration::from_millis(500);

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})(?:\.\d+)?%").expect("static regex"));

/// Extract the completion percentage from one line of downloader output
///
/// Handles wget dot output (`... 42% 10.5M 3m`) and curl progress bars
/// (`####   42.7%`, truncated to 42). Values above 100 are rejected.
pub fn parse_percent(line: &str) -> Option<u8> {
    PERCENT_RE
        .captures_iter(line)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .find(|p| *p <= 100)
        .and_then(|p| u8::try_from(p).ok())
}

/// Per-attempt progress state used for stall detection
///
/// The stall clock tracks progress, not activity: repeating the same percent
/// does not reset it.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    last_percent: Option<u8>,
    last_change: Instant,
    stall_timeout: Duration,
}

impl ProgressTracker {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            last_percent: None,
            last_change: Instant::now(),
            stall_timeout,
        }
    }

    /// Record an observed percent; returns true if it differs from the last one
    pub fn update(&mut self, percent: u8) -> bool {
        if self.last_percent == Some(percent) {
            return false;
        }
        self.last_percent = Some(percent);
        self.last_change = Instant::now();
        true
    }

    pub fn is_stalled(&self) -> bool {
        self.last_change.elapsed() > self.stall_timeout
    }

    pub fn last_percent(&self) -> Option<u8> {
        self.last_percent
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }
}

/// Transfer speed and remaining time derived from percent and elapsed time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    pub speed_mbps: f64,
    pub eta_seconds: u64,
}

/// Estimate speed (MB/s) and ETA from percent complete of a `size_gb` payload
pub fn estimate_rate(percent: u8, size_gb: f64, elapsed: Duration) -> RateEstimate {
    let total_mb = size_gb * 1024.0;
    let fraction = f64::from(percent) / 100.0;
    let elapsed_secs = elapsed.as_secs_f64();

    let speed = if elapsed_secs > 0.0 {
        fraction * total_mb / elapsed_secs
    } else {
        0.0
    };

    let eta_seconds = if speed > 0.0 {
        ((1.0 - fraction) * total_mb / speed).round() as u64
    } else {
        0
    };

    RateEstimate {
        speed_mbps: (speed * 100.0).round() / 100.0,
        eta_seconds,
    }
}
