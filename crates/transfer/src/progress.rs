use std::time::{Duration, Instant};

/// Minimum percent change before a throttled report is emitted.
const MIN_PERCENT_DELTA: u8 = 2;

/// Maximum time between throttled reports.
const MAX_REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Percentage of `total` covered by `done`, rounded down.
///
/// Only returns 100 once `done >= total`, so a transfer never reports
/// completion before its last byte lands. An empty transfer is complete.
pub fn percent_complete(done: u64, total: u64) -> u8 {
    if total == 0 || done >= total {
        return 100;
    }
    ((done as u128 * 100) / total as u128) as u8
}

// ---------------------------------------------------------------------------
// ProgressThrottle
// ---------------------------------------------------------------------------

/// Decides when a progress update is worth persisting.
///
/// Emits when the transfer completes, the percentage moved by at least
/// 2 points, or 500 ms passed since the last emission.
#[derive(Debug)]
pub struct ProgressThrottle {
    last_percent: Option<u8>,
    last_emit: Instant,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self {
            last_percent: None,
            last_emit: Instant::now(),
        }
    }

    /// Returns `true` if `percent` should be reported now.
    pub fn should_emit(&mut self, percent: u8) -> bool {
        let emit = match self.last_percent {
            None => true,
            Some(last) => {
                percent >= 100
                    || percent.saturating_sub(last) >= MIN_PERCENT_DELTA
                    || (percent != last && self.last_emit.elapsed() >= MAX_REPORT_INTERVAL)
            }
        };
        if emit {
            self.last_percent = Some(percent);
            self.last_emit = Instant::now();
        }
        emit
    }
}

// ---------------------------------------------------------------------------
// TransferClock
// ---------------------------------------------------------------------------

/// Measures the wall-clock duration of one transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferClock {
    started: Instant,
    stopped: Option<Instant>,
}

impl Default for TransferClock {
    fn default() -> Self {
        Self::start()
    }
}

impl TransferClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            stopped: None,
        }
    }

    /// Freezes the clock. Later calls keep the first stop time.
    pub fn stop(&mut self) {
        if self.stopped.is_none() {
            self.stopped = Some(Instant::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stopped.is_none()
    }

    pub fn elapsed(&self) -> Duration {
        match self.stopped {
            Some(stop) => stop.duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    /// Average throughput for `bytes` over the elapsed time.
    pub fn bytes_per_second(&self, bytes: u64) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        bytes as f64 / secs
    }
}
