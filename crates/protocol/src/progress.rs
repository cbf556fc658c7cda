//! Progress-event pacing and speed estimation.

use std::time::{Duration, Instant};

use crate::constants::PROGRESS_INTERVAL;

/// Decides when a per-file progress event may be emitted: at most every
/// 100 ms, or on any whole-percent change, whichever comes first. The
/// terminal 100% tick always passes.
#[derive(Debug)]
pub struct ProgressThrottle {
    total: u64,
    last_emit: Option<Instant>,
    last_percent: i32,
}

impl ProgressThrottle {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total: total_bytes,
            last_emit: None,
            last_percent: -1,
        }
    }

    /// Percent for `done` bytes; empty files are complete at 0 bytes.
    pub fn percent(&self, done: u64) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            (done as f32 / self.total as f32) * 100.0
        }
    }

    /// Returns the percent to report when an event is due, `None` to skip.
    pub fn tick(&mut self, done: u64) -> Option<f32> {
        let percent = self.percent(done);
        let whole = percent.floor() as i32;
        let now = Instant::now();

        let interval_due = match self.last_emit {
            Some(at) => now.duration_since(at) >= PROGRESS_INTERVAL,
            None => true,
        };
        let percent_due = whole > self.last_percent;
        let terminal = done >= self.total;

        if interval_due || percent_due || terminal {
            self.last_emit = Some(now);
            self.last_percent = whole;
            Some(percent)
        } else {
            None
        }
    }
}

/// Transfer speed over a short sliding window of byte samples.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: Vec<(Instant, u64)>,
    window: Duration,
}

impl SpeedCalculator {
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(5))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: Vec::new(),
            window,
        }
    }

    /// Records `bytes` transferred at the current instant.
    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push((now, bytes));
        let cutoff = now - self.window;
        self.samples.retain(|(at, _)| *at >= cutoff);
    }

    /// Average bytes/second within the window; `None` below 2 samples.
    pub fn bytes_per_second(&self) -> Option<f64> {
        let (first, last) = (self.samples.first()?, self.samples.last()?);
        let elapsed = last.0.duration_since(first.0);
        if elapsed.is_zero() {
            return None;
        }
        let total: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        Some(total as f64 / elapsed.as_secs_f64())
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}
