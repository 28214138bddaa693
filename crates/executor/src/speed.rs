use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Sample {
    total_bytes: u64,
    at: Instant,
}

/// Transfer rate over a sliding window of cumulative byte counts.
///
/// The monitor only sees how many bytes are on disk, so samples are running
/// totals rather than deltas. A total that goes down (a file was truncated
/// and restarted) resets the window.
pub struct SpeedMeter {
    inner: Mutex<MeterInner>,
}

struct MeterInner {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
}

impl SpeedMeter {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(MeterInner {
                samples: VecDeque::new(),
                window,
                max_samples: max_samples.max(2),
            }),
        }
    }

    pub fn record(&self, total_bytes: u64) {
        self.record_at(total_bytes, Instant::now());
    }

    fn record_at(&self, total_bytes: u64, at: Instant) {
        let mut s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if s.samples.back().is_some_and(|last| last.total_bytes > total_bytes) {
            s.samples.clear();
        }
        s.samples.push_back(Sample { total_bytes, at });

        let window = s.window;
        while s
            .samples
            .front()
            .is_some_and(|first| at.duration_since(first.at) > window)
        {
            s.samples.pop_front();
        }
        while s.samples.len() > s.max_samples {
            s.samples.pop_front();
        }
    }

    /// Bytes per second across the window; `0.0` with fewer than two samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(first), Some(last)) = (s.samples.front(), s.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.at.duration_since(first.at);
        if elapsed.is_zero() {
            return 0.0;
        }
        (last.total_bytes - first.total_bytes) as f64 / elapsed.as_secs_f64()
    }

    /// Time to move `remaining_bytes` at the current rate.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}
