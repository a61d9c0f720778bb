use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::Chunk;

/// Aggregate progress over all chunks, weighted by chunk size.
///
/// Computed from scratch on every call so that concurrent chunk updates
/// converge on the same value regardless of arrival order.
pub fn aggregate_percent(chunks: &[Chunk], total_size: u64) -> u8 {
    if total_size == 0 {
        return 0;
    }
    let weighted: u128 = chunks
        .iter()
        .map(|c| u128::from(c.progress) * u128::from(c.size))
        .sum();
    let total = u128::from(total_size);
    // Round half up.
    let percent = (weighted * 2 + total) / (total * 2);
    percent.min(100) as u8
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed from a sliding window of cumulative byte counts.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    started: Instant,
    /// First byte count recorded since creation or the last reset.
    baseline: Option<u64>,
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                started: Instant::now(),
                baseline: None,
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records the total bytes transferred so far.
    pub fn add_sample(&self, total_bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.baseline.get_or_insert(total_bytes);
        s.samples.push(SpeedSample {
            bytes: total_bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the speed in bytes/second.
    ///
    /// Uses the window when it holds at least 2 samples, otherwise the
    /// average since the calculator was created or last reset. Bytes
    /// already counted by the first sample of a run are excluded.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        let Some(last) = s.samples.last() else {
            return 0.0;
        };

        if s.samples.len() >= 2 {
            let first = &s.samples[0];
            let elapsed = last.timestamp.duration_since(first.timestamp);
            if !elapsed.is_zero() {
                let delta = last.bytes.saturating_sub(first.bytes);
                return delta as f64 / elapsed.as_secs_f64();
            }
        }

        let elapsed = last.timestamp.duration_since(s.started);
        if elapsed.is_zero() {
            return 0.0;
        }
        let delta = last.bytes.saturating_sub(s.baseline.unwrap_or(0));
        delta as f64 / elapsed.as_secs_f64()
    }

    /// Clears all samples and restarts the average.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap();
        s.samples.clear();
        s.baseline = None;
        s.started = Instant::now();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunked::partition;
    use std::sync::Arc;

    #[test]
    fn aggregate_empty_source_is_zero() {
        assert_eq!(aggregate_percent(&[], 0), 0);
    }

    #[test]
    fn aggregate_all_done_is_hundred() {
        let mut chunks = partition(1000, 300);
        for c in &mut chunks {
            c.progress = 100;
        }
        assert_eq!(aggregate_percent(&chunks, 1000), 100);
    }

    #[test]
    fn aggregate_rounds_half_up() {
        let mut chunks = partition(8, 1);
        // 4 of 8 chunks at 1% = 0.5%.
        for c in chunks.iter_mut().take(4) {
            c.progress = 1;
        }
        assert_eq!(aggregate_percent(&chunks, 8), 1);
    }

    #[test]
    fn speed_calculator_no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_single_sample_uses_average() {
        let calc = SpeedCalculator::new(Some(Duration::from_millis(10)), None);
        calc.add_sample(0);
        std::thread::sleep(Duration::from_millis(20));
        calc.add_sample(1000);
        assert_eq!(calc.inner.lock().unwrap().samples.len(), 1);
        assert!(calc.bytes_per_second() > 0.0);
    }

    #[test]
    fn speed_calculator_average_ignores_bytes_before_reset() {
        let calc = SpeedCalculator::new(Some(Duration::from_millis(10)), None);
        calc.add_sample(50);
        calc.reset();
        // Bytes stored by an earlier run.
        calc.add_sample(1_000_000);
        std::thread::sleep(Duration::from_millis(30));
        calc.add_sample(1_000_100);

        let speed = calc.bytes_per_second();
        assert!(speed > 0.0);
        // 100 bytes over at least 30 ms.
        assert!(speed < 100.0 / 0.025, "speed {speed}");
    }

    #[test]
    fn speed_calculator_window_delta() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        calc.add_sample(500);
        std::thread::sleep(Duration::from_millis(50));
        calc.add_sample(1000);

        let speed = calc.bytes_per_second();
        // 500 bytes over ~50 ms; timing is imprecise, so only bound it loosely.
        assert!(speed > 0.0);
        assert!(speed < 500.0 / 0.04);
    }

    #[test]
    fn speed_calculator_reset() {
        let calc = SpeedCalculator::default();
        calc.add_sample(100);
        calc.add_sample(200);
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_calculator_max_samples() {
        let calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        for i in 0..20 {
            calc.add_sample(i * 10);
        }
        let s = calc.inner.lock().unwrap();
        assert!(s.samples.len() <= 5);
    }

    #[test]
    fn speed_calculator_concurrent_access() {
        use std::thread;

        let calc = Arc::new(SpeedCalculator::default());
        let mut handles = vec![];

        for t in 0..10 {
            let c = Arc::clone(&calc);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    c.add_sample(t * 100 + i);
                    let _ = c.bytes_per_second();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let _ = calc.bytes_per_second();
    }
}
