//! Network-quality observation.
//!
//! Transfers report their outcomes here; the monitor condenses the recent
//! window into a composite quality score in `[0, 1]` and a throughput
//! estimate. Strategy selection and timeouts consult it, but a monitor with
//! no samples answers with neutral defaults, so nothing depends on it for
//! correctness.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Window of samples the score is computed over.
const SAMPLE_WINDOW: Duration = Duration::from_secs(30);
const MAX_SAMPLES: usize = 256;

/// Quality reported before any traffic has been observed.
const NEUTRAL_QUALITY: f64 = 0.7;
const NEUTRAL_MBPS: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    ok: bool,
    retried: bool,
    latency: Duration,
    bytes: u64,
    duration: Duration,
}

#[derive(Debug, Default)]
pub struct NetworkMonitor {
    samples: Mutex<VecDeque<Sample>>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration, bytes: u64, duration: Duration) {
        self.push(Sample {
            at: Instant::now(),
            ok: true,
            retried: false,
            latency,
            bytes,
            duration,
        });
    }

    pub fn record_retry(&self, latency: Duration) {
        self.push(Sample {
            at: Instant::now(),
            ok: true,
            retried: true,
            latency,
            bytes: 0,
            duration: Duration::ZERO,
        });
    }

    pub fn record_error(&self) {
        self.push(Sample {
            at: Instant::now(),
            ok: false,
            retried: false,
            latency: Duration::ZERO,
            bytes: 0,
            duration: Duration::ZERO,
        });
    }

    fn push(&self, sample: Sample) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    fn recent(&self) -> Vec<Sample> {
        let cutoff = Instant::now().checked_sub(SAMPLE_WINDOW);
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|s| cutoff.map_or(true, |c| s.at >= c))
            .copied()
            .collect()
    }

    /// Composite score from success rate, retry rate and latency over the
    /// recent window.
    pub fn quality(&self) -> f64 {
        let recent = self.recent();
        if recent.is_empty() {
            return NEUTRAL_QUALITY;
        }
        let total = recent.len() as f64;
        let successes = recent.iter().filter(|s| s.ok).count() as f64;
        let retries = recent.iter().filter(|s| s.retried).count() as f64;
        let success_rate = successes / total;
        let retry_penalty = (retries / total) * 0.5;

        let latencies: Vec<_> = recent
            .iter()
            .filter(|s| s.ok && !s.latency.is_zero())
            .map(|s| s.latency)
            .collect();
        let latency_score = if latencies.is_empty() {
            1.0
        } else {
            let avg_ms = latencies.iter().map(|l| l.as_millis()).sum::<u128>() as f64
                / latencies.len() as f64;
            // 50ms or better is full marks, 2s or worse is zero.
            (1.0 - ((avg_ms - 50.0) / 1950.0)).clamp(0.0, 1.0)
        };

        ((success_rate - retry_penalty) * 0.7 + latency_score * 0.3).clamp(0.0, 1.0)
    }

    /// Observed throughput in megabits per second.
    pub fn estimated_mbps(&self) -> f64 {
        let recent = self.recent();
        let (bytes, duration): (u64, Duration) = recent
            .iter()
            .filter(|s| s.ok && s.bytes > 0)
            .fold((0, Duration::ZERO), |(b, d), s| (b + s.bytes, d + s.duration));
        if bytes == 0 || duration.is_zero() {
            return NEUTRAL_MBPS;
        }
        (bytes as f64 * 8.0) / duration.as_secs_f64() / 1_000_000.0
    }
}
