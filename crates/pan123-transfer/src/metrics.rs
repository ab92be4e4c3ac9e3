//! Per-operation transfer metrics.
//!
//! A fixed ring of the last hundred operations, queried by the `stats`
//! backend command and logged by `logstats`. Recording never fails and never
//! blocks a transfer.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

const RING_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct OperationMetric {
    pub operation: &'static str,
    pub size: u64,
    pub duration: Duration,
    pub error_count: u32,
    pub retry_count: u32,
    pub concurrency_used: usize,
    pub chunk_size: u64,
}

impl OperationMetric {
    pub fn throughput_bps(&self) -> f64 {
        if self.duration.is_zero() {
            return 0.0;
        }
        self.size as f64 / self.duration.as_secs_f64()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub operations: usize,
    pub bytes: u64,
    pub errors: u32,
    pub retries: u32,
    pub avg_throughput_bps: f64,
}

#[derive(Debug, Default)]
pub struct MetricsRing {
    ring: Mutex<VecDeque<OperationMetric>>,
}

impl MetricsRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: OperationMetric) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(metric);
    }

    pub fn snapshot(&self) -> Vec<OperationMetric> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let ring = self.ring.lock().unwrap();
        if ring.is_empty() {
            return MetricsSummary::default();
        }
        let mut summary = MetricsSummary {
            operations: ring.len(),
            ..MetricsSummary::default()
        };
        let mut throughput_sum = 0.0;
        let mut timed = 0usize;
        for metric in ring.iter() {
            summary.bytes += metric.size;
            summary.errors += metric.error_count;
            summary.retries += metric.retry_count;
            let bps = metric.throughput_bps();
            if bps > 0.0 {
                throughput_sum += bps;
                timed += 1;
            }
        }
        if timed > 0 {
            summary.avg_throughput_bps = throughput_sum / timed as f64;
        }
        summary
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn metric(size: u64, secs: u64) -> OperationMetric {
        OperationMetric {
            operation: "upload",
            size,
            duration: Duration::from_secs(secs),
            error_count: 0,
            retry_count: 1,
            concurrency_used: 2,
            chunk_size: 1024,
        }
    }

    #[test]
    fn ring_is_bounded() {
        let ring = MetricsRing::new();
        for i in 0..150 {
            ring.record(metric(i, 1));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 100);
        // Oldest entries fell off the front.
        assert_eq!(snapshot[0].size, 50);
    }

    #[test]
    fn summary_aggregates() {
        let ring = MetricsRing::new();
        ring.record(metric(100, 1));
        ring.record(metric(300, 1));
        let summary = ring.summary();
        assert_eq!(summary.operations, 2);
        assert_eq!(summary.bytes, 400);
        assert_eq!(summary.retries, 2);
        assert!((summary.avg_throughput_bps - 200.0).abs() < f64::EPSILON);
    }
}
