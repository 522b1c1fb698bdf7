//! Operation latency tracking
//!
//! Targets are diagnostics only. Exceeding one never aborts the operation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Measures one operation against its target
#[derive(Debug)]
pub struct LatencyTimer {
    operation: &'static str,
    target: Duration,
    started: Instant,
}

impl LatencyTimer {
    pub fn start(operation: &'static str, target: Duration) -> Self {
        LatencyTimer {
            operation,
            target,
            started: Instant::now(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Finish and classify the measurement
    pub fn finish(self) -> LatencySample {
        let elapsed = self.started.elapsed();
        LatencySample {
            operation: self.operation,
            elapsed,
            target: self.target,
            exceeded: elapsed > self.target,
        }
    }
}

/// A finished measurement
#[derive(Clone, Copy, Debug)]
pub struct LatencySample {
    pub operation: &'static str,
    pub elapsed: Duration,
    pub target: Duration,
    pub exceeded: bool,
}

/// Per-operation latency statistics
#[derive(Clone, Debug, Default)]
pub struct LatencyStats {
    pub samples: u64,
    pub violations: u64,
    pub max: Duration,
    pub total: Duration,
}

impl LatencyStats {
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.total / self.samples as u32
        }
    }
}

/// Latency book for every engine operation
#[derive(Clone, Debug, Default)]
pub struct LatencyBook {
    stats: HashMap<&'static str, LatencyStats>,
}

impl LatencyBook {
    pub fn new() -> Self {
        LatencyBook::default()
    }

    pub fn record(&mut self, sample: LatencySample) {
        let entry = self.stats.entry(sample.operation).or_default();
        entry.samples += 1;
        entry.total += sample.elapsed;
        entry.max = entry.max.max(sample.elapsed);
        if sample.exceeded {
            entry.violations += 1;
        }
    }

    pub fn get(&self, operation: &str) -> Option<&LatencyStats> {
        self.stats.get(operation)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &LatencyStats)> {
        self.stats.iter().map(|(op, stats)| (*op, stats))
    }

    pub fn total_violations(&self) -> u64 {
        self.stats.values().map(|s| s.violations).sum()
    }

    pub fn clear(&mut self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_target_always_exceeded() {
        let timer = LatencyTimer::start("checkpoint", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        let sample = timer.finish();
        assert!(sample.exceeded);
    }

    #[test]
    fn test_book_accumulates() {
        let mut book = LatencyBook::new();
        book.record(LatencySample {
            operation: "recover",
            elapsed: Duration::from_millis(10),
            target: Duration::from_millis(5),
            exceeded: true,
        });
        book.record(LatencySample {
            operation: "recover",
            elapsed: Duration::from_millis(2),
            target: Duration::from_millis(5),
            exceeded: false,
        });

        let stats = book.get("recover").unwrap();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.violations, 1);
        assert_eq!(stats.max, Duration::from_millis(10));
        assert_eq!(stats.mean(), Duration::from_millis(6));
        assert_eq!(book.total_violations(), 1);
    }
}
