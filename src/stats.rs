use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::{self, Duration};
use tracing::info;

/// Lock-free counters for the forwarding path and the health checker.
/// Purely informational; nothing reads them on the hot path.
#[derive(Debug)]
pub struct StatsCollector {
    matched: AtomicU64,
    forwarded: AtomicU64,
    fallthroughs: AtomicU64,
    conn_retries: AtomicU64,
    health_failures: AtomicU64,
    all_down: AtomicU64,

    log_interval: Duration,
}

impl StatsCollector {
    /// Creates the collector; with a non-zero interval a background task
    /// dumps the counters to the log periodically.
    pub fn new(log_interval_secs: u64) -> Arc<Self> {
        let stats = Arc::new(Self {
            matched: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            fallthroughs: AtomicU64::new(0),
            conn_retries: AtomicU64::new(0),
            health_failures: AtomicU64::new(0),
            all_down: AtomicU64::new(0),
            log_interval: Duration::from_secs(log_interval_secs),
        });

        if log_interval_secs > 0 {
            let stats_clone = stats.clone();
            tokio::spawn(async move {
                stats_clone.run_logger().await;
            });
        }

        stats
    }

    pub fn inc_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fallthrough(&self) {
        self.fallthroughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn_retry(&self) {
        self.conn_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_health_failure(&self) {
        self.health_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_all_down(&self) {
        self.all_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn fallthroughs(&self) -> u64 {
        self.fallthroughs.load(Ordering::Relaxed)
    }

    pub fn conn_retries(&self) -> u64 {
        self.conn_retries.load(Ordering::Relaxed)
    }

    pub fn health_failures(&self) -> u64 {
        self.health_failures.load(Ordering::Relaxed)
    }

    pub fn all_down(&self) -> u64 {
        self.all_down.load(Ordering::Relaxed)
    }

    async fn run_logger(&self) {
        let mut interval = time::interval(self.log_interval);
        loop {
            interval.tick().await;
            self.dump_stats();
        }
    }

    fn dump_stats(&self) {
        let matched = self.matched.load(Ordering::Relaxed);
        let forwarded = self.forwarded.load(Ordering::Relaxed);
        let fallthroughs = self.fallthroughs.load(Ordering::Relaxed);
        let retries = self.conn_retries.load(Ordering::Relaxed);
        let health_failures = self.health_failures.load(Ordering::Relaxed);
        let all_down = self.all_down.load(Ordering::Relaxed);

        info!(
            "STATS DUMP: Matched: {}, Forwarded: {} ({:.1}%), FellThrough: {}, ConnRetries: {}, HealthFailures: {}, AllDown: {}",
            matched,
            forwarded,
            if matched > 0 {
                (forwarded as f64 / matched as f64) * 100.0
            } else {
                0.0
            },
            fallthroughs,
            retries,
            health_failures,
            all_down
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StatsCollector::new(0);
        stats.inc_matched();
        stats.inc_forwarded();
        stats.inc_health_failure();
        stats.inc_health_failure();
        assert_eq!(stats.health_failures(), 2);
    }
}
