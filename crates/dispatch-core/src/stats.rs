use std::time::Duration;

const DEFAULT_BUCKET_MS: u64 = 10;
const DEFAULT_BUCKETS: usize = 12_000; // Up to 2 minutes

/// Integer-millisecond latency histogram with fixed-width buckets.
/// Samples beyond the last bucket are counted in it.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    bucket_ms: u64,
    buckets: Vec<u64>,
    count: u64,
    total_ms: u64,
    max_ms: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKET_MS, DEFAULT_BUCKETS)
    }

    pub fn with_buckets(bucket_ms: u64, buckets: usize) -> Self {
        Self {
            bucket_ms: bucket_ms.max(1),
            buckets: vec![0; buckets.max(1)],
            count: 0,
            total_ms: 0,
            max_ms: 0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let bucket_idx = (latency_ms / self.bucket_ms).min((self.buckets.len() - 1) as u64) as usize;
        self.buckets[bucket_idx] += 1;
        self.count += 1;
        self.total_ms = self.total_ms.saturating_add(latency_ms);
        self.max_ms = self.max_ms.max(latency_ms);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }

    /// Lower bound in ms of the bucket holding the p-th percentile.
    pub fn percentile(&self, p: u64) -> u64 {
        if self.count == 0 {
            return 0;
        }

        let target = ((self.count * p) / 100).max(1);
        let mut cumulative = 0u64;

        for (bucket_idx, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return bucket_idx as u64 * self.bucket_ms;
            }
        }

        self.buckets.len() as u64 * self.bucket_ms
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
