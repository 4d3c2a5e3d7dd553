use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Params;

/// Aggregate statistics of one `search_all` run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStats {
    /// Number of queries executed
    pub query_count: usize,
    /// Max queries in flight
    pub parallel: usize,
    /// Wall-clock duration of the whole run, in seconds
    pub total_time: f64,
    /// Queries per second achieved
    pub rps: f64,
    /// Latency percentiles in microseconds
    #[serde(flatten)]
    pub latency: LatencyMetrics,
}

/// Latency percentiles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: f64,
    pub std_us: f64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Statistics of one upload stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadStats {
    /// Number of records uploaded
    pub record_count: usize,
    /// Seconds spent sending batches
    pub upload_time: f64,
    /// Seconds including the post-upload barrier
    pub total_time: f64,
    /// Whatever the engine reported once indexing settled
    #[serde(default)]
    pub post_upload: Params,
    #[serde(default)]
    pub memory_usage: Params,
}

/// Collects per-query latencies for a search run
pub struct LatencyRecorder {
    /// Latencies from 1us to 60 seconds with 3 significant figures
    histogram: Histogram<u64>,
    start_time: Instant,
}

impl LatencyRecorder {
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .map_err(|e| Error::Config(format!("Cannot create latency histogram: {}", e)))?;
        Ok(Self {
            histogram,
            start_time: Instant::now(),
        })
    }

    /// Record a single query latency
    pub fn record(&mut self, latency: Duration) {
        let latency_us = (latency.as_micros() as u64).max(1);
        self.histogram.saturating_record(latency_us);
    }

    pub fn len(&self) -> usize {
        self.histogram.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Stop the clock and compute aggregate statistics
    pub fn finish(self, parallel: usize) -> SearchStats {
        let elapsed = self.start_time.elapsed();
        let query_count = self.len();
        let total_time = elapsed.as_secs_f64();
        let rps = if total_time > 0.0 {
            query_count as f64 / total_time
        } else {
            0.0
        };

        let latency = if self.is_empty() {
            LatencyMetrics::default()
        } else {
            let h = &self.histogram;
            LatencyMetrics {
                min_us: h.min(),
                max_us: h.max(),
                mean_us: h.mean(),
                std_us: h.stdev(),
                p50_us: h.value_at_quantile(0.50),
                p90_us: h.value_at_quantile(0.90),
                p95_us: h.value_at_quantile(0.95),
                p99_us: h.value_at_quantile(0.99),
            }
        };

        SearchStats {
            query_count,
            parallel,
            total_time,
            rps,
            latency,
        }
    }
}
