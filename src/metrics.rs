//! Latency histograms, counters and file exports.
//!
//! Every component owns its histograms outright and records from a single writer thread; only the
//! request/miss totals are shared, and those are relaxed atomics. Percentile queries are monotone
//! in `p` and `merge` is associative, both inherited from the underlying HDR histogram.

use crate::clock::{now_ns, ns_to_us, Timestamp};
use crate::error::Error;
use crate::request::RequestTrace;
use hdrhistogram::Histogram;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest latency the histograms can resolve: 10 seconds.
pub const HIGHEST_TRACKABLE_NS: u64 = 10_000_000_000;
/// Fixed per-worker histogram cardinality at the LB and in exports.
pub const MAX_WORKERS: usize = 16;
/// Rows written by [`LatencyHistogram::export_csv_cdf`] (plus the header line).
pub const CDF_POINTS: usize = 10_000;

/// Logarithmic-bucket latency histogram with three significant figures over [1 ns, 10 s].
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    hist: Histogram<u64>,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let hist = Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_NS, 3)
            .expect("static histogram bounds are valid");
        Self { hist }
    }

    /// Record one latency value in nanoseconds, clamping to the trackable range.
    pub fn record(&mut self, value_ns: u64) {
        self.hist.saturating_record(value_ns.max(1));
    }

    /// Record the same value `count` times.
    pub fn record_count(&mut self, value_ns: u64, count: u64) {
        let _ = self
            .hist
            .record_n(value_ns.clamp(1, HIGHEST_TRACKABLE_NS), count);
    }

    /// Value at percentile `p` in [0, 100]; 0 when the histogram is empty.
    pub fn percentile(&self, p: f64) -> u64 {
        self.hist.value_at_quantile(p / 100.0)
    }

    pub fn count(&self) -> u64 {
        self.hist.len()
    }

    pub fn min(&self) -> u64 {
        self.hist.min()
    }

    pub fn max(&self) -> u64 {
        self.hist.max()
    }

    pub fn mean(&self) -> f64 {
        self.hist.mean()
    }

    pub fn stddev(&self) -> f64 {
        self.hist.stdev()
    }

    pub fn reset(&mut self) {
        self.hist.reset();
    }

    /// Fold another histogram into this one. Associative and commutative.
    pub fn merge(&mut self, other: &LatencyHistogram) {
        self.hist
            .add(&other.hist)
            .expect("histograms share bounds and precision");
    }

    /// One-line summary at info level, all figures in microseconds.
    pub fn log_summary(&self, name: &str) {
        info!(
            "[{name}] count={} mean={:.2}us P50={:.2}us P99={:.2}us P99.9={:.2}us P99.99={:.2}us max={:.2}us",
            self.count(),
            self.mean() / 1_000.0,
            ns_to_us(self.percentile(50.0)),
            ns_to_us(self.percentile(99.0)),
            ns_to_us(self.percentile(99.9)),
            ns_to_us(self.percentile(99.99)),
            ns_to_us(self.max()),
        );
    }

    /// Dump the recorded distribution as a text percentile table.
    pub fn export_hdr(&self, path: &Path) -> Result<(), Error> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(
            out,
            "{:>12} {:>14} {:>12} {:>14}",
            "Value(ns)", "Percentile", "TotalCount", "1/(1-P)"
        )?;
        for step in 0..=100 {
            let p = step as f64;
            let value = self.percentile(p);
            let count = self.hist.count_between(0, value);
            let inverse = if p >= 100.0 {
                f64::INFINITY
            } else {
                1.0 / (1.0 - p / 100.0)
            };
            writeln!(
                out,
                "{value:>12} {:>14.6} {count:>12} {inverse:>14.2}",
                p / 100.0
            )?;
        }
        writeln!(
            out,
            "#[Mean = {:.2}, StdDeviation = {:.2}]",
            self.mean(),
            self.stddev()
        )?;
        writeln!(out, "#[Max = {}, TotalCount = {}]", self.max(), self.count())?;
        Ok(())
    }

    /// Export the CDF as CSV: 10 001 rows of `percentile,latency_ns,latency_us`.
    pub fn export_csv_cdf(&self, path: &Path) -> Result<(), Error> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "percentile,latency_ns,latency_us")?;
        for step in 0..=CDF_POINTS {
            let p = 100.0 * step as f64 / CDF_POINTS as f64;
            let value = self.percentile(p);
            writeln!(out, "{p},{value},{}", value as f64 / 1_000.0)?;
        }
        Ok(())
    }
}

/// Percentile table read back from an exported CDF CSV.
///
/// Re-importing and querying the table reproduces the source histogram's percentile values to
/// within one least-significant unit of the export precision.
pub struct CdfTable {
    rows: Vec<(f64, u64)>,
}

impl CdfTable {
    pub fn load(path: &Path) -> Result<CdfTable, Error> {
        let reader = BufReader::new(File::open(path)?);
        let mut rows = Vec::with_capacity(CDF_POINTS + 1);
        for line in reader.lines().skip(1) {
            let line = line?;
            let mut fields = line.split(',');
            let p = fields
                .next()
                .and_then(|f| f.parse::<f64>().ok())
                .ok_or_else(|| Error::Export(format!("malformed CDF row: {line}")))?;
            let value = fields
                .next()
                .and_then(|f| f.parse::<u64>().ok())
                .ok_or_else(|| Error::Export(format!("malformed CDF row: {line}")))?;
            rows.push((p, value));
        }
        Ok(CdfTable { rows })
    }

    /// Latency at percentile `p`, using the closest exported row at or below `p`.
    pub fn value_at(&self, p: f64) -> u64 {
        match self
            .rows
            .binary_search_by(|(row_p, _)| row_p.partial_cmp(&p).unwrap())
        {
            Ok(idx) => self.rows[idx].1,
            Err(0) => self.rows.first().map(|r| r.1).unwrap_or(0),
            Err(idx) => self.rows[idx - 1].1,
        }
    }
}

/// Machine-readable run summary written next to `summary.txt`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_requests: u64,
    pub deadline_misses: u64,
    pub deadline_miss_rate: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub p9999_us: f64,
    pub mean_us: f64,
    pub max_us: f64,
}

/// Per-node metrics: E2E latency, LB overhead, per-worker breakdown and miss accounting.
///
/// Histograms are single-writer (the owning pump thread); the totals are relaxed atomics so
/// progress reporting can read them from anywhere.
pub struct MetricsCollector {
    e2e_latency: LatencyHistogram,
    lb_overhead: LatencyHistogram,
    per_worker_latency: Vec<LatencyHistogram>,
    total_requests: AtomicU64,
    deadline_misses: AtomicU64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            e2e_latency: LatencyHistogram::new(),
            lb_overhead: LatencyHistogram::new(),
            per_worker_latency: (0..MAX_WORKERS).map(|_| LatencyHistogram::new()).collect(),
            total_requests: AtomicU64::new(0),
            deadline_misses: AtomicU64::new(0),
        }
    }

    /// Record a fully-traced request: E2E latency, LB overhead, per-worker latency
    /// and deadline-miss accounting in one step.
    pub fn record_request(&mut self, trace: &RequestTrace) {
        self.e2e_latency.record(trace.e2e_latency_ns());
        self.lb_overhead.record(trace.lb_overhead_ns());
        self.per_worker_latency[trace.target_worker_id as usize % MAX_WORKERS]
            .record(trace.e2e_latency_ns());
        if trace.is_deadline_miss() {
            self.deadline_misses.fetch_add(1, Ordering::Relaxed);
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bare latency sample when only the round trip is known (client side).
    pub fn record_latency(&mut self, latency_ns: u64) {
        self.e2e_latency.record(latency_ns);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadline_miss(&mut self) {
        self.deadline_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn deadline_misses(&self) -> u64 {
        self.deadline_misses.load(Ordering::Relaxed)
    }

    pub fn deadline_miss_rate(&self) -> f64 {
        let total = self.total_requests().max(1);
        self.deadline_misses() as f64 / total as f64
    }

    pub fn e2e_latency(&self) -> &LatencyHistogram {
        &self.e2e_latency
    }

    pub fn lb_overhead(&self) -> &LatencyHistogram {
        &self.lb_overhead
    }

    pub fn worker_latency(&self, worker_id: usize) -> &LatencyHistogram {
        &self.per_worker_latency[worker_id % MAX_WORKERS]
    }

    /// Clear everything; invoked at the warm-up boundary so steady-state
    /// measurement is not polluted by start-up transients.
    pub fn reset(&mut self) {
        self.e2e_latency.reset();
        self.lb_overhead.reset();
        for hist in &mut self.per_worker_latency {
            hist.reset();
        }
        self.total_requests.store(0, Ordering::Relaxed);
        self.deadline_misses.store(0, Ordering::Relaxed);
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            total_requests: self.total_requests(),
            deadline_misses: self.deadline_misses(),
            deadline_miss_rate: self.deadline_miss_rate(),
            p50_us: ns_to_us(self.e2e_latency.percentile(50.0)),
            p99_us: ns_to_us(self.e2e_latency.percentile(99.0)),
            p999_us: ns_to_us(self.e2e_latency.percentile(99.9)),
            p9999_us: ns_to_us(self.e2e_latency.percentile(99.99)),
            mean_us: self.e2e_latency.mean() / 1_000.0,
            max_us: ns_to_us(self.e2e_latency.max()),
        }
    }

    /// Write every export this node produces under `dir`.
    pub fn export_all(&self, dir: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(dir)?;
        self.e2e_latency.export_hdr(&dir.join("e2e_latency.hdr"))?;
        self.e2e_latency
            .export_csv_cdf(&dir.join("e2e_latency_cdf.csv"))?;
        self.lb_overhead.export_hdr(&dir.join("lb_overhead.hdr"))?;
        for (i, hist) in self.per_worker_latency.iter().enumerate() {
            if hist.count() > 0 {
                hist.export_csv_cdf(&dir.join(format!("worker_{i}_latency_cdf.csv")))?;
            }
        }

        let summary = self.summary();
        let mut out = BufWriter::new(File::create(dir.join("summary.txt"))?);
        writeln!(out, "Total Requests: {}", summary.total_requests)?;
        writeln!(out, "Deadline Misses: {}", summary.deadline_misses)?;
        writeln!(
            out,
            "Deadline Miss Rate: {:.4}%",
            summary.deadline_miss_rate * 100.0
        )?;
        writeln!(out, "P50 Latency (us): {:.3}", summary.p50_us)?;
        writeln!(out, "P99 Latency (us): {:.3}", summary.p99_us)?;
        writeln!(out, "P99.9 Latency (us): {:.3}", summary.p999_us)?;
        writeln!(out, "P99.99 Latency (us): {:.3}", summary.p9999_us)?;

        serde_json::to_writer_pretty(File::create(dir.join("summary.json"))?, &summary)
            .map_err(|e| Error::Export(e.to_string()))?;
        Ok(())
    }
}

/// Sliding-window requests-per-second counter.
///
/// W buckets of D nanoseconds each; a record lands in bucket `(now/D) mod W` and the bucket
/// about to be reused is zeroed whenever the current index advances, so the window never
/// counts samples older than W·D.
pub struct ThroughputCounter {
    buckets: Vec<AtomicU64>,
    last_bucket: AtomicU64,
    bucket_duration_ns: u64,
}

impl ThroughputCounter {
    pub const DEFAULT_WINDOW: usize = 10;
    pub const DEFAULT_BUCKET_NS: u64 = 100_000_000;

    pub fn new() -> Self {
        Self::with_window(Self::DEFAULT_WINDOW, Self::DEFAULT_BUCKET_NS)
    }

    pub fn with_window(buckets: usize, bucket_duration_ns: u64) -> Self {
        Self {
            buckets: (0..buckets).map(|_| AtomicU64::new(0)).collect(),
            last_bucket: AtomicU64::new(0),
            bucket_duration_ns,
        }
    }

    pub fn record(&self) {
        self.record_at(now_ns());
    }

    pub fn record_at(&self, now: Timestamp) {
        let abs_bucket = now / self.bucket_duration_ns;
        let idx = (abs_bucket % self.buckets.len() as u64) as usize;
        let last = self.last_bucket.swap(abs_bucket, Ordering::Relaxed);
        if last != abs_bucket {
            let next = (idx + 1) % self.buckets.len();
            self.buckets[next].store(0, Ordering::Relaxed);
        }
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Requests per second over the full window.
    pub fn get_rps(&self) -> f64 {
        let total: u64 = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        let window_sec =
            (self.buckets.len() as u64 * self.bucket_duration_ns) as f64 / 1_000_000_000.0;
        total as f64 / window_sec
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}
