use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

/// Request counters exposed on `/metrics` in Prometheus text format.
/// Everything is atomic so worker threads could record without locks.
pub struct Metrics {
    started: Instant,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    latency_sum_ns: AtomicU64,
    latency_min_ns: AtomicU64,
    latency_max_ns: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            started: Instant::now(),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            latency_sum_ns: AtomicU64::new(0),
            latency_min_ns: AtomicU64::new(u64::MAX),
            latency_max_ns: AtomicU64::new(0),
        }
    }

    /// Records one finished request.
    pub fn record(&self, status: u16, latency_ns: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.errors_total.fetch_add(1, Ordering::Relaxed);
        }

        self.latency_sum_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.latency_min_ns.fetch_min(latency_ns, Ordering::Relaxed);
        self.latency_max_ns.fetch_max(latency_ns, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Renders the Prometheus text exposition.
    pub fn render(&self) -> String {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let errors = self.errors_total.load(Ordering::Relaxed);
        let sum_ns = self.latency_sum_ns.load(Ordering::Relaxed);
        let min_ns = self.latency_min_ns.load(Ordering::Relaxed);
        let max_ns = self.latency_max_ns.load(Ordering::Relaxed);

        let avg_ms = match requests {
            0 => 0.0,
            n => sum_ns as f64 / n as f64 / 1e6,
        };
        let min_ms = match requests {
            0 => 0.0,
            _ => min_ns as f64 / 1e6,
        };
        let max_ms = max_ns as f64 / 1e6;

        let mut out = String::new();
        out.push_str("# HELP nano_requests_total Total HTTP requests handled.\n");
        out.push_str("# TYPE nano_requests_total counter\n");
        out.push_str(&format!("nano_requests_total {requests}\n"));
        out.push_str("# HELP nano_errors_total Requests that ended with status >= 400.\n");
        out.push_str("# TYPE nano_errors_total counter\n");
        out.push_str(&format!("nano_errors_total {errors}\n"));
        out.push_str("# HELP nano_request_latency_avg_ms Mean request latency.\n");
        out.push_str("# TYPE nano_request_latency_avg_ms gauge\n");
        out.push_str(&format!("nano_request_latency_avg_ms {avg_ms:.3}\n"));
        out.push_str("# HELP nano_request_latency_min_ms Fastest request seen.\n");
        out.push_str("# TYPE nano_request_latency_min_ms gauge\n");
        out.push_str(&format!("nano_request_latency_min_ms {min_ms:.3}\n"));
        out.push_str("# HELP nano_request_latency_max_ms Slowest request seen.\n");
        out.push_str("# TYPE nano_request_latency_max_ms gauge\n");
        out.push_str(&format!("nano_request_latency_max_ms {max_ms:.3}\n"));
        out.push_str("# HELP nano_uptime_seconds Seconds since the process started.\n");
        out.push_str("# TYPE nano_uptime_seconds gauge\n");
        out.push_str(&format!("nano_uptime_seconds {}\n", self.uptime_seconds()));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metrics_render_zeroes() {
        let metrics = Metrics::new();
        let text = metrics.render();
        assert!(text.contains("nano_requests_total 0\n"));
        assert!(text.contains("nano_errors_total 0\n"));
        assert!(text.contains("nano_request_latency_avg_ms 0.000\n"));
        assert!(text.contains("nano_request_latency_min_ms 0.000\n"));
    }

    #[test]
    fn record_tracks_errors_and_extremes() {
        let metrics = Metrics::new();
        metrics.record(200, 2_000_000);
        metrics.record(404, 6_000_000);
        metrics.record(500, 1_000_000);

        let text = metrics.render();
        assert!(text.contains("nano_requests_total 3\n"));
        assert!(text.contains("nano_errors_total 2\n"));
        assert!(text.contains("nano_request_latency_avg_ms 3.000\n"));
        assert!(text.contains("nano_request_latency_min_ms 1.000\n"));
        assert!(text.contains("nano_request_latency_max_ms 6.000\n"));
    }
}
