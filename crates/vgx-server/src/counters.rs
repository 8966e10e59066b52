// src/counters.rs
use serde::Serialize;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

pub const DURATION_BUCKETS: usize = 80;
pub const HTTP_ERROR_MIN: u16 = 400;
pub const HTTP_ERROR_MAX: u16 = 527;
const HTTP_ERROR_SLOTS: usize = (HTTP_ERROR_MAX - HTTP_ERROR_MIN + 1) as usize;
const DURATION_BASE_SECS: f64 = 0.0001;

/// Histogram slot for a request duration in seconds.
///
/// Indexes by the top bits of the IEEE-754 representation: exponent plus two
/// mantissa bits, so every octave above 100 microseconds gets four buckets.
#[inline]
pub fn duration_bucket(secs: f64) -> usize {
    if !(secs > DURATION_BASE_SECS) {
        return 0;
    }
    let base = (DURATION_BASE_SECS.to_bits() >> 50) as i64;
    let bucket = (secs.to_bits() >> 50) as i64 - base;
    bucket.clamp(0, DURATION_BUCKETS as i64 - 1) as usize
}

/// Per-server response counters. Written only by the I/O thread; atomics
/// let the server handle read them while serving.
#[repr(C, align(64))]
pub struct PerfCounters {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub requests: AtomicU64,
    pub plugin_requests: AtomicU64,
    duration_ns: AtomicU64,
    histogram: [AtomicU32; DURATION_BUCKETS],
    http_errors: [AtomicU16; HTTP_ERROR_SLOTS],
    pub error_http: AtomicU64,
    pub error_service: AtomicU64,
    pub connected: AtomicUsize,
    pub total_clients: AtomicU64,
    pub rejected: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            plugin_requests: AtomicU64::new(0),
            duration_ns: AtomicU64::new(0),
            histogram: std::array::from_fn(|_| AtomicU32::new(0)),
            http_errors: std::array::from_fn(|_| AtomicU16::new(0)),
            error_http: AtomicU64::new(0),
            error_service: AtomicU64::new(0),
            connected: AtomicUsize::new(0),
            total_clients: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn add_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn add_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
        self.total_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one fully sent response.
    pub fn record_response(&self, status: u16, secs: f64, plugin: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if plugin {
            self.plugin_requests.fetch_add(1, Ordering::Relaxed);
        }
        let ns = (secs.max(0.0) * 1e9) as u64;
        self.duration_ns.fetch_add(ns, Ordering::Relaxed);
        self.histogram[duration_bucket(secs)].fetch_add(1, Ordering::Relaxed);
        self.record_status(status);
    }

    pub fn record_status(&self, status: u16) {
        if !(HTTP_ERROR_MIN..=HTTP_ERROR_MAX).contains(&status) {
            return;
        }
        if status == 503 {
            self.error_service.fetch_add(1, Ordering::Relaxed);
        } else {
            self.error_http.fetch_add(1, Ordering::Relaxed);
        }
        // Saturate at 0xffff; only the I/O thread writes
        let slot = &self.http_errors[(status - HTTP_ERROR_MIN) as usize];
        let current = slot.load(Ordering::Relaxed);
        if current < u16::MAX {
            slot.store(current + 1, Ordering::Relaxed);
        }
    }

    pub fn http_error_count(&self, status: u16) -> u16 {
        if !(HTTP_ERROR_MIN..=HTTP_ERROR_MAX).contains(&status) {
            return 0;
        }
        self.http_errors[(status - HTTP_ERROR_MIN) as usize].load(Ordering::Relaxed)
    }

    pub fn histogram(&self) -> Vec<u32> {
        self.histogram.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch pipeline counters shared by the I/O thread and executors.
#[repr(C, align(64))]
pub struct DispatchCounters {
    pub dispatched: AtomicU64,
    pub in_flight: AtomicUsize,
    pub completed: AtomicU64,
}

impl DispatchCounters {
    pub fn new() -> Self {
        Self {
            dispatched: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn inc_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[inline(always)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for DispatchCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpErrorCount {
    pub status: u16,
    pub count: u16,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub requests: u64,
    pub plugin_requests: u64,
    pub mean_duration_ms: f64,
    pub duration_histogram: Vec<u32>,
    pub http_errors: Vec<HttpErrorCount>,
    pub error_http: u64,
    pub error_service: u64,
    pub connected_clients: usize,
    pub total_clients: u64,
    pub rejected_clients: u64,
    pub dispatched: u64,
    pub in_flight: usize,
    pub completed: u64,
    pub executor_processed: Vec<u64>,
}

impl CountersSnapshot {
    pub fn capture(perf: &PerfCounters, dispatch: &DispatchCounters, executor_processed: Vec<u64>) -> Self {
        let requests = perf.requests.load(Ordering::Relaxed);
        let duration_ns = perf.duration_ns.load(Ordering::Relaxed);
        let mean_duration_ms = if requests > 0 {
            duration_ns as f64 / requests as f64 / 1e6
        } else {
            0.0
        };
        let http_errors = (HTTP_ERROR_MIN..=HTTP_ERROR_MAX)
            .filter_map(|status| {
                let count = perf.http_error_count(status);
                (count > 0).then_some(HttpErrorCount { status, count })
            })
            .collect();
        Self {
            bytes_in: perf.bytes_in.load(Ordering::Relaxed),
            bytes_out: perf.bytes_out.load(Ordering::Relaxed),
            requests,
            plugin_requests: perf.plugin_requests.load(Ordering::Relaxed),
            mean_duration_ms,
            duration_histogram: perf.histogram(),
            http_errors,
            error_http: perf.error_http.load(Ordering::Relaxed),
            error_service: perf.error_service.load(Ordering::Relaxed),
            connected_clients: perf.connected.load(Ordering::Relaxed),
            total_clients: perf.total_clients.load(Ordering::Relaxed),
            rejected_clients: perf.rejected.load(Ordering::Relaxed),
            dispatched: dispatch.dispatched.load(Ordering::Relaxed),
            in_flight: dispatch.in_flight(),
            completed: dispatch.completed.load(Ordering::Relaxed),
            executor_processed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_buckets() {
        assert_eq!(duration_bucket(0.0), 0);
        assert_eq!(duration_bucket(0.00005), 0);
        assert_eq!(duration_bucket(0.0001), 0);
        // One octave up is four buckets
        assert_eq!(duration_bucket(0.0002), 4);
        assert_eq!(duration_bucket(0.0004), 8);
        assert_eq!(duration_bucket(1e9), DURATION_BUCKETS - 1);
        assert!(duration_bucket(0.01) > duration_bucket(0.001));
    }

    #[test]
    fn test_http_error_counters() {
        let perf = PerfCounters::new();
        perf.record_response(404, 0.001, true);
        perf.record_response(503, 0.001, false);
        perf.record_response(200, 0.001, false);
        perf.record_status(399);
        perf.record_status(528);
        assert_eq!(perf.http_error_count(404), 1);
        assert_eq!(perf.http_error_count(503), 1);
        assert_eq!(perf.error_http.load(Ordering::Relaxed), 1);
        assert_eq!(perf.error_service.load(Ordering::Relaxed), 1);
        assert_eq!(perf.requests.load(Ordering::Relaxed), 3);
        assert_eq!(perf.plugin_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_http_error_counter_saturates() {
        let perf = PerfCounters::new();
        for _ in 0..70_000 {
            perf.record_status(400);
        }
        assert_eq!(perf.http_error_count(400), u16::MAX);
    }

    #[test]
    fn test_snapshot_serializes() {
        let perf = PerfCounters::new();
        let dispatch = DispatchCounters::new();
        dispatch.inc_dispatched();
        dispatch.inc_dispatched();
        dispatch.inc_completed();
        perf.record_response(500, 0.002, true);
        let snapshot = CountersSnapshot::capture(&perf, &dispatch, vec![1, 0]);
        assert_eq!(snapshot.in_flight, 1);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["dispatched"], 2);
        assert_eq!(json["http_errors"][0]["status"], 500);
        assert_eq!(json["executor_processed"][0], 1);
    }
}
