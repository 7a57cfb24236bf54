use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

/// Global runtime metrics for the sensor link.
///
/// Purpose:
/// - Track connection churn (connects / reconnects)
/// - Track throughput (frames received / readings dispatched)
/// - Track faults (parse errors / panicking subscribers)
///
/// Design:
/// - Lock-free (Atomics)
/// - Cheap to update from the driver task and from dispatch
#[derive(Default)]
pub struct RuntimeMetrics {
    // WebSocket level
    pub ws_connections_active: AtomicUsize,
    pub ws_connects: AtomicUsize,
    pub ws_reconnects: AtomicUsize,

    // Throughput
    pub frames_received: AtomicUsize,
    pub readings_dispatched: AtomicUsize,

    /// Unix ms of the last delivered reading (0 = none yet)
    pub last_reading_ms: AtomicI64,

    // Faults
    pub parse_errors: AtomicUsize,
    pub subscriber_faults: AtomicUsize,

    // Registry
    pub subscribers_active: AtomicUsize,
}

impl RuntimeMetrics {
    /// One-line summary used by the periodic reporter.
    ///
    /// `now_ms` is used to report the age of the last reading.
    pub fn summary(&self, now_ms: i64) -> String {
        let last = self.last_reading_ms.load(Ordering::Relaxed);
        let age = if last == 0 {
            "-".to_string()
        } else {
            format!("{}ms", (now_ms - last).max(0))
        };

        format!(
            "ws={} connects={} reconnects={} frames={} dispatched={} last={} parse_err={} sub_fault={} subs={}",
            self.ws_connections_active.load(Ordering::Relaxed),
            self.ws_connects.load(Ordering::Relaxed),
            self.ws_reconnects.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.readings_dispatched.load(Ordering::Relaxed),
            age,
            self.parse_errors.load(Ordering::Relaxed),
            self.subscriber_faults.load(Ordering::Relaxed),
            self.subscribers_active.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
