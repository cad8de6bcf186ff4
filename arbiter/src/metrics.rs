//! Telemetry for the arbitration cycle: a point-in-time waiting-collection size
//! gauge and monotonic admitted/aborted/requeued counters, structured the way
//! the teacher's `BrupopControllerMetrics` wires up `opentelemetry` gauges.
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::Key;
use std::sync::{Arc, Mutex};
use tracing::instrument;

const REASON_KEY: Key = Key::from_static_str("reason");

#[derive(Debug)]
pub struct ArbiterMetrics {
    waiting_size: Arc<Mutex<u64>>,
    admitted: Counter<u64>,
    aborted: Counter<u64>,
    requeued: Counter<u64>,
}

impl ArbiterMetrics {
    #[instrument]
    pub fn new(meter: Meter) -> Self {
        let waiting_size = Arc::new(Mutex::new(0u64));
        let waiting_size_for_callback = Arc::clone(&waiting_size);

        let waiting_size_observer = meter
            .u64_observable_gauge("arbiter_waiting_collection_size")
            .with_description("Number of migration jobs currently in the waiting collection")
            .init();

        let _ = meter.register_callback(&[waiting_size_observer.as_any()], move |cx| {
            let size = *waiting_size_for_callback.lock().unwrap();
            cx.observe_u64(&waiting_size_observer, size, &[]);
        });

        let admitted = meter
            .u64_counter("arbiter_admitted_total")
            .with_description("Migration jobs that passed arbitration and were enqueued")
            .init();
        let aborted = meter
            .u64_counter("arbiter_aborted_total")
            .with_description("Migration jobs aborted by a non-retryable filter")
            .init();
        let requeued = meter
            .u64_counter("arbiter_requeued_total")
            .with_description("Migration jobs left in the waiting collection by a retryable filter")
            .init();

        ArbiterMetrics {
            waiting_size,
            admitted,
            aborted,
            requeued,
        }
    }

    /// Updates the waiting-collection gauge to reflect the size observed at the
    /// start of the most recent cycle snapshot.
    pub fn set_waiting_size(&self, size: usize) {
        *self.waiting_size.lock().unwrap() = size as u64;
    }

    pub fn record_admitted(&self) {
        self.admitted.add(1, &[]);
    }

    pub fn record_aborted(&self, reason: &str) {
        self.aborted.add(1, &[REASON_KEY.string(reason.to_string())]);
    }

    pub fn record_requeued(&self) {
        self.requeued.add(1, &[]);
    }
}
