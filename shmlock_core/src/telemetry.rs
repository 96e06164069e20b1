//! Minimal run‑time metrics sink.
//!
//! No exporter is bundled; a host process registers a raw callback that
//! receives name/value pairs. Until a callback is registered no recorder is
//! installed and the `metrics` macros are no-ops, so a Rust host remains free
//! to install its own recorder instead.

use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Signature for external collectors. `name` is NUL-terminated and only
/// valid for the duration of the call.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

/// Register a callback from C/other languages. Only the first registration
/// takes effect.
///
/// # Safety
/// `cb` must stay callable for the rest of the process and be safe to call
/// from any thread.
#[no_mangle]
pub unsafe extern "C" fn shmlock_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
    init();
}

fn forward(name: &CString, value: u64) {
    if let Some(cb) = CALLBACK.get() {
        // SAFETY: contract of `shmlock_register_stats_callback`.
        unsafe { cb(name.as_ptr(), value as c_ulonglong) };
    }
}

fn c_name(key: &Key) -> CString {
    // Metric names are static literals in this crate; a stray NUL is dropped.
    CString::new(key.name().replace('\0', "")).unwrap_or_default()
}

/// Forwarding recorder. Uses the callback **if** it was registered.
///
/// The `metrics` macros register on every call, so handles are cached per
/// key to keep running totals.
#[derive(Default)]
struct FfiRecorder {
    counters: DashMap<Key, Arc<FfiCounter>>,
    gauges: DashMap<Key, Arc<FfiGauge>>,
}

struct FfiCounter {
    name: CString,
    total: AtomicU64,
}

/// Gauges are reported as absolute values, so the current value is kept here
/// as `f64` bits.
struct FfiGauge {
    name: CString,
    bits: AtomicU64,
}

struct FfiHistogram {
    name: CString,
}

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let counter = self
            .counters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FfiCounter { name: c_name(key), total: AtomicU64::new(0) }));
        Counter::from_arc(Arc::clone(&counter))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let gauge = self.gauges.entry(key.clone()).or_insert_with(|| {
            Arc::new(FfiGauge { name: c_name(key), bits: AtomicU64::new(0f64.to_bits()) })
        });
        Gauge::from_arc(Arc::clone(&gauge))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(FfiHistogram { name: c_name(key) }))
    }
}

impl metrics::CounterFn for FfiCounter {
    fn increment(&self, value: u64) {
        let total = self.total.fetch_add(value, Ordering::Relaxed).wrapping_add(value);
        forward(&self.name, total);
    }
    fn absolute(&self, value: u64) {
        self.total.store(value, Ordering::Relaxed);
        forward(&self.name, value);
    }
}

impl FfiGauge {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut cur = self.bits.load(Ordering::Relaxed);
        loop {
            let next = f(f64::from_bits(cur));
            match self.bits.compare_exchange_weak(cur, next.to_bits(), Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return forward(&self.name, next.max(0.0) as u64),
                Err(actual) => cur = actual,
            }
        }
    }
}

impl metrics::GaugeFn for FfiGauge {
    fn set(&self, value: f64) {
        self.update(|_| value);
    }
    fn increment(&self, value: f64) {
        self.update(|cur| cur + value);
    }
    fn decrement(&self, value: f64) {
        self.update(|cur| cur - value);
    }
}

impl metrics::HistogramFn for FfiHistogram {
    fn record(&self, value: f64) {
        forward(&self.name, value.max(0.0) as u64);
    }
}

/// Install the forwarding recorder exactly **once**. Fails silently if the
/// host already installed a recorder.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if metrics::set_global_recorder(FfiRecorder::default()).is_err() {
            log::debug!("Global metrics recorder already installed; stats callback unused");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::sync::Mutex;

    static SEEN: Mutex<Vec<(String, u64)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn collect(name: *const c_char, value: c_ulonglong) {
        let name = CStr::from_ptr(name).to_string_lossy().into_owned();
        SEEN.lock().unwrap().push((name, value));
    }

    #[test]
    fn callback_receives_running_values() {
        unsafe { shmlock_register_stats_callback(collect) };
        metrics::counter!("shmlock_test_counter").increment(2);
        metrics::counter!("shmlock_test_counter").increment(3);
        metrics::gauge!("shmlock_test_gauge").set(40.0);
        metrics::gauge!("shmlock_test_gauge").decrement(8.0);

        let seen = SEEN.lock().unwrap();
        let counter: Vec<u64> =
            seen.iter().filter(|(n, _)| n == "shmlock_test_counter").map(|(_, v)| *v).collect();
        let gauge: Vec<u64> =
            seen.iter().filter(|(n, _)| n == "shmlock_test_gauge").map(|(_, v)| *v).collect();
        assert_eq!(counter, vec![2, 5]);
        assert_eq!(gauge, vec![40, 32]);
    }
}
