//! Time as `f64` seconds.
//!
//! All deadline arithmetic in the runtime is done on plain `f64` seconds:
//! wall-clock for anything that lands in the shared-memory arena (readers
//! must be able to correlate), monotonic where only intervals matter.
//! Values are never NaN.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock time in seconds since the UNIX epoch.
#[inline]
pub fn real_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Monotonic time in seconds since an arbitrary process-local anchor.
#[inline]
pub fn mono_now() -> f64 {
    use std::sync::OnceLock;
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Sleep for `seconds`; negative or NaN values return immediately.
pub fn sleep(seconds: f64) {
    if seconds.is_finite() && seconds > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    }
}

/// Convert a deadline delta to a `Duration`, clamping negatives to zero.
#[inline]
pub fn duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}
