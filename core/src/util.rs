use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

/// Make a Notify that is signalled when SIGINT occurs.
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("Keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });

    notify
}

/// Default exponential back-off schedule for request retries:
/// 200ms → 400ms → 800ms → 1600ms, with ±20% jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt.saturating_sub(1)).min(16));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}

/// Seconds since the Unix epoch as a float, the timestamp format used
/// throughout the telemetry log.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A short run identifier, unique enough for pairing telemetry events.
pub fn short_run_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    id[..8].to_string()
}
