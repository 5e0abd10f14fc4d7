//! Clock synchronization against the venue's server time.
//!
//! Every signed request embeds `timestamp = local_time + offset`. The offset
//! is a single process-wide atomic; writers are the periodic resync task and
//! the TIMESTAMP_SKEW retry path in the REST broker.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Shared handle to the signed clock offset (venue time minus local time).
#[derive(Clone, Default)]
pub struct ClockHandle {
    offset_ms: Arc<AtomicI64>,
}

impl ClockHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local wall clock in milliseconds.
    pub fn local_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Venue-aligned timestamp for signed requests.
    pub fn venue_now_ms(&self) -> i64 {
        self.local_ms() + self.offset_ms.load(Ordering::Acquire)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Record a fresh observation of the venue's server time.
    pub fn observe_server_time(&self, server_time_ms: i64) {
        let offset = server_time_ms - self.local_ms();
        let previous = self.offset_ms.swap(offset, Ordering::Release);
        if (offset - previous).abs() > 1_000 {
            warn!(
                "🕒 clock offset jumped {previous}ms → {offset}ms; check local clock drift"
            );
        } else {
            debug!("🕒 clock offset {offset}ms");
        }
    }
}

/// Periodic resync loop. `fetch` returns the venue's current server time;
/// failures are logged and retried on the next tick.
pub async fn run_resync_loop<F, Fut>(clock: ClockHandle, interval: Duration, fetch: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = crate::error::VenueResult<i64>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match fetch().await {
            Ok(server_ms) => clock.observe_server_time(server_ms),
            Err(e) => warn!("🕒 clock resync failed: {e}"),
        }
    }
}
