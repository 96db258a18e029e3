//! Per-device credential refresh scheduling.
//!
//! One cancellable timer per device shadow re-mints the short-lived JWT
//! well before its expiry and rebuilds the device's MQTT session without
//! losing its subscriptions. The refresh interval must leave at least an
//! hour of slack against the token expiration.

use crate::processor::GoogleProcessor;
use std::{sync::Weak, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Clamp the refresh interval so the token never runs closer than an hour
/// to its expiry.
pub fn effective_refresh_interval(refresh_interval_secs: u64, expiration_secs: u64) -> Duration {
    let slack_limit = expiration_secs.saturating_sub(60 * 60).max(1);
    Duration::from_secs(refresh_interval_secs.clamp(1, slack_limit))
}

/// Spawn the refresh timer for one endpoint. The task exits when cancelled
/// or when the processor is gone.
pub fn start_refresher(
    processor: Weak<GoogleProcessor>,
    ep_name: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        info!(ep = %ep_name, interval_secs = interval.as_secs(), "JWT refresher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(ep = %ep_name, "JWT refresher cancelled");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    let Some(processor) = processor.upgrade() else {
                        break;
                    };
                    processor.refresh_jwt_for_endpoint(&ep_name).await;
                }
            }
        }
        info!(ep = %ep_name, "JWT refresher stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_interval_keeps_an_hour_of_slack() {
        // 5h refresh against a 23h token: unchanged
        assert_eq!(
            effective_refresh_interval(5 * 3600, 23 * 3600),
            Duration::from_secs(5 * 3600)
        );
        // refresh interval beyond (expiry - 1h) is clamped down
        assert_eq!(
            effective_refresh_interval(23 * 3600, 23 * 3600),
            Duration::from_secs(22 * 3600)
        );
    }
}
