//! Long-poll backend reader: the sole arrival path for device events.
//!
//! A single task blocks on a persistent GET against the backend
//! notification channel and dispatches every non-empty body. The loop does
//! not exit on non-fatal status codes and applies no pacing between
//! successful iterations; the persistent GET itself blocks server-side.

use shadowlink_error::BridgeResult;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a poll iteration's HTTP status is handled.
#[derive(Debug, PartialEq, Eq)]
pub enum PollDisposition {
    /// 400: the API key already has a callback webhook configured.
    AlreadyWebhook,
    /// 401: the key is not authorized.
    Unauthorized,
    /// 410: the pull channel is dead; the operator must replace the key.
    ChannelDead,
    /// Anything else: dispatch the body if there is one.
    Dispatch,
}

pub fn classify_poll_status(status: u16) -> PollDisposition {
    match status {
        400 => PollDisposition::AlreadyWebhook,
        401 => PollDisposition::Unauthorized,
        410 => PollDisposition::ChannelDead,
        _ => PollDisposition::Dispatch,
    }
}

pub struct LongPollProcessor {
    http: reqwest::Client,
    url: String,
    api_key: String,
    events_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    transport_error_pause: Duration,
}

impl LongPollProcessor {
    pub fn new(
        url: String,
        api_key: String,
        events_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| shadowlink_error::BridgeError::HttpError {
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            url,
            api_key,
            events_tx,
            cancel,
            transport_error_pause: Duration::from_secs(5),
        })
    }

    /// Spawn the polling loop.
    pub fn start(self) {
        tokio::spawn(async move {
            info!(url = %self.url, "beginning long polling");
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("long poll cancelled");
                        break;
                    }
                    _ = self.poll() => {}
                }
            }
        });
    }

    async fn poll(&self) {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(&self.api_key)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "long poll transport error");
                tokio::time::sleep(self.transport_error_pause).await;
                return;
            }
        };

        let status = response.status().as_u16();
        match classify_poll_status(status) {
            PollDisposition::AlreadyWebhook => {
                warn!("poll: API key already has a callback webhook configured; use another key");
            }
            PollDisposition::Unauthorized => {
                warn!("poll: API key does not appear to be valid (401 - Unauthorized); check the key");
            }
            PollDisposition::ChannelDead => {
                error!("poll: status 410 seen; the pull channel is dead, create and use another API key");
            }
            PollDisposition::Dispatch => {
                let body = response.text().await.unwrap_or_default();
                if body.is_empty() {
                    debug!("poll: nothing to process");
                } else {
                    debug!(len = body.len(), "poll: dispatching backend message");
                    if self.events_tx.send(body).await.is_err() {
                        warn!("poll: event channel closed, stopping");
                        self.cancel.cancel();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_taxonomy() {
        assert_eq!(classify_poll_status(400), PollDisposition::AlreadyWebhook);
        assert_eq!(classify_poll_status(401), PollDisposition::Unauthorized);
        assert_eq!(classify_poll_status(410), PollDisposition::ChannelDead);
        assert_eq!(classify_poll_status(200), PollDisposition::Dispatch);
        assert_eq!(classify_poll_status(204), PollDisposition::Dispatch);
        assert_eq!(classify_poll_status(500), PollDisposition::Dispatch);
    }

    #[test]
    fn channel_dead_is_not_fatal_to_the_loop() {
        // 410 is a critical log, not a loop exit; verified structurally by
        // classify_poll_status returning a value the loop never breaks on.
        let disposition = classify_poll_status(410);
        assert_ne!(disposition, PollDisposition::Dispatch);
    }
}
