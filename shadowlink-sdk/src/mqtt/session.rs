//! MQTT session wrapper: one client, one receive task.
//!
//! Every session owns a spawned receive loop that polls the event loop,
//! delivers publishes to an async callback in arrival order, and re-issues
//! the full tracked subscription set on every ConnAck. Reconnection after
//! a transport error is driven by continuing to poll, paced by
//! `reconnect_pause`; cancellation closes the transport.

use arc_swap::ArcSwapOption;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use shadowlink_error::{BridgeError, BridgeResult};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Async callback invoked for every inbound publish. The callback must not
/// panic; errors are its own to log.
pub type ReceiveCallback =
    Arc<dyn Fn(String, Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connack_timeout: Duration,
    pub reconnect_pause: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connack_timeout: Duration::from_secs(30),
            reconnect_pause: Duration::from_secs(15),
        }
    }
}

/// Tracked subscription set; re-issued after every reconnect so a broker
/// that drops session state cannot silently lose subscriptions.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionLedger {
    entries: Mutex<Vec<(String, QoS)>>,
}

impl SubscriptionLedger {
    pub fn track(&self, topic: &str, qos: QoS) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(t, _)| t != topic);
        entries.push((topic.to_string(), qos));
    }

    pub fn untrack(&self, topic: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(t, _)| t != topic);
    }

    pub fn snapshot(&self) -> Vec<(String, QoS)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }
}

pub struct MqttSession {
    client: ArcSwapOption<AsyncClient>,
    healthy: AtomicBool,
    cancel: CancellationToken,
    subscriptions: Arc<SubscriptionLedger>,
    client_id: String,
}

impl MqttSession {
    /// Create the client, start the receive task, and wait for the first
    /// ConnAck. Fails with `Timeout` when the broker does not acknowledge
    /// within `config.connack_timeout`.
    pub async fn connect(
        options: MqttOptions,
        config: SessionConfig,
        callback: ReceiveCallback,
    ) -> BridgeResult<Arc<Self>> {
        let client_id = options.client_id();
        let (client, mut event_loop) = AsyncClient::new(options, 100);

        let session = Arc::new(Self {
            client: ArcSwapOption::from(Some(Arc::new(client.clone()))),
            healthy: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            subscriptions: Arc::new(SubscriptionLedger::default()),
            client_id: client_id.clone(),
        });

        let (ready_tx, mut ready_rx) = watch::channel(false);

        let task_session = Arc::clone(&session);
        let cancel = session.cancel.clone();
        let reconnect_pause = config.reconnect_pause;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(client_id = %task_session.client_id, "receive loop cancelled");
                        task_session.healthy.store(false, Ordering::Release);
                        let _ = client.disconnect().await;
                        break;
                    }
                    result = event_loop.poll() => {
                        match result {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                info!(client_id = %task_session.client_id, "MQTT connection established");
                                task_session.healthy.store(true, Ordering::Release);
                                let _ = ready_tx.send(true);

                                // Restore the tracked subscription set; the
                                // broker may have dropped session state.
                                for (topic, qos) in task_session.subscriptions.snapshot() {
                                    if let Err(e) = client.subscribe(&topic, qos).await {
                                        warn!(topic = %topic, error = %e, "re-subscribe failed");
                                    } else {
                                        debug!(topic = %topic, "re-subscribed");
                                    }
                                }
                            }
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                // Awaited inline: messages published from a
                                // single callback keep their call order.
                                callback(publish.topic.clone(), publish.payload.to_vec()).await;
                            }
                            Ok(Event::Incoming(Packet::Disconnect)) => {
                                info!(client_id = %task_session.client_id, "MQTT server sent disconnect");
                                task_session.healthy.store(false, Ordering::Release);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                task_session.healthy.store(false, Ordering::Release);
                                if cancel.is_cancelled() {
                                    break;
                                }
                                warn!(client_id = %task_session.client_id, error = %e, "MQTT event loop error, reconnecting");
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(reconnect_pause) => {}
                                }
                            }
                        }
                    }
                }
            }
            debug!(client_id = %task_session.client_id, "receive loop terminated");
        });

        match tokio::time::timeout(config.connack_timeout, ready_rx.changed()).await {
            Ok(Ok(())) => Ok(session),
            _ => {
                session.disconnect().await;
                Err(BridgeError::Timeout {
                    operation: "MQTT connect".to_string(),
                    timeout_ms: config.connack_timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Subscribe and remember the topic for refresh-time re-subscription.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> BridgeResult<()> {
        let client = self.client.load_full().ok_or(BridgeError::NotConnected)?;
        self.subscriptions.track(topic, qos);
        client
            .subscribe(topic, qos)
            .await
            .map_err(|e| BridgeError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn subscribe_many(&self, topics: &[(String, QoS)]) -> BridgeResult<()> {
        for (topic, qos) in topics {
            self.subscribe(topic, *qos).await?;
        }
        Ok(())
    }

    /// Unsubscribe a list of topic strings; unknown topics are ignored.
    pub async fn unsubscribe_many(&self, topics: &[String]) -> BridgeResult<()> {
        let client = self.client.load_full().ok_or(BridgeError::NotConnected)?;
        for topic in topics {
            self.subscriptions.untrack(topic);
            if let Err(e) = client.unsubscribe(topic).await {
                warn!(topic = %topic, error = %e, "unsubscribe failed");
            }
        }
        Ok(())
    }

    /// The currently tracked subscription topic strings.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscriptions.topics()
    }

    /// Publish a message; a failure is reported, not retried.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> BridgeResult<()> {
        let client = self.client.load_full().ok_or(BridgeError::NotConnected)?;
        client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| BridgeError::MqttError {
                reason: format!("publish to '{}' failed: {}", topic, e),
            })
    }

    /// Stop the receive task and force-close the transport. Safe to call
    /// more than once.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        self.healthy.store(false, Ordering::Release);
        if let Some(client) = self.client.swap(None) {
            let _ = client.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_deduplicates_by_topic() {
        let ledger = SubscriptionLedger::default();
        ledger.track("a/b", QoS::AtMostOnce);
        ledger.track("a/b", QoS::AtLeastOnce);
        ledger.track("c/d", QoS::AtLeastOnce);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "a/b");
        assert_eq!(snapshot[0].1, QoS::AtLeastOnce);
    }

    #[test]
    fn ledger_untrack_removes() {
        let ledger = SubscriptionLedger::default();
        ledger.track("a/b", QoS::AtLeastOnce);
        ledger.track("c/d", QoS::AtLeastOnce);
        ledger.untrack("a/b");
        assert_eq!(ledger.topics(), vec!["c/d"]);
        ledger.untrack("not-there");
        assert_eq!(ledger.topics(), vec!["c/d"]);
    }
}
