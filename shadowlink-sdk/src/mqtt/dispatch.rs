//! Inbound message dispatch.
//!
//! A peer session listens on a small, fixed set of topic filters: its
//! command filter, the tunneled-API filter, and (for the generic broker)
//! the draft uplink filter. The filters are parsed once when the listener
//! starts and the route table is immutable afterwards; the first matching
//! route wins. Handlers swallow their own errors so nothing can crash the
//! receive loop, and unmatched traffic is dropped with a log line.

use shadowlink_error::{BridgeError, BridgeResult};
use std::{future::Future, pin::Pin};
use tracing::warn;

/// Async route handler. Errors are the handler's own to log.
pub type RouteHandler =
    Box<dyn Fn(&str, &[u8]) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// An MQTT topic filter, parsed into levels up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    levels: Vec<FilterLevel>,
    /// `#` tail: the filter also covers every deeper level.
    open_ended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FilterLevel {
    Literal(String),
    /// `+`: exactly one level, any value.
    Any,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> BridgeResult<Self> {
        if filter.is_empty() {
            return Err(BridgeError::ConfigurationError {
                message: "empty topic filter".to_string(),
            });
        }

        let mut levels = Vec::new();
        let mut open_ended = false;
        let mut remaining = filter.split('/').peekable();
        while let Some(level) = remaining.next() {
            match level {
                "#" => {
                    if remaining.peek().is_some() {
                        return Err(BridgeError::ConfigurationError {
                            message: format!("'#' must terminate the filter: {filter}"),
                        });
                    }
                    open_ended = true;
                }
                "+" => levels.push(FilterLevel::Any),
                literal => levels.push(FilterLevel::Literal(literal.to_string())),
            }
        }

        Ok(Self { levels, open_ended })
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            let Some(topic_level) = topic_levels.next() else {
                return false;
            };
            if let FilterLevel::Literal(expected) = level {
                if expected != topic_level {
                    return false;
                }
            }
        }
        // an exact filter must consume the whole topic; an open-ended one
        // accepts any remainder
        self.open_ended || topic_levels.next().is_none()
    }
}

/// The route table a peer session dispatches inbound publishes over.
pub struct InboundDispatcher {
    routes: Vec<(TopicFilter, RouteHandler)>,
}

impl InboundDispatcher {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Add a route; earlier routes win when filters overlap.
    pub fn route(mut self, filter: TopicFilter, handler: RouteHandler) -> Self {
        self.routes.push((filter, handler));
        self
    }

    pub async fn dispatch(&self, topic: &str, payload: &[u8]) {
        for (filter, handler) in &self.routes {
            if filter.matches(topic) {
                handler(topic, payload).await;
                return;
            }
        }
        warn!(topic, "no route for inbound message, dropping");
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for InboundDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn command_filter_binds_wildcard_levels() {
        let filter = TopicFilter::parse("iot-2/type/+/id/+/cmd/+/fmt/json").unwrap();
        assert!(filter.matches("iot-2/type/light/id/d1/cmd/GET/fmt/json"));
        assert!(filter.matches("iot-2/type/light/id/d1/cmd/api/fmt/json"));
        assert!(!filter.matches("iot-2/type/light/id/d1/evt/notify/fmt/json"));
        assert!(!filter.matches("iot-2/type/light/id/d1/cmd/GET/fmt/json/extra"));
    }

    #[test]
    fn exact_filter_requires_full_consumption() {
        let filter = TopicFilter::parse("lwm2m/api").unwrap();
        assert!(filter.matches("lwm2m/api"));
        assert!(!filter.matches("lwm2m/api/extra"));
        assert!(!filter.matches("lwm2m"));
    }

    #[test]
    fn open_ended_filter_covers_parent_and_children() {
        let filter = TopicFilter::parse("lwm2m/request/domain/#").unwrap();
        assert!(filter.matches("lwm2m/request/domain"));
        assert!(filter.matches("lwm2m/request/domain/d1"));
        assert!(filter.matches("lwm2m/request/domain/d1/deep/er"));
        assert!(!filter.matches("lwm2m/response/domain/d1"));
    }

    #[test]
    fn draft_uplink_filter() {
        let filter = TopicFilter::parse("tenant1/lwm2m/rd/+/uplink").unwrap();
        assert!(filter.matches("tenant1/lwm2m/rd/d1/uplink"));
        assert!(!filter.matches("tenant1/lwm2m/rd/d1/downlink"));
        assert!(!filter.matches("tenant2/lwm2m/rd/d1/uplink"));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("devices/#/config").is_err());
        assert!(TopicFilter::parse("#").unwrap().matches("any/topic/at/all"));
    }

    fn counting_handler(hits: Arc<AtomicUsize>) -> RouteHandler {
        Box::new(move |_topic, _payload| {
            let hits = Arc::clone(&hits);
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let api_hits = Arc::new(AtomicUsize::new(0));
        let request_hits = Arc::new(AtomicUsize::new(0));

        let dispatcher = InboundDispatcher::new()
            .route(
                TopicFilter::parse("lwm2m/api").unwrap(),
                counting_handler(Arc::clone(&api_hits)),
            )
            .route(
                TopicFilter::parse("lwm2m/#").unwrap(),
                counting_handler(Arc::clone(&request_hits)),
            );
        assert_eq!(dispatcher.len(), 2);

        dispatcher.dispatch("lwm2m/api", b"{}").await;
        assert_eq!(api_hits.load(Ordering::SeqCst), 1);
        assert_eq!(request_hits.load(Ordering::SeqCst), 0);

        dispatcher.dispatch("lwm2m/request/domain/d1", b"{}").await;
        assert_eq!(request_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmatched_traffic_is_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let dispatcher = InboundDispatcher::new().route(
            TopicFilter::parse("devices/+/config").unwrap(),
            counting_handler(Arc::clone(&hits)),
        );

        dispatcher.dispatch("some/other/topic", b"x").await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
