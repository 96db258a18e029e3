pub mod async_responses;
pub mod endpoints;
pub mod longpoll;
pub mod orchestrator;
pub mod processor;
pub mod subscriptions;

pub use async_responses::{AsyncRecord, AsyncResponseCorrelator};
pub use endpoints::EndpointRegistry;
pub use longpoll::LongPollProcessor;
pub use orchestrator::BridgeOrchestrator;
pub use processor::{CommandOutcome, InboundCommand, PeerCore};
pub use subscriptions::SubscriptionManager;
