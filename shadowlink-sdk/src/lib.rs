pub mod envelope;
pub mod mqtt;
pub mod peer;
pub mod retry;
pub mod topics;
pub mod value;

pub use envelope::{ApiRequest, ApiResponse, CoapCommand, CoapVerb};
pub use peer::{
    ConnectionCreator, LoggingShadowRegistry, OrchestratorApi, OrchestratorHandle, PeerProcessor,
    ShadowRegistry,
};
pub use retry::ReconnectSchedule;
pub use topics::{customize_topic, EndpointTopicData};
