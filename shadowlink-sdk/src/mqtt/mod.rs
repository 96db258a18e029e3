pub mod dispatch;
pub mod session;

pub use dispatch::{InboundDispatcher, RouteHandler, TopicFilter};
pub use session::{MqttSession, ReceiveCallback, SessionConfig};
