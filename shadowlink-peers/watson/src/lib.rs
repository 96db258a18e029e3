pub mod config;
pub mod processor;
pub mod topics;

pub use config::WatsonConfig;
pub use processor::WatsonProcessor;
