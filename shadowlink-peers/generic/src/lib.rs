pub mod config;
pub mod draft;
pub mod processor;

pub use config::GenericConfig;
pub use processor::GenericProcessor;
