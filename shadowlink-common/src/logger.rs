//! Logging bootstrap: stdout plus a daily-rolling file, both gated by one
//! runtime-adjustable level switch.

use shadowlink_error::{BridgeError, BridgeResult};
use std::sync::{Arc, Mutex};
use tracing::{subscriber::set_global_default, Level, Metadata};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{filter::filter_fn, fmt, layer::SubscriberExt, Layer, Registry};

pub struct Logger {
    level: Arc<Mutex<Level>>,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(level: Level) -> Self {
        Self {
            level: Arc::new(Mutex::new(level)),
            _file_guard: None,
        }
    }

    #[inline]
    pub fn set_level(&self, new_level: Level) {
        *self.level.lock().unwrap() = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap()
    }

    /// Both output layers share this switch, so `set_level` takes effect
    /// everywhere at once.
    fn level_switch(&self) -> impl Fn(&Metadata<'_>) -> bool + Clone {
        let level = Arc::clone(&self.level);
        move |metadata| metadata.level() <= &*level.lock().unwrap()
    }

    /// Install the global subscriber: stdout plus a non-blocking daily
    /// rolling file named `file_name` under `directory`.
    pub fn initialize(&mut self, directory: &str, file_name: &str) -> BridgeResult<()> {
        let (file_writer, guard) =
            tracing_appender::non_blocking(rolling::daily(directory, file_name));
        self._file_guard = Some(guard);

        let switch = self.level_switch();
        let console_layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(filter_fn(switch.clone()));
        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(filter_fn(switch));

        set_global_default(Registry::default().with(console_layer).with(file_layer)).map_err(
            |_| BridgeError::ConfigurationError {
                message: "global logger already installed".to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_switch_is_shared() {
        let logger = Logger::new(Level::INFO);
        assert_eq!(logger.get_level(), Level::INFO);

        logger.set_level(Level::DEBUG);
        assert_eq!(logger.get_level(), Level::DEBUG);
    }
}
