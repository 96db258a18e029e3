use clap::Parser;
use shadowlink_common::{Logger, Settings};
use shadowlink_core::BridgeOrchestrator;
use shadowlink_error::{BridgeError, BridgeResult};
use shadowlink_peer_generic::GenericProcessor;
use shadowlink_peer_google::GoogleProcessor;
use shadowlink_peer_iothub::IotHubProcessor;
use shadowlink_peer_watson::WatsonProcessor;
use shadowlink_sdk::peer::{LoggingShadowRegistry, PeerProcessor};
use std::{env::current_dir, path::PathBuf, sync::Arc};
use tracing::{info, warn, Level};

const DEFAULT_CONFIG_FILE_NAME: &str = "shadowlink.toml";

/// shadowlink - device-cloud bridge
///
/// Mediates between a device-management backend and third-party IoT
/// platforms over MQTT: maintains cloud-side device shadows, ferries
/// observations northward, and dispatches CoAP commands southward.
#[derive(Parser)]
#[command(name = "shadowlink")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "shadowlink device-cloud bridge", long_about = None)]
struct Cli {
    /// Sets a custom config file with full path
    ///
    /// If not specified, the bridge looks for 'shadowlink.toml' in the
    /// current working directory.
    #[arg(short, long, env = "SL_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> BridgeResult<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(p) => p,
        None => {
            let dir = current_dir()
                .map_err(|e| BridgeError::from(format!("Failed to get current directory: {e}")))?;
            dir.join(DEFAULT_CONFIG_FILE_NAME)
        }
    };

    let settings = Settings::new(config_path.to_string_lossy().to_string())?;

    let level = settings.log.level.parse::<Level>().unwrap_or(Level::INFO);
    let mut logger = Logger::new(level);
    logger.initialize(&settings.log.directory, &settings.log.file_name)?;

    let orchestrator = BridgeOrchestrator::new(settings.clone())?;

    let enabled = if settings.peers.enabled.is_empty() {
        warn!("no peers enabled; defaulting to the generic MQTT processor");
        vec!["generic".to_string()]
    } else {
        settings.peers.enabled.clone()
    };

    for peer in &enabled {
        let handle = orchestrator.handle();
        let processor: Arc<dyn PeerProcessor> = match peer.as_str() {
            "watson" => WatsonProcessor::new(
                &settings,
                handle,
                Arc::new(LoggingShadowRegistry::new("watson")),
            ),
            "google" => GoogleProcessor::new(
                &settings,
                handle,
                Arc::new(LoggingShadowRegistry::new("google-cloud")),
            ),
            "iothub" => IotHubProcessor::new(
                &settings,
                handle,
                Arc::new(LoggingShadowRegistry::new("iothub")),
            ),
            "generic" => GenericProcessor::new(
                &settings,
                handle,
                Arc::new(LoggingShadowRegistry::new("generic-mqtt")),
            ),
            other => {
                warn!(peer = other, "unknown peer name in config, skipping");
                continue;
            }
        };
        orchestrator.add_processor(processor).await;
    }

    orchestrator.start().await?;
    info!("bridge running; press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| BridgeError::from(format!("signal listener failed: {e}")))?;

    orchestrator.shutdown().await;
    info!("bridge stopped");
    Ok(())
}
