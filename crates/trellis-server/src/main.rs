//! The `trellis` binary.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from the first argument, `TRELLIS_CONFIG`, or
//!    `trellis.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Start the subscription engine and the realtime server
//! 4. Mount the demo application
//! 5. Serve until `Ctrl-C`

mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use trellis_core::Environment;
use trellis_core::config::{EnvironmentConfig, LogFormat, LoggingConfig};
use trellis_data::Subscribers;
use trellis_realtime::RealtimeServer;

const DEFAULT_CONFIG: &str = "trellis.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    init_logging(&config.logging);
    info!(
        host = %config.server.host,
        port = config.server.port,
        realtime = config.realtime.enabled,
        "Configuration loaded"
    );

    let subscribers = Arc::new(Subscribers::from_config(&config.data.subscriptions).await?);
    let realtime = RealtimeServer::from_config(&config.realtime).await?;

    let builder = Environment::builder(config);
    let server_config = builder.config().server.clone();
    let app = demo::application(&builder, subscribers, realtime)?;
    let env = Arc::new(builder.mount(app)?.build());

    trellis_server::start_server(&server_config, env).await?;
    info!("trellis stopped");
    Ok(())
}

fn load_config() -> anyhow::Result<EnvironmentConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TRELLIS_CONFIG").ok())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);

    if path.exists() {
        Ok(EnvironmentConfig::from_file(&path)?)
    } else {
        let mut config = EnvironmentConfig::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match config.format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}
