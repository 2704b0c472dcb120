use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use readalong_voice_lib::credentials::{
    CredentialMinter, EphemeralCredentialService, HttpCredentialMinter, OpaqueTokenMinter,
};
use readalong_voice_lib::relay::RelayServer;
use readalong_voice_lib::state::ConfigManager;
use readalong_voice_lib::utils::logging::init_logging;

/// Relay bridge and credential endpoint for ReadAlong voice sessions
#[derive(Debug, Parser)]
#[command(name = "readalong-relay", version)]
struct Cli {
    /// Config file; defaults to the platform config directory
    #[arg(long, env = "READALONG_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overriding `relay.bind`
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on, overriding `relay.port`
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => ConfigManager::default_path()?,
    };
    let mut config = ConfigManager::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    if let Some(bind) = cli.bind {
        config.relay.bind = bind;
    }
    if let Some(port) = cli.port {
        config.relay.port = port;
    }

    let minter: Arc<dyn CredentialMinter> = if config.provider.has_api_key() {
        Arc::new(
            HttpCredentialMinter::new(config.provider.clone()).with_generation(
                config.relay.temperature,
                config.relay.max_response_output_tokens,
            ),
        )
    } else {
        tracing::warn!("No provider API key configured; issuing opaque local credentials");
        Arc::new(OpaqueTokenMinter::new(config.provider.model.clone()))
    };
    let issuer = Arc::new(EphemeralCredentialService::new(minter, &config.credentials));

    let handle = RelayServer::new(config)
        .with_issuer(issuer)
        .start()
        .await
        .context("failed to start relay")?;
    info!(url = %handle.relay_url(), "Relay listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
