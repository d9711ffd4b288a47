use anyhow::Result;
use clap::Parser;
use iparty_relay::{
    cli::{self, Cli, Commands},
    config::RelayConfig,
    server,
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::EchoHost { relay, host_id }) = cli.command {
        let _telemetry = Telemetry::init_client()?;
        return cli::run_echo_host(relay, host_id).await;
    }

    let telemetry = Telemetry::init_server()?;
    let config = RelayConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        max_body_bytes = config.max_body_bytes,
        "starting iparty-relay"
    );

    server::run(config, telemetry.metrics_handle()).await
}
