//! Binary entrypoint for the advisor gateway.
use advisor_api::config::GatewayConfig;
use advisor_api::run;
use anyhow::Context;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::load().context("failed to load gateway configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run(config).await.context("gateway server failed")
}
