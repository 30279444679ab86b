//! Relay core process entrypoint
//!
//! Reads configuration from the environment, builds the composition root,
//! and serves the WebSocket transport.

use relay_core::config::RelayConfig;
use relay_core::context::AppContext;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = RelayConfig::from_env();
    let voices_dir = std::env::var("RELAY_VOICES_DIR").unwrap_or_else(|_| "./voices".to_string());
    let addr = std::env::var("RELAY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    info!(?config, %voices_dir, %addr, "starting relay core");

    let ctx = AppContext::new(config, voices_dir);
    let _background = ctx.spawn_background_tasks();

    relay_core::transport::serve(&addr, ctx.coordinator.clone()).await
}
