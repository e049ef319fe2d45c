//! Network Guardian - Main Entry Point

use guardian_service::config::GuardianConfig;
use guardian_service::Guardian;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Network Guardian v{}", env!("CARGO_PKG_VERSION"));

    let config = GuardianConfig::from_env();
    let guardian = Guardian::new(config);
    guardian.run().await?;

    Ok(())
}
