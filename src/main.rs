//! vodedge - Main entry point.

use vodedge::config::EdgeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EdgeConfig::from_env()?;
    vodedge::observability::init(&config.server)?;

    vodedge::run(config).await?;
    Ok(())
}
