//! Logging initialization for vodedge.

use crate::config::ServerConfig;
use crate::error::{EdgeError, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing. `RUST_LOG` overrides the configured level; production
/// deployments emit JSON lines, everything else human-readable output.
pub fn init(config: &ServerConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.is_production() {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| EdgeError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| EdgeError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    Ok(())
}
