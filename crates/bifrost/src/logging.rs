//! Logging system setup.
//!
//! `RUST_LOG` overrides the configured level when set, e.g.
//! `RUST_LOG=proxy_server::bridge=debug`.

use crate::config::LoggingSettings;
use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if settings.json_format {
        registry
            .with(fmt::layer().json().with_target(false).with_thread_names(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_names(true))
            .try_init()
    };
    installed.map_err(|e| anyhow!("cannot initialize logging: {}", e))?;

    info!("🔧 Logging initialized with level: {}", settings.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_installs_once() {
        let settings = LoggingSettings {
            level: "debug".to_string(),
            json_format: true,
        };

        assert!(setup_logging(&settings).is_ok());
        assert!(setup_logging(&LoggingSettings::default()).is_err());
    }
}
