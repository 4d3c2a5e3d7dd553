#[cfg(feature = "azure-ai")]
pub mod azure_ai;

#[cfg(feature = "qdrant")]
pub mod qdrant;

#[cfg(feature = "redis")]
pub mod redis;

use crate::config::{EngineKind, ExperimentConfig};
use crate::engine::EngineClients;
use crate::error::{Error, Result};

/// Construct the adapters for an experiment's engine
pub fn build(config: &ExperimentConfig) -> Result<EngineClients> {
    match config.engine {
        #[cfg(feature = "redis")]
        EngineKind::Redis => self::redis::clients(config),

        #[cfg(feature = "azure-ai")]
        EngineKind::AzureAi => self::azure_ai::clients(config),

        #[cfg(feature = "qdrant")]
        EngineKind::Qdrant => self::qdrant::clients(config),

        #[allow(unreachable_patterns)]
        other => Err(Error::Config(format!(
            "Engine '{}' is not enabled in this build",
            other
        ))),
    }
}

/// Read an optional port override from the environment
#[allow(dead_code)]
fn port_from(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u16) -> Result<u16> {
    match lookup(key) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::Config(format!("{} must be a port number, got '{}'", key, value))),
        None => Ok(default),
    }
}
