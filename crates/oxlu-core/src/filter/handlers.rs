//! Configuration record handlers of the filter device.
//!
//! Handlers are tried in order. The first one that handles a record ends the
//! walk; a record every handler passes on goes to the storage device.

use std::time::Duration;
use tracing::{debug, info};

use super::FilterDevice;
use crate::config::{ConfigRecord, SecurityRuleSet};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    Handled,
    Forward,
}

pub(crate) trait ConfigHandler: Sync {
    fn handle(
        &self,
        dev: &FilterDevice,
        record: &ConfigRecord,
    ) -> Result<HandlerOutcome, ConfigError>;
}

pub(crate) const CONFIG_HANDLERS: &[&dyn ConfigHandler] = &[&ParamHandler, &SecurityHandler];

/// Tunables of the filter device.
struct ParamHandler;

impl ParamHandler {
    fn invalid(key: &str, value: &str) -> ConfigError {
        ConfigError::InvalidParam {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn positive(key: &str, value: &str) -> Result<u64, ConfigError> {
        value
            .parse::<u64>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| Self::invalid(key, value))
    }

    fn flag(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(Self::invalid(key, value)),
        }
    }
}

impl ConfigHandler for ParamHandler {
    fn handle(
        &self,
        dev: &FilterDevice,
        record: &ConfigRecord,
    ) -> Result<HandlerOutcome, ConfigError> {
        let ConfigRecord::Param { key, value } = record else {
            return Ok(HandlerOutcome::Forward);
        };
        let name = key.strip_prefix("ost.").unwrap_or(key);

        if name == "exports.clear" {
            dev.stats().clear_exports();
            info!(device = dev.name(), "Cleared export statistics");
            return Ok(HandlerOutcome::Handled);
        }

        let mut config = dev.config.write();
        match name {
            "fmd_max_num" => {
                let num = Self::positive(key, value)?;
                config.fmd_max_num = u32::try_from(num).map_err(|_| Self::invalid(key, value))?;
            }
            "fmd_max_age" => {
                config.fmd_max_age = Duration::from_secs(Self::positive(key, value)?);
            }
            "ldlm_timeout" => {
                config.ldlm_timeout = Duration::from_secs(Self::positive(key, value)?);
            }
            "sync_journal" => config.sync_journal = Self::flag(key, value)?,
            "degraded" => {
                config.degraded = Self::flag(key, value)?;
                info!(device = dev.name(), degraded = config.degraded, "Degraded state changed");
            }
            _ => return Ok(HandlerOutcome::Forward),
        }
        debug!(device = dev.name(), key = name, value, "Applied parameter");
        Ok(HandlerOutcome::Handled)
    }
}

/// Replacement of the security rule set.
struct SecurityHandler;

impl ConfigHandler for SecurityHandler {
    fn handle(
        &self,
        dev: &FilterDevice,
        record: &ConfigRecord,
    ) -> Result<HandlerOutcome, ConfigError> {
        let ConfigRecord::SptlrpcConf { rules } = record else {
            return Ok(HandlerOutcome::Forward);
        };
        // Parse fully before swapping so a bad rule leaves the old set active.
        let parsed = SecurityRuleSet::parse(rules)?;
        let count = parsed.len();
        *dev.security.write() = parsed;
        info!(device = dev.name(), rules = count, "Security rules replaced");
        Ok(HandlerOutcome::Handled)
    }
}
