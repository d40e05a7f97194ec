//! Configuration records and device configuration.
//!
//! Devices are configured by a log of typed [`ConfigRecord`]s. A device applies
//! the records it understands and forwards the rest to the device below it.
//! [`FilterConfig`] is the static configuration of a filter device, built
//! either from its `Setup` record or from a JSON document.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;

/// Default cap on cached file-modification-data entries per export.
pub const FMD_MAX_NUM_DEFAULT: u32 = 128;

/// Default lifetime of a file-modification-data entry.
pub const FMD_MAX_AGE_DEFAULT: Duration = Duration::from_secs(110);

/// Default lock callback timeout on object servers.
pub const LDLM_TIMEOUT_DEFAULT: Duration = Duration::from_secs(6);

bitflags! {
    /// Flags of a cleanup record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CleanupFlags: u8 {
        /// Do not wait for clients, drop their state.
        const FORCE = 0x01;
        /// The device is failing over to another node.
        const FAILOVER = 0x02;
    }
}

impl fmt::Display for CleanupFlags {
    /// Renders as the flag string of the record buffer: `F`, `A` or `FA`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Self::FORCE) {
            f.write_str("F")?;
        }
        if self.contains(Self::FAILOVER) {
            f.write_str("A")?;
        }
        Ok(())
    }
}

/// One record of a device configuration log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRecord {
    /// Device setup. Buffer 0 is the device name, buffer 1 optionally names
    /// the lower device and buffer 4 carries option letters.
    Setup { bufs: Vec<String> },
    /// Tunable update.
    Param { key: String, value: String },
    /// Replacement of the whole security rule set.
    SptlrpcConf { rules: Vec<String> },
    /// Device shutdown notice.
    Cleanup { flags: CleanupFlags },
    /// Anything else, passed along untouched.
    Other { command: String, bufs: Vec<String> },
}

impl ConfigRecord {
    /// Build a `Param` record from `key=value`.
    pub fn param(kv: &str) -> Result<Self, ConfigError> {
        let (key, value) = kv
            .split_once('=')
            .filter(|(key, _)| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MalformedParam(kv.to_string()))?;
        Ok(Self::Param {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }

    pub fn command(&self) -> &str {
        match self {
            Self::Setup { .. } => "setup",
            Self::Param { .. } => "param",
            Self::SptlrpcConf { .. } => "sptlrpc_conf",
            Self::Cleanup { .. } => "cleanup",
            Self::Other { command, .. } => command,
        }
    }
}

/// How a device dealt with a configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// The device applied the record itself.
    Applied,
    /// The record was passed to the device below, which accepted it.
    Forwarded,
}

/// Static configuration of a filter device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Device name, also used to derive the lower device and namespace names.
    pub name: String,

    /// Lower device name. Defaults to `<name>-dsk`.
    #[serde(default)]
    pub lower: Option<String>,

    /// Whether clients may replay requests after a restart.
    #[serde(default = "default_recovery")]
    pub recovery: bool,

    #[serde(default = "default_fmd_max_num")]
    pub fmd_max_num: u32,

    #[serde(with = "humantime_serde", default = "default_fmd_max_age")]
    pub fmd_max_age: Duration,

    /// How long a client has to answer a lock callback.
    #[serde(with = "humantime_serde", default = "default_ldlm_timeout")]
    pub ldlm_timeout: Duration,

    /// Commit the journal before replying to writes.
    #[serde(default)]
    pub sync_journal: bool,

    /// The backing RAID is degraded; allocators should avoid this target.
    #[serde(default)]
    pub degraded: bool,
}

fn default_recovery() -> bool {
    true
}

fn default_fmd_max_num() -> u32 {
    FMD_MAX_NUM_DEFAULT
}

fn default_fmd_max_age() -> Duration {
    FMD_MAX_AGE_DEFAULT
}

fn default_ldlm_timeout() -> Duration {
    LDLM_TIMEOUT_DEFAULT
}

impl FilterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lower: None,
            recovery: default_recovery(),
            fmd_max_num: FMD_MAX_NUM_DEFAULT,
            fmd_max_age: FMD_MAX_AGE_DEFAULT,
            ldlm_timeout: LDLM_TIMEOUT_DEFAULT,
            sync_journal: false,
            degraded: false,
        }
    }

    /// Name of the device this one stacks on.
    pub fn lower_name(&self) -> String {
        self.lower
            .clone()
            .unwrap_or_else(|| format!("{}-dsk", self.name))
    }

    /// Build the configuration from a `Setup` record.
    ///
    /// An `n` in buffer 4 disables recovery.
    pub fn from_setup_record(record: &ConfigRecord) -> Result<Self, ConfigError> {
        let ConfigRecord::Setup { bufs } = record else {
            return Err(ConfigError::Rejected {
                device: String::new(),
                command: record.command().to_string(),
                reason: "expected a setup record".to_string(),
            });
        };

        let name = bufs
            .first()
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::MissingBuffer { index: 0 })?;
        let mut config = Self::new(name.clone());
        config.lower = bufs.get(1).filter(|lower| !lower.is_empty()).cloned();
        if bufs.get(4).is_some_and(|opts| opts.contains('n')) {
            config.recovery = false;
        }
        Ok(config)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Transport security flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Null,
    Plain,
    GssNull,
    Krb5n,
    Krb5a,
    Krb5i,
    Krb5p,
}

impl Flavor {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "null" => Self::Null,
            "plain" => Self::Plain,
            "gssnull" => Self::GssNull,
            "krb5n" => Self::Krb5n,
            "krb5a" => Self::Krb5a,
            "krb5i" => Self::Krb5i,
            "krb5p" => Self::Krb5p,
            _ => return None,
        })
    }
}

/// Which peers a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDirection {
    Any,
    CliToMdt,
    CliToOst,
    MdtToMdt,
    MdtToOst,
}

impl RuleDirection {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "any2any" => Self::Any,
            "cli2mdt" => Self::CliToMdt,
            "cli2ost" => Self::CliToOst,
            "mdt2mdt" => Self::MdtToMdt,
            "mdt2ost" => Self::MdtToOst,
            _ => return None,
        })
    }
}

/// One `<network>[.<direction>]=<flavor>` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRule {
    /// Network name, or `default` for every network.
    pub network: String,
    pub direction: RuleDirection,
    pub flavor: Flavor,
}

impl SecurityRule {
    pub fn parse(rule: &str) -> Result<Self, ConfigError> {
        let invalid = |reason| ConfigError::InvalidSecurityRule {
            rule: rule.to_string(),
            reason,
        };

        let (target, flavor) = rule.split_once('=').ok_or_else(|| invalid("missing '='"))?;
        let flavor = Flavor::parse(flavor.trim()).ok_or_else(|| invalid("unknown flavor"))?;
        let (network, direction) = match target.trim().split_once('.') {
            Some((network, direction)) => (
                network,
                RuleDirection::parse(direction).ok_or_else(|| invalid("unknown direction"))?,
            ),
            None => (target.trim(), RuleDirection::Any),
        };
        if network.is_empty() {
            return Err(invalid("empty network"));
        }

        Ok(Self {
            network: network.to_string(),
            direction,
            flavor,
        })
    }

    fn matches(&self, network: &str, direction: RuleDirection) -> bool {
        (self.network == "default" || self.network == network)
            && (self.direction == RuleDirection::Any || self.direction == direction)
    }
}

/// An ordered set of security rules. The first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityRuleSet {
    rules: Vec<SecurityRule>,
}

impl SecurityRuleSet {
    /// Parse every rule; any failure rejects the whole set.
    pub fn parse<S: AsRef<str>>(rules: &[S]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| SecurityRule::parse(rule.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Flavor required from peers on `network` in `direction`. Defaults to
    /// `null` when no rule matches.
    pub fn flavor_for(&self, network: &str, direction: RuleDirection) -> Flavor {
        self.rules
            .iter()
            .find(|rule| rule.matches(network, direction))
            .map_or(Flavor::Null, |rule| rule.flavor)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
