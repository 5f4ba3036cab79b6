use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How cache convergence relates to mutation commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    /// Invalidation completes before the mutation returns.
    WriteThrough,
    /// Mutation returns at commit; the cache converges within the TTL window
    /// or when the queued invalidation event is processed.
    WriteBehind,
}

/// Resolution policy for optional slots referencing inactive templates.
/// Fixed per deployment, never per call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalSlotPolicy {
    OmitInactive,
    FailFast,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Bounded staleness window for cached values, in seconds.
    pub ttl_secs: u64,
    /// Budget for a single cache operation before falling back to the store.
    pub op_timeout_ms: u64,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Process-wide engine configuration, passed explicitly to the resolver and
/// sync coordinator at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub consistency: ConsistencyMode,
    pub optional_slots: OptionalSlotPolicy,
    pub cache: CacheSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consistency: ConsistencyMode::WriteThrough,
            optional_slots: OptionalSlotPolicy::OmitInactive,
            cache: CacheSettings { enabled: true, ttl_secs: 3600, op_timeout_ms: 250 },
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("could not parse engine config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
}

#[derive(Debug, Default, Deserialize)]
struct RawEngineConfig {
    consistency: Option<ConsistencyMode>,
    optional_slots: Option<OptionalSlotPolicy>,
    cache: Option<RawCacheSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCacheSettings {
    enabled: Option<bool>,
    ttl_secs: Option<u64>,
    op_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigLoadError> {
        let parsed: RawEngineConfig = toml::from_str(raw)?;
        let defaults = Self::default();
        let raw_cache = parsed.cache.unwrap_or_default();
        let mut config = Self {
            consistency: parsed.consistency.unwrap_or(defaults.consistency),
            optional_slots: parsed.optional_slots.unwrap_or(defaults.optional_slots),
            cache: CacheSettings {
                enabled: raw_cache.enabled.unwrap_or(defaults.cache.enabled),
                ttl_secs: raw_cache.ttl_secs.unwrap_or(defaults.cache.ttl_secs),
                op_timeout_ms: raw_cache.op_timeout_ms.unwrap_or(defaults.cache.op_timeout_ms),
            },
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn load_with_env() -> Result<Self, ConfigLoadError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigLoadError> {
        if let Ok(value) = env::var("PERSONA_CONSISTENCY_MODE") {
            self.consistency = value.parse()?;
        }
        if let Ok(value) = env::var("PERSONA_OPTIONAL_SLOT_POLICY") {
            self.optional_slots = value.parse()?;
        }
        if let Ok(value) = env::var("PERSONA_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("PERSONA_CACHE_ENABLED", &value)?;
        }
        if let Ok(value) = env::var("PERSONA_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_u64("PERSONA_CACHE_TTL_SECS", &value)?;
        }
        if let Ok(value) = env::var("PERSONA_CACHE_OP_TIMEOUT_MS") {
            self.cache.op_timeout_ms = parse_u64("PERSONA_CACHE_OP_TIMEOUT_MS", &value)?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigLoadError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigLoadError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigLoadError> {
    value.trim().parse().map_err(|_| ConfigLoadError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl std::str::FromStr for ConsistencyMode {
    type Err = ConfigLoadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "write_through" => Ok(Self::WriteThrough),
            "write_behind" => Ok(Self::WriteBehind),
            other => Err(ConfigLoadError::InvalidEnvOverride {
                key: "consistency".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl std::str::FromStr for OptionalSlotPolicy {
    type Err = ConfigLoadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "omit_inactive" => Ok(Self::OmitInactive),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(ConfigLoadError::InvalidEnvOverride {
                key: "optional_slots".to_string(),
                value: other.to_string(),
            }),
        }
    }
}
