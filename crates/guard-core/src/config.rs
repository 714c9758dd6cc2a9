// CLUSTER CONFIGURATION
// Loaded from a TOML file with GUARD__-prefixed environment overrides, then
// validated. Any invalid value fails fast with ConfigurationError.

use crate::error::ConfigurationError;
use crate::types::{ChainId, ValidatorId};
use config::{Config, Environment, File, FileFormat};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Upper bound on `timing.transfer_deadline_secs` (one year).
pub const MAX_TRANSFER_DEADLINE_SECS: u64 = 365 * 24 * 60 * 60;
/// Upper bound on same-endpoint retries before failover.
pub const MAX_CALL_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// Primary first, then backups
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub fallback_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub id: String,
    pub chain: String,
    /// Hex-encoded ed25519 public key
    pub public_key: String,
    /// Member of the designated bridge-signer subset
    #[serde(default)]
    pub bridge: bool,
}

impl ValidatorConfig {
    pub fn validator_id(&self) -> ValidatorId {
        ValidatorId::new(self.id.clone())
    }

    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.chain.clone())
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidPublicKey {
            validator: self.id.clone(),
            reason,
        };
        let bytes = hex::decode(self.public_key.trim()).map_err(|e| invalid(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| invalid(format!("expected 32 bytes, got {}", b.len())))?;
        VerifyingKey::from_bytes(&key).map_err(|e| invalid(e.to_string()))?;
        Ok(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationConfig {
    pub initial: f64,
    /// Added to each positive voter of a committed round
    pub commit_reward: f64,
    /// Consecutive failed votes that slash a validator
    pub failure_window: u32,
    pub slash_penalty: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            initial: 50.0,
            commit_reward: 1.0,
            failure_window: 5,
            slash_penalty: 25.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Bound on every ledger call; exceeding it counts as an endpoint failure
    pub call_timeout_ms: u64,
    /// Extra attempts on the same endpoint before failing over
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,
    pub health_interval_ms: u64,
    pub consensus_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub metrics_interval_ms: u64,
    /// Time a bridge transfer has to reach Completed
    pub transfer_deadline_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            call_timeout_ms: 2_000,
            call_retries: default_call_retries(),
            health_interval_ms: 5_000,
            consensus_interval_ms: 3_000,
            sweep_interval_ms: 10_000,
            metrics_interval_ms: 15_000,
            transfer_deadline_secs: 600,
        }
    }
}

fn default_call_retries() -> u32 {
    1
}

impl TimingConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Worst-case duration of one ledger call that walks `endpoints`
    /// endpoints, retrying each, plus one call of slack.
    pub fn failover_budget(&self, endpoints: usize) -> Duration {
        let per_endpoint = self.call_retries.min(MAX_CALL_RETRIES) + 1;
        let attempts = per_endpoint.saturating_mul(endpoints.max(1) as u32);
        self.call_timeout().saturating_mul(attempts.saturating_add(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn consensus_interval(&self) -> Duration {
        Duration::from_millis(self.consensus_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn transfer_deadline(&self) -> chrono::Duration {
        let secs = self.transfer_deadline_secs.min(MAX_TRANSFER_DEADLINE_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Load variance across a chain's shards that triggers a rebalance
    pub load_variance_threshold: f64,
    /// Transactions drained from the shards per consensus round
    pub batch_size: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        ShardingConfig {
            load_variance_threshold: 16.0,
            batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    pub latency_high_watermark_ms: f64,
    pub throughput_low_watermark: f64,
    /// Consecutive samples a condition must hold before an intent is emitted
    pub sustain_cycles: usize,
    /// Fraction of the watermarks considered "comfortably within bounds"
    pub comfort_ratio: f64,
    /// Samples kept in the rolling window
    pub window: usize,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        AutoscalerConfig {
            latency_high_watermark_ms: 1_500.0,
            throughput_low_watermark: 1.0,
            sustain_cycles: 3,
            comfort_ratio: 0.5,
            window: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory; in-memory storage when absent
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub supported_chains: Vec<ChainConfig>,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_bridge_signature_threshold")]
    pub bridge_signature_threshold: usize,
    #[serde(default = "default_max_transfer_amount")]
    pub max_transfer_amount: u64,
    #[serde(default)]
    pub auto_scaling_enabled: bool,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_shard_count() -> u32 {
    4
}

fn default_consensus_threshold() -> f64 {
    0.67
}

fn default_bridge_signature_threshold() -> usize {
    3
}

fn default_max_transfer_amount() -> u64 {
    1_000_000
}

impl ClusterConfig {
    /// Load from a TOML file with `GUARD__` environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Toml))
            .add_source(Environment::with_prefix("GUARD").prefix_separator("__").separator("__"))
            .build()?;
        let config: ClusterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigurationError> {
        let settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;
        let config: ClusterConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.supported_chains.is_empty() {
            return Err(ConfigurationError::NoChains);
        }

        let mut chains = HashSet::new();
        for chain in &self.supported_chains {
            if chain.endpoints.is_empty() {
                return Err(ConfigurationError::EmptyEndpoints { chain: chain.name.clone() });
            }
            if !chains.insert(chain.name.as_str()) {
                return Err(ConfigurationError::DuplicateChain { chain: chain.name.clone() });
            }
        }

        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            return Err(ConfigurationError::InvalidThreshold(self.consensus_threshold));
        }
        if self.shard_count == 0 {
            return Err(ConfigurationError::InvalidShardCount);
        }
        if self.max_transfer_amount == 0 {
            return Err(ConfigurationError::InvalidTransferCap);
        }

        let mut validators = HashSet::new();
        for validator in &self.validators {
            if !chains.contains(validator.chain.as_str()) {
                return Err(ConfigurationError::UnknownValidatorChain {
                    validator: validator.id.clone(),
                    chain: validator.chain.clone(),
                });
            }
            if !validators.insert(validator.id.as_str()) {
                return Err(ConfigurationError::DuplicateValidator {
                    validator: validator.id.clone(),
                });
            }
            validator.public_key_bytes()?;
        }

        let bridge_signers = self.validators.iter().filter(|v| v.bridge).count();
        let threshold = self.bridge_signature_threshold;
        if threshold == 0 || threshold > bridge_signers {
            return Err(ConfigurationError::InvalidBridgeThreshold {
                threshold,
                available: bridge_signers,
            });
        }

        let rep = &self.reputation;
        if !(0.0..=100.0).contains(&rep.initial) {
            return Err(ConfigurationError::InvalidReputation("initial must be within [0, 100]"));
        }
        if rep.commit_reward < 0.0 || rep.slash_penalty < 0.0 {
            return Err(ConfigurationError::InvalidReputation("reward and penalty must be >= 0"));
        }
        if rep.failure_window == 0 {
            return Err(ConfigurationError::InvalidReputation("failure_window must be > 0"));
        }

        let t = &self.timing;
        if t.call_timeout_ms == 0
            || t.health_interval_ms == 0
            || t.consensus_interval_ms == 0
            || t.sweep_interval_ms == 0
            || t.metrics_interval_ms == 0
            || t.transfer_deadline_secs == 0
        {
            return Err(ConfigurationError::InvalidTiming("timeouts and intervals must be > 0"));
        }
        if t.transfer_deadline_secs > MAX_TRANSFER_DEADLINE_SECS {
            return Err(ConfigurationError::InvalidTiming(
                "transfer_deadline_secs must be at most one year",
            ));
        }
        if t.call_retries > MAX_CALL_RETRIES {
            return Err(ConfigurationError::InvalidTiming("call_retries must be at most 5"));
        }
        if self.sharding.batch_size == 0 {
            return Err(ConfigurationError::InvalidTiming("sharding batch_size must be > 0"));
        }

        let a = &self.autoscaler;
        if a.sustain_cycles == 0 || a.window == 0 {
            return Err(ConfigurationError::InvalidAutoscaler(
                "sustain_cycles and window must be > 0",
            ));
        }
        if !(a.comfort_ratio > 0.0 && a.comfort_ratio < 1.0) {
            return Err(ConfigurationError::InvalidAutoscaler("comfort_ratio must be in (0, 1)"));
        }

        Ok(())
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.supported_chains.iter().map(|c| ChainId::new(c.name.clone())).collect()
    }

    /// Largest endpoint pool of any chain, fallback included.
    pub fn max_endpoints(&self) -> usize {
        self.supported_chains
            .iter()
            .map(|c| c.endpoints.len() + usize::from(c.fallback_endpoint.is_some()))
            .max()
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    fn key_hex(seed: u8) -> String {
        hex::encode(SigningKey::from_bytes(&[seed; 32]).verifying_key().to_bytes())
    }

    fn sample_toml(threshold: &str) -> String {
        format!(
            r#"
shard_count = 2
consensus_threshold = {threshold}
bridge_signature_threshold = 2
max_transfer_amount = 1000

[[supported_chains]]
name = "alpha"
endpoints = ["http://alpha-1", "http://alpha-2"]
fallback_endpoint = "http://alpha-fallback"

[[supported_chains]]
name = "beta"
endpoints = ["http://beta-1"]

[[validators]]
id = "v1"
chain = "alpha"
public_key = "{k1}"
bridge = true

[[validators]]
id = "v2"
chain = "beta"
public_key = "{k2}"
bridge = true
"#,
            threshold = threshold,
            k1 = key_hex(1),
            k2 = key_hex(2),
        )
    }

    #[test]
    fn test_load_valid_toml() {
        let config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        assert_eq!(config.supported_chains.len(), 2);
        assert_eq!(config.shard_count, 2);
        assert_eq!(config.reputation, ReputationConfig::default());
        assert_eq!(
            config.supported_chains[0].fallback_endpoint.as_deref(),
            Some("http://alpha-fallback")
        );
        assert!(!config.auto_scaling_enabled);
    }

    #[test]
    fn test_threshold_outside_unit_interval_fails() {
        for bad in ["0.0", "1.5", "-0.2"] {
            let result = ClusterConfig::from_toml_str(&sample_toml(bad));
            assert!(
                matches!(result, Err(ConfigurationError::InvalidThreshold(_))),
                "threshold {}",
                bad
            );
        }
        assert!(ClusterConfig::from_toml_str(&sample_toml("1.0")).is_ok());
    }

    #[test]
    fn test_bridge_threshold_above_signers_fails() {
        let mut config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        config.bridge_signature_threshold = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidBridgeThreshold { threshold: 3, available: 2 })
        ));
    }

    #[test]
    fn test_empty_endpoints_fail() {
        let mut config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        config.supported_chains[1].endpoints.clear();
        assert!(matches!(config.validate(), Err(ConfigurationError::EmptyEndpoints { .. })));
    }

    #[test]
    fn test_bad_public_key_fails() {
        let mut config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        config.validators[0].public_key = "abcd".to_string();
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidPublicKey { .. })));
    }

    #[test]
    fn test_transfer_deadline_is_bounded() {
        let mut config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        config.timing.transfer_deadline_secs = 1_000_000_000_000_000;
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidTiming(_))));
        config.timing.transfer_deadline_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigurationError::InvalidTiming(_))));

        config.timing.transfer_deadline_secs = MAX_TRANSFER_DEADLINE_SECS;
        assert!(config.validate().is_ok());
        assert!(config.timing.transfer_deadline() > chrono::Duration::zero());
    }

    #[test]
    fn test_failover_budget_covers_every_attempt() {
        let config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        assert_eq!(config.timing.call_retries, 1);
        assert_eq!(config.max_endpoints(), 3);
        // 2 attempts on each of 3 endpoints, plus one call
        assert_eq!(config.timing.failover_budget(3), config.timing.call_timeout() * 7);

        let mut excessive = config.clone();
        excessive.timing.call_retries = 50;
        assert!(matches!(excessive.validate(), Err(ConfigurationError::InvalidTiming(_))));
    }

    #[test]
    fn test_validator_on_unknown_chain_fails() {
        let mut config = ClusterConfig::from_toml_str(&sample_toml("0.67")).unwrap();
        config.validators[0].chain = "gamma".to_string();
        assert!(matches!(config.validate(), Err(ConfigurationError::UnknownValidatorChain { .. })));
    }
}
