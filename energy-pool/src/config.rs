//! Energy Pool Configuration
//!
//! Configuration for the chain connection, resource ratios, pricing,
//! reservation expiry, allocation and retry behaviour.
//! Supports loading from environment variables with ENERGY_POOL_ prefix.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::error::{PoolError, PoolResult};
use crate::types::ResourceKind;

/// TRON network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum TronNetwork {
    /// TRON mainnet
    #[default]
    Mainnet,
    /// Shasta testnet
    Shasta,
    /// Nile testnet
    Nile,
}

impl TronNetwork {
    /// Parse from string (for environment variables)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "shasta" => Some(Self::Shasta),
            "nile" => Some(Self::Nile),
            _ => None,
        }
    }

    /// Public full-node HTTP endpoint
    pub fn default_url(&self) -> &'static str {
        match self {
            TronNetwork::Mainnet => "https://api.trongrid.io",
            TronNetwork::Shasta => "https://api.shasta.trongrid.io",
            TronNetwork::Nile => "https://nile.trongrid.io",
        }
    }

    /// Network id as carried on payment events
    pub fn id(&self) -> &'static str {
        match self {
            TronNetwork::Mainnet => "mainnet",
            TronNetwork::Shasta => "shasta",
            TronNetwork::Nile => "nile",
        }
    }
}

/// Chain connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Network type
    pub network: TronNetwork,
    /// Full-node HTTP endpoint
    pub url: String,
    /// TronGrid API key (sent as TRON-PRO-API-KEY)
    pub api_key: Option<String>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_chain_timeout")]
    pub timeout_ms: u64,
    /// Lock delegations for `lock_period` blocks
    #[serde(default)]
    pub lock: bool,
    /// Lock period in blocks (3 seconds each)
    pub lock_period: Option<u64>,
}

fn default_chain_timeout() -> u64 {
    10_000
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network: TronNetwork::Mainnet,
            url: TronNetwork::Mainnet.default_url().to_string(),
            api_key: None,
            timeout_ms: 10_000,
            lock: false,
            lock_period: None,
        }
    }
}

impl ChainConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - ENERGY_POOL_NETWORK: Network type (mainnet/shasta/nile)
    /// - ENERGY_POOL_CHAIN_URL: Full-node HTTP endpoint
    /// - ENERGY_POOL_API_KEY: TronGrid API key (optional)
    /// - ENERGY_POOL_CHAIN_TIMEOUT_MS: Request timeout in milliseconds
    /// - ENERGY_POOL_DELEGATION_LOCK_PERIOD: Lock period in blocks (enables lock)
    pub fn from_env() -> Self {
        let network = env::var("ENERGY_POOL_NETWORK")
            .ok()
            .and_then(|s| TronNetwork::parse(&s))
            .unwrap_or(TronNetwork::Nile);

        let lock_period: Option<u64> = env::var("ENERGY_POOL_DELEGATION_LOCK_PERIOD")
            .ok()
            .and_then(|s| s.parse().ok());

        Self {
            network,
            url: env::var("ENERGY_POOL_CHAIN_URL")
                .unwrap_or_else(|_| network.default_url().to_string()),
            api_key: env::var("ENERGY_POOL_API_KEY").ok().filter(|s| !s.is_empty()),
            timeout_ms: env_or("ENERGY_POOL_CHAIN_TIMEOUT_MS", 10_000),
            lock: lock_period.is_some(),
            lock_period,
        }
    }
}

/// Resource units obtained per staked TRX
///
/// Network-generation specific: derived from the chain's total resource
/// limit over total staked weight. Re-verify against the live network
/// parameters before changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRatio {
    pub energy_per_trx: u64,
    pub bandwidth_per_trx: u64,
}

impl Default for ResourceRatio {
    fn default() -> Self {
        Self {
            energy_per_trx: 11,
            bandwidth_per_trx: 1,
        }
    }
}

impl ResourceRatio {
    /// Units per TRX for the given resource kind
    pub fn units_per_trx(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Energy => self.energy_per_trx,
            ResourceKind::Bandwidth => self.bandwidth_per_trx,
        }
    }
}

/// Flash-rent pricing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Resource kind rented to customers
    #[serde(default)]
    pub resource_kind: ResourceKind,
    /// Price of one rental unit in SUN
    pub price_per_unit_sun: u64,
    /// Resource amount granted per rental unit
    pub resource_per_unit: u64,
    /// Upper bound of units per order
    pub max_units_per_order: u64,
    /// Orders paying for fewer units are rejected
    pub min_units: u64,
    /// Rental duration in seconds
    pub duration_secs: u64,
    /// Payments older than this are rejected
    pub payment_freshness_secs: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            resource_kind: ResourceKind::Energy,
            price_per_unit_sun: 3_000_000,
            resource_per_unit: 65_000,
            max_units_per_order: 10,
            min_units: 1,
            duration_secs: 3_600,
            payment_freshness_secs: 1_800,
        }
    }
}

/// Reservation expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    /// Unconfirmed reservations older than this are swept
    pub ttl_secs: u64,
    /// Interval between expiry sweeps
    pub sweep_interval_secs: u64,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 3_600,
            sweep_interval_secs: 300,
        }
    }
}

/// Allocation engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Consecutive snapshot failures before an account is put in maintenance
    pub demote_after_failures: u32,
    /// Re-plan attempts when the atomic commit loses a race
    pub max_commit_attempts: u32,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            demote_after_failures: 3,
            max_commit_attempts: 3,
        }
    }
}

/// Retry behaviour for orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// External-service attempts (chain / network)
    pub max_attempts: u32,
    /// Initial backoff in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Capacity deficit attempts
    pub capacity_attempts: u32,
    /// Delay before retrying a capacity deficit, in milliseconds
    pub capacity_backoff_ms: u64,
    /// Re-plans after chain rejections
    pub max_replans: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            capacity_attempts: 2,
            capacity_backoff_ms: 2_000,
            max_replans: 2,
        }
    }
}

/// Signing-key vault
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct KeyVaultConfig {
    /// AES-256 master key (64 hex chars)
    pub master_key_hex: String,
}

impl std::fmt::Debug for KeyVaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVaultConfig")
            .field("master_key_hex", &"<redacted>")
            .finish()
    }
}

/// Energy pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub chain: ChainConfig,
    #[serde(default)]
    pub ratio: ResourceRatio,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub reservation: ReservationConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub keys: KeyVaultConfig,
    /// Storage call timeout in milliseconds
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_ms: u64,
    /// Order workers in the background runner
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_storage_timeout() -> u64 {
    5_000
}

fn default_workers() -> usize {
    4
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            ratio: ResourceRatio::default(),
            pricing: PricingConfig::default(),
            reservation: ReservationConfig::default(),
            allocation: AllocationConfig::default(),
            retry: RetryConfig::default(),
            keys: KeyVaultConfig::default(),
            storage_timeout_ms: 5_000,
            workers: 4,
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - ENERGY_POOL_ENERGY_PER_TRX / ENERGY_POOL_BANDWIDTH_PER_TRX: Resource ratios
    /// - ENERGY_POOL_RESOURCE_KIND: Rented resource (energy/bandwidth)
    /// - ENERGY_POOL_PRICE_PER_UNIT_SUN: Unit price in SUN
    /// - ENERGY_POOL_RESOURCE_PER_UNIT: Resource amount per unit
    /// - ENERGY_POOL_MAX_UNITS / ENERGY_POOL_MIN_UNITS: Units per order bounds
    /// - ENERGY_POOL_RENT_DURATION_SECS: Rental duration
    /// - ENERGY_POOL_PAYMENT_FRESHNESS_SECS: Maximum payment age
    /// - ENERGY_POOL_RESERVATION_TTL_SECS: Reservation expiry window
    /// - ENERGY_POOL_SWEEP_INTERVAL_SECS: Expiry sweep interval
    /// - ENERGY_POOL_MAX_RETRIES: External-service attempts
    /// - ENERGY_POOL_RETRY_INITIAL_DELAY_MS: Initial backoff
    /// - ENERGY_POOL_MASTER_KEY: Key vault master key (hex)
    /// - ENERGY_POOL_STORAGE_TIMEOUT_MS: Storage call timeout
    /// - ENERGY_POOL_WORKERS: Order worker count
    ///
    /// Also reads chain config from its env vars.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            chain: ChainConfig::from_env(),
            ratio: ResourceRatio {
                energy_per_trx: env_or("ENERGY_POOL_ENERGY_PER_TRX", defaults.ratio.energy_per_trx),
                bandwidth_per_trx: env_or(
                    "ENERGY_POOL_BANDWIDTH_PER_TRX",
                    defaults.ratio.bandwidth_per_trx,
                ),
            },
            pricing: PricingConfig {
                resource_kind: env::var("ENERGY_POOL_RESOURCE_KIND")
                    .ok()
                    .and_then(|s| ResourceKind::parse(&s))
                    .unwrap_or(defaults.pricing.resource_kind),
                price_per_unit_sun: env_or(
                    "ENERGY_POOL_PRICE_PER_UNIT_SUN",
                    defaults.pricing.price_per_unit_sun,
                ),
                resource_per_unit: env_or(
                    "ENERGY_POOL_RESOURCE_PER_UNIT",
                    defaults.pricing.resource_per_unit,
                ),
                max_units_per_order: env_or(
                    "ENERGY_POOL_MAX_UNITS",
                    defaults.pricing.max_units_per_order,
                ),
                min_units: env_or("ENERGY_POOL_MIN_UNITS", defaults.pricing.min_units),
                duration_secs: env_or(
                    "ENERGY_POOL_RENT_DURATION_SECS",
                    defaults.pricing.duration_secs,
                ),
                payment_freshness_secs: env_or(
                    "ENERGY_POOL_PAYMENT_FRESHNESS_SECS",
                    defaults.pricing.payment_freshness_secs,
                ),
            },
            reservation: ReservationConfig {
                ttl_secs: env_or(
                    "ENERGY_POOL_RESERVATION_TTL_SECS",
                    defaults.reservation.ttl_secs,
                ),
                sweep_interval_secs: env_or(
                    "ENERGY_POOL_SWEEP_INTERVAL_SECS",
                    defaults.reservation.sweep_interval_secs,
                ),
            },
            allocation: defaults.allocation,
            retry: RetryConfig {
                max_attempts: env_or("ENERGY_POOL_MAX_RETRIES", defaults.retry.max_attempts),
                initial_delay_ms: env_or(
                    "ENERGY_POOL_RETRY_INITIAL_DELAY_MS",
                    defaults.retry.initial_delay_ms,
                ),
                ..defaults.retry
            },
            keys: KeyVaultConfig {
                master_key_hex: env::var("ENERGY_POOL_MASTER_KEY").unwrap_or_default(),
            },
            storage_timeout_ms: env_or("ENERGY_POOL_STORAGE_TIMEOUT_MS", defaults.storage_timeout_ms),
            workers: env_or("ENERGY_POOL_WORKERS", defaults.workers),
        }
    }

    /// Create a development configuration (Nile testnet, short timers)
    pub fn development() -> Self {
        Self {
            chain: ChainConfig {
                network: TronNetwork::Nile,
                url: TronNetwork::Nile.default_url().to_string(),
                api_key: None,
                timeout_ms: 5_000,
                lock: false,
                lock_period: None,
            },
            ratio: ResourceRatio::default(),
            pricing: PricingConfig::default(),
            reservation: ReservationConfig {
                ttl_secs: 600,
                sweep_interval_secs: 30,
            },
            allocation: AllocationConfig::default(),
            retry: RetryConfig {
                initial_delay_ms: 10,
                max_delay_ms: 100,
                capacity_backoff_ms: 10,
                ..RetryConfig::default()
            },
            keys: KeyVaultConfig {
                // development only; never deploy with this key
                master_key_hex: "00".repeat(32),
            },
            storage_timeout_ms: 2_000,
            workers: 2,
        }
    }

    /// Reject configurations that would make the engine misbehave
    pub fn validate(&self) -> PoolResult<()> {
        if self.ratio.energy_per_trx == 0 || self.ratio.bandwidth_per_trx == 0 {
            return Err(PoolError::Configuration(
                "resource ratios must be non-zero".to_string(),
            ));
        }
        if self.pricing.price_per_unit_sun == 0 {
            return Err(PoolError::Configuration(
                "price_per_unit_sun must be non-zero".to_string(),
            ));
        }
        if self.pricing.resource_per_unit == 0 {
            return Err(PoolError::Configuration(
                "resource_per_unit must be non-zero".to_string(),
            ));
        }
        if self.pricing.min_units == 0 || self.pricing.min_units > self.pricing.max_units_per_order
        {
            return Err(PoolError::Configuration(format!(
                "invalid unit bounds: min {} max {}",
                self.pricing.min_units, self.pricing.max_units_per_order
            )));
        }
        if self.pricing.duration_secs == 0 {
            return Err(PoolError::Configuration(
                "duration_secs must be non-zero".to_string(),
            ));
        }
        if self.chain.timeout_ms == 0 || self.storage_timeout_ms == 0 {
            return Err(PoolError::Configuration(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.reservation.ttl_secs == 0 || self.reservation.sweep_interval_secs == 0 {
            return Err(PoolError::Configuration(
                "reservation ttl and sweep interval must be non-zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PoolError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.allocation.max_commit_attempts == 0 {
            return Err(PoolError::Configuration(
                "allocation.max_commit_attempts must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(PoolError::Configuration(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.keys.master_key_hex.len() != 64 || hex::decode(&self.keys.master_key_hex).is_err()
        {
            return Err(PoolError::Configuration(
                "master key must be 64 hex characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Chain timeout as a Duration
    pub fn chain_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.chain.timeout_ms)
    }

    /// Storage timeout as a Duration
    pub fn storage_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.storage_timeout_ms)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_defaults() {
        let network = TronNetwork::default();
        assert_eq!(network, TronNetwork::Mainnet);
        assert_eq!(network.default_url(), "https://api.trongrid.io");
        assert_eq!(TronNetwork::parse("NILE"), Some(TronNetwork::Nile));
    }

    #[test]
    fn test_development_config_is_valid() {
        let config = PoolConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.chain.network, TronNetwork::Nile);
    }

    #[test]
    fn test_default_requires_master_key() {
        let config = PoolConfig::default();
        assert!(matches!(
            config.validate(),
            Err(PoolError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_ratio_rejected() {
        let mut config = PoolConfig::development();
        config.ratio.energy_per_trx = 0;
        assert!(config.validate().is_err());

        let mut config = PoolConfig::development();
        config.pricing.min_units = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_units_per_trx() {
        let ratio = ResourceRatio {
            energy_per_trx: 12,
            bandwidth_per_trx: 2,
        };
        assert_eq!(ratio.units_per_trx(ResourceKind::Energy), 12);
        assert_eq!(ratio.units_per_trx(ResourceKind::Bandwidth), 2);
    }

    #[test]
    fn test_key_config_debug_redacted() {
        let config = PoolConfig::development();
        let debug = format!("{:?}", config.keys);
        assert!(!debug.contains("0000"));
    }
}
