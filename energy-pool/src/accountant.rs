//! Resource Accounting
//!
//! [`ResourceAccountant`] turns raw chain counters into [`ResourceSnapshot`]s.
//! Two chain views are pulled for every snapshot:
//!
//! - the staking / delegation breakdown (`resource_usage`), used for the
//!   `available` formula and operator reporting
//! - the "can delegate now" figure (`delegatable`), authoritative for
//!   whether a delegation can be made right now
//!
//! A failed chain call is an error, never a zero snapshot, so callers can
//! tell "no capacity" from "unknown capacity".

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chain::ChainClient;
use crate::config::ResourceRatio;
use crate::error::PoolResult;
use crate::retry::with_timeout;
use crate::types::{ChainResourceUsage, ResourceKind, ResourceSnapshot, SUN_PER_TRX};

/// Converts between staked SUN and resource units
///
/// Planning (SUN -> units) rounds down and execution (units -> SUN) rounds
/// up, so `sun_to_units(units_to_sun(u)) >= u` for every `u`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConverter {
    ratio: ResourceRatio,
}

impl ResourceConverter {
    pub fn new(ratio: ResourceRatio) -> Self {
        Self { ratio }
    }

    pub fn ratio(&self) -> ResourceRatio {
        self.ratio
    }

    fn per_trx(&self, kind: ResourceKind) -> u128 {
        self.ratio.units_per_trx(kind).max(1) as u128
    }

    /// Staked SUN needed to delegate `units`
    pub fn units_to_sun(&self, units: u64, kind: ResourceKind) -> u64 {
        let per_trx = self.per_trx(kind);
        let sun = (units as u128 * SUN_PER_TRX as u128).div_ceil(per_trx);
        u64::try_from(sun).unwrap_or(u64::MAX)
    }

    /// Resource units backed by `sun`
    pub fn sun_to_units(&self, sun: u64, kind: ResourceKind) -> u64 {
        let units = sun as u128 * self.per_trx(kind) / SUN_PER_TRX as u128;
        u64::try_from(units).unwrap_or(u64::MAX)
    }
}

/// Builds normalized resource snapshots from the chain
pub struct ResourceAccountant {
    chain: Arc<dyn ChainClient>,
    converter: ResourceConverter,
    timeout: Duration,
}

impl ResourceAccountant {
    pub fn new(chain: Arc<dyn ChainClient>, converter: ResourceConverter, timeout: Duration) -> Self {
        Self {
            chain,
            converter,
            timeout,
        }
    }

    pub fn converter(&self) -> &ResourceConverter {
        &self.converter
    }

    /// Snapshot one resource kind of one address
    pub async fn snapshot(&self, address: &str, kind: ResourceKind) -> PoolResult<ResourceSnapshot> {
        let (usage, delegatable) = tokio::join!(
            with_timeout("getResourceUsage", self.timeout, self.chain.resource_usage(address)),
            with_timeout("getDelegatable", self.timeout, self.chain.delegatable(address, kind)),
        );
        let usage = usage?;
        let delegatable = delegatable?;

        Ok(self.normalize(address, kind, usage.get(kind), delegatable))
    }

    /// Snapshot both resource kinds of one address
    pub async fn snapshot_all(&self, address: &str) -> PoolResult<Vec<ResourceSnapshot>> {
        let usage = with_timeout(
            "getResourceUsage",
            self.timeout,
            self.chain.resource_usage(address),
        )
        .await?;

        let mut snapshots = Vec::with_capacity(ResourceKind::ALL.len());
        for kind in ResourceKind::ALL {
            let delegatable = with_timeout(
                "getDelegatable",
                self.timeout,
                self.chain.delegatable(address, kind),
            )
            .await?;
            snapshots.push(self.normalize(address, kind, usage.get(kind), delegatable));
        }
        Ok(snapshots)
    }

    /// Normalize raw counters; negative drift is clamped to zero and logged
    pub fn normalize(
        &self,
        address: &str,
        kind: ResourceKind,
        usage: &ChainResourceUsage,
        delegatable_sun: u64,
    ) -> ResourceSnapshot {
        let staked = clamp(address, kind, "staked", usage.staked);
        let delegated_out = clamp(address, kind, "delegated_out", usage.delegated_out);
        let delegated_in = clamp(address, kind, "delegated_in", usage.delegated_in);
        let used = clamp(address, kind, "used", usage.used);

        let snapshot = ResourceSnapshot::new(
            address,
            kind,
            self.converter.sun_to_units(staked, kind),
            self.converter.sun_to_units(delegated_out, kind),
            self.converter.sun_to_units(delegated_in, kind),
            used,
            self.converter.sun_to_units(delegatable_sun, kind),
        );

        if snapshot.total_from_staking + snapshot.delegated_in
            < snapshot.delegated_out + snapshot.used
        {
            warn!(
                address,
                kind = %kind,
                total = snapshot.total_from_staking,
                delegated_in = snapshot.delegated_in,
                delegated_out = snapshot.delegated_out,
                used = snapshot.used,
                "Computed available capacity negative, clamped to zero"
            );
        }

        debug!(
            address,
            kind = %kind,
            available = snapshot.available,
            delegatable = snapshot.delegatable,
            "Resource snapshot"
        );
        snapshot
    }
}

fn clamp(address: &str, kind: ResourceKind, field: &str, value: i64) -> u64 {
    if value < 0 {
        warn!(address, kind = %kind, field, value, "Negative chain counter clamped to zero");
        return 0;
    }
    value as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;

    const POOL: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";

    fn converter() -> ResourceConverter {
        ResourceConverter::new(ResourceRatio {
            energy_per_trx: 11,
            bandwidth_per_trx: 1,
        })
    }

    #[test]
    fn test_converter_rounding() {
        let c = converter();
        // 1 TRX staked backs 11 energy
        assert_eq!(c.sun_to_units(SUN_PER_TRX, ResourceKind::Energy), 11);
        assert_eq!(c.sun_to_units(SUN_PER_TRX - 1, ResourceKind::Energy), 10);
        // 1 energy needs ceil(1e6 / 11) sun
        assert_eq!(c.units_to_sun(1, ResourceKind::Energy), 90_910);
        assert_eq!(c.units_to_sun(11, ResourceKind::Energy), SUN_PER_TRX);
    }

    #[test]
    fn test_converter_never_under_delegates() {
        let c = converter();
        for units in [1u64, 7, 65_000, 131_999, 1_000_003] {
            let sun = c.units_to_sun(units, ResourceKind::Energy);
            assert!(c.sun_to_units(sun, ResourceKind::Energy) >= units);
        }
    }

    #[tokio::test]
    async fn test_snapshot_from_chain() {
        let chain = Arc::new(InMemoryChain::new());
        chain
            .set_usage(
                POOL,
                ResourceKind::Energy,
                ChainResourceUsage {
                    limit: 0,
                    used: 1_000,
                    staked: 10 * SUN_PER_TRX as i64,
                    delegated_out: 2 * SUN_PER_TRX as i64,
                    delegated_in: SUN_PER_TRX as i64,
                },
            )
            .await;

        let accountant = ResourceAccountant::new(chain, converter(), Duration::from_secs(1));
        let snap = accountant.snapshot(POOL, ResourceKind::Energy).await.unwrap();
        assert_eq!(snap.total_from_staking, 110);
        assert_eq!(snap.delegated_out, 22);
        assert_eq!(snap.delegated_in, 11);
        // 110 + 11 - 22 - 1000 < 0
        assert_eq!(snap.available, 0);
        // staked - delegated_out = 8 TRX
        assert_eq!(snap.delegatable, 88);
    }

    #[tokio::test]
    async fn test_negative_counters_clamped() {
        let chain = Arc::new(InMemoryChain::new());
        chain
            .set_usage(
                POOL,
                ResourceKind::Energy,
                ChainResourceUsage {
                    limit: 0,
                    used: -5,
                    staked: SUN_PER_TRX as i64,
                    delegated_out: -3,
                    delegated_in: 0,
                },
            )
            .await;
        chain.set_delegatable(POOL, ResourceKind::Energy, -10).await;

        let accountant = ResourceAccountant::new(chain, converter(), Duration::from_secs(1));
        let snap = accountant.snapshot(POOL, ResourceKind::Energy).await.unwrap();
        assert_eq!(snap.used, 0);
        assert_eq!(snap.delegated_out, 0);
        assert_eq!(snap.available, 11);
        assert_eq!(snap.delegatable, 0);
    }

    #[tokio::test]
    async fn test_chain_failure_is_error_not_zero() {
        let chain = Arc::new(InMemoryChain::new());
        chain.fund(POOL, ResourceKind::Energy, SUN_PER_TRX).await;
        chain.fail_reads(POOL, 1).await;

        let accountant = ResourceAccountant::new(chain, converter(), Duration::from_secs(1));
        assert!(accountant.snapshot(POOL, ResourceKind::Energy).await.is_err());
        assert!(accountant.snapshot_all("TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf").await.is_err());
    }
}
