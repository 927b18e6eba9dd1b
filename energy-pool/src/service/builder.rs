//! Energy Pool Service Builder
//!
//! 提供 EnergyPoolService 的构建器模式。

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::accountant::{ResourceAccountant, ResourceConverter};
use crate::allocation::AllocationEngine;
use crate::chain::{ChainClient, TronHttpClient};
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::executor::DelegationExecutor;
use crate::keys::KeyVault;
use crate::ledger::ReservationLedger;
use crate::metrics::PoolMetrics;
use crate::order::OrderLifecycleCoordinator;
use crate::pool::AccountPoolManager;
use crate::storage::PoolStorage;

use super::{EnergyPoolService, ServiceStatus};

/// Energy Pool Service Builder
pub struct EnergyPoolServiceBuilder<S: PoolStorage + 'static> {
    config: Option<PoolConfig>,
    storage: Option<Arc<S>>,
    chain: Option<Arc<dyn ChainClient>>,
}

impl<S: PoolStorage + 'static> EnergyPoolServiceBuilder<S> {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self {
            config: None,
            storage: None,
            chain: None,
        }
    }

    /// 设置配置
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 设置存储
    pub fn storage(mut self, storage: Arc<S>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 设置链客户端（缺省时按配置创建 HTTP 客户端）
    pub fn chain(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// 构建服务
    pub async fn build(self) -> PoolResult<EnergyPoolService<S>> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let storage = self
            .storage
            .ok_or_else(|| PoolError::Configuration("Storage is required".to_string()))?;

        let chain: Arc<dyn ChainClient> = match self.chain {
            Some(chain) => chain,
            None => Arc::new(TronHttpClient::new(config.chain.clone())?),
        };

        let vault = Arc::new(KeyVault::new(&config.keys)?);
        let metrics = Arc::new(PoolMetrics::new());
        let storage_timeout = config.storage_timeout();

        let accountant = Arc::new(ResourceAccountant::new(
            chain.clone(),
            ResourceConverter::new(config.ratio),
            config.chain_timeout(),
        ));

        let ledger = Arc::new(ReservationLedger::new(
            storage.clone(),
            &config.reservation,
            storage_timeout,
            metrics.clone(),
        ));

        let pool = Arc::new(AccountPoolManager::new(
            storage.clone(),
            accountant.clone(),
            ledger.clone(),
            vault.clone(),
            storage_timeout,
        ));

        let engine = Arc::new(AllocationEngine::new(
            storage.clone(),
            accountant.clone(),
            ledger.clone(),
            config.allocation.clone(),
            storage_timeout,
            metrics.clone(),
        ));

        let executor = Arc::new(DelegationExecutor::new(
            storage.clone(),
            chain.clone(),
            accountant.clone(),
            ledger.clone(),
            vault,
            &config,
            metrics.clone(),
        ));

        let orders = Arc::new(OrderLifecycleCoordinator::new(
            storage.clone(),
            engine.clone(),
            ledger.clone(),
            executor,
            config.pricing.clone(),
            config.chain.network,
            config.retry.clone(),
            storage_timeout,
            metrics.clone(),
        ));

        Ok(EnergyPoolService {
            config,
            storage,
            chain,
            accountant,
            ledger,
            pool,
            engine,
            orders,
            metrics,
            status: Arc::new(RwLock::new(ServiceStatus::Initializing)),
            runner_handle: Arc::new(RwLock::new(None)),
        })
    }
}

impl<S: PoolStorage + 'static> Default for EnergyPoolServiceBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_builder_requires_storage() {
        let result = EnergyPoolServiceBuilder::<MemoryStorage>::new()
            .config(PoolConfig::development())
            .chain(Arc::new(InMemoryChain::new()))
            .build()
            .await;
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_missing_master_key() {
        let mut config = PoolConfig::development();
        config.keys.master_key_hex = String::new();

        let result = EnergyPoolServiceBuilder::new()
            .config(config)
            .storage(Arc::new(MemoryStorage::new()))
            .chain(Arc::new(InMemoryChain::new()))
            .build()
            .await;
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_builder_with_memory_components() {
        let service = EnergyPoolServiceBuilder::new()
            .config(PoolConfig::development())
            .storage(Arc::new(MemoryStorage::new()))
            .chain(Arc::new(InMemoryChain::new()))
            .build()
            .await
            .unwrap();

        assert_eq!(service.status().await, ServiceStatus::Initializing);
        assert!(service.list_accounts().await.unwrap().is_empty());
    }
}
