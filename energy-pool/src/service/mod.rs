//! Energy Pool Service Layer
//!
//! 整合所有组件，提供完整的能量池服务。
//!
//! # 核心功能
//!
//! - 池账户管理与实时统计
//! - 支付 → 订单 → 分配 → 代理 的完整流程
//! - 后台订单 worker 与预留超时清扫
//!
//! # 使用示例
//!
//! ```rust,ignore
//! use energy_pool::{EnergyPoolService, PoolConfig, SledStorage, TronHttpClient};
//!
//! async fn example() -> PoolResult<()> {
//!     let config = PoolConfig::from_env();
//!     let service = EnergyPoolService::builder()
//!         .storage(Arc::new(SledStorage::new(&StorageConfig::from_env())?))
//!         .chain(Arc::new(TronHttpClient::new(config.chain.clone())?))
//!         .config(config)
//!         .build()
//!         .await?;
//!
//!     service.start().await?;
//!     service.submit_payment(PaymentEvent::new(from, amount, tx_hash, "mainnet")).await?;
//! }
//! ```

mod builder;
mod runner;

pub use builder::EnergyPoolServiceBuilder;
pub use runner::{BackgroundRunner, RunnerHandle};

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::accountant::ResourceAccountant;
use crate::allocation::AllocationEngine;
use crate::chain::ChainClient;
use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::ledger::{ReservationLedger, SweepReport};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::order::OrderLifecycleCoordinator;
use crate::pool::{AccountPoolManager, PoolStatistics};
use crate::storage::{PoolStorage, StorageStats};
use crate::types::{
    AccountId, AccountStatus, AccountUpdate, NewAccount, Order, OrderId, OrderStatus, PaymentEvent,
    PoolAccount, Reservation, ResourceKind, ResourceSnapshot,
};

/// 服务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// 已构建，后台任务未启动
    Initializing,
    /// 运行中
    Running,
    /// 已停止
    Stopped,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// 能量池服务
pub struct EnergyPoolService<S: PoolStorage + 'static> {
    config: PoolConfig,
    storage: Arc<S>,
    chain: Arc<dyn ChainClient>,
    accountant: Arc<ResourceAccountant>,
    ledger: Arc<ReservationLedger<S>>,
    pool: Arc<AccountPoolManager<S>>,
    engine: Arc<AllocationEngine<S>>,
    orders: Arc<OrderLifecycleCoordinator<S>>,
    metrics: Arc<PoolMetrics>,
    status: Arc<RwLock<ServiceStatus>>,
    runner_handle: Arc<RwLock<Option<RunnerHandle>>>,
}

impl<S: PoolStorage + 'static> EnergyPoolService<S> {
    /// 使用 Builder 创建服务
    pub fn builder() -> EnergyPoolServiceBuilder<S> {
        EnergyPoolServiceBuilder::new()
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    // ==================== 账户管理 ====================

    pub async fn list_accounts(&self) -> PoolResult<Vec<PoolAccount>> {
        self.pool.list_accounts().await
    }

    pub async fn get_account(&self, id: AccountId) -> PoolResult<PoolAccount> {
        self.pool.get_account(id).await
    }

    pub async fn add_account(&self, new_account: NewAccount) -> PoolResult<PoolAccount> {
        self.pool.add_account(new_account).await
    }

    pub async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> PoolResult<PoolAccount> {
        self.pool.set_account_status(id, status).await
    }

    pub async fn batch_update_status(
        &self,
        ids: &[AccountId],
        status: AccountStatus,
    ) -> PoolResult<Vec<PoolAccount>> {
        self.pool.batch_update(ids, status).await
    }

    pub async fn update_account(
        &self,
        id: AccountId,
        update: &AccountUpdate,
    ) -> PoolResult<PoolAccount> {
        self.pool.update_account(id, update).await
    }

    pub async fn remove_account(&self, id: AccountId) -> PoolResult<()> {
        self.pool.remove_account(id).await
    }

    /// 实时池统计（来自链上快照）
    pub async fn get_pool_statistics(&self, kind: ResourceKind) -> PoolResult<PoolStatistics> {
        self.pool.get_pool_statistics(kind).await
    }

    /// 单个账户的实时快照
    pub async fn account_snapshots(&self, id: AccountId) -> PoolResult<Vec<ResourceSnapshot>> {
        let account = self.pool.get_account(id).await?;
        self.accountant.snapshot_all(&account.address).await
    }

    // ==================== 订单 ====================

    /// 同步处理支付（调用方等待订单结束）
    pub async fn create_order_from_payment(&self, payment: PaymentEvent) -> PoolResult<Order> {
        self.orders.create_order_from_payment(payment).await
    }

    /// 把支付交给后台 worker 处理
    pub async fn submit_payment(&self, payment: PaymentEvent) -> PoolResult<()> {
        let handle = self.runner_handle.read().await;
        match handle.as_ref() {
            Some(handle) => handle.submit(payment).await,
            None => Err(PoolError::InvalidInput("service is not running".to_string())),
        }
    }

    pub async fn cancel_order(&self, id: &OrderId, reason: &str) -> PoolResult<Order> {
        self.orders.cancel_order(id, reason).await
    }

    pub async fn get_order(&self, id: &OrderId) -> PoolResult<Order> {
        self.orders.get_order(id).await
    }

    pub async fn get_order_by_ref(&self, payment_tx_ref: &str) -> PoolResult<Option<Order>> {
        self.orders.get_order_by_ref(payment_tx_ref).await
    }

    pub async fn list_orders(&self, status: OrderStatus) -> PoolResult<Vec<Order>> {
        self.orders.list_orders(status).await
    }

    pub async fn resume_pending(&self) -> PoolResult<Vec<Order>> {
        self.orders.resume_pending().await
    }

    // ==================== 预留 ====================

    pub async fn list_open_reservations(&self) -> PoolResult<Vec<Reservation>> {
        self.ledger.list_open().await
    }

    /// 立即执行一次超时清扫
    pub async fn sweep_expired(&self) -> PoolResult<SweepReport> {
        self.ledger.sweep_expired(Utc::now()).await
    }

    // ==================== 运维 ====================

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn storage_stats(&self) -> PoolResult<StorageStats> {
        self.storage.get_stats().await
    }

    /// 恢复未完成订单并启动后台任务
    pub async fn start(&self) -> PoolResult<()> {
        let mut runner_handle = self.runner_handle.write().await;
        if runner_handle.is_some() {
            return Err(PoolError::InvalidInput("service already running".to_string()));
        }
        info!("Starting energy pool service...");

        match self.orders.resume_pending().await {
            Ok(resumed) if !resumed.is_empty() => {
                info!(count = resumed.len(), "Resumed pending orders");
            }
            Ok(_) => {}
            Err(e) => error!("Failed to resume pending orders: {}", e),
        }

        let runner = BackgroundRunner::new(
            self.orders.clone(),
            self.ledger.clone(),
            self.config.workers,
            self.config.reservation.sweep_interval_secs,
        );
        *runner_handle = Some(runner.start().await);
        *self.status.write().await = ServiceStatus::Running;

        info!(workers = self.config.workers, "Energy pool service started");
        Ok(())
    }

    /// 停止后台任务（已接收的支付处理完后退出）
    pub async fn stop(&self) -> PoolResult<()> {
        let handle = self.runner_handle.write().await.take();
        if let Some(handle) = handle {
            info!("Stopping energy pool service...");
            handle.stop().await;
        }
        *self.status.write().await = ServiceStatus::Stopped;
        info!("Energy pool service stopped");
        Ok(())
    }

    // ==================== 组件访问 ====================

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn chain(&self) -> &Arc<dyn ChainClient> {
        &self.chain
    }

    pub fn ledger(&self) -> &Arc<ReservationLedger<S>> {
        &self.ledger
    }

    pub fn pool(&self) -> &Arc<AccountPoolManager<S>> {
        &self.pool
    }

    pub fn engine(&self) -> &Arc<AllocationEngine<S>> {
        &self.engine
    }

    pub fn orders(&self) -> &Arc<OrderLifecycleCoordinator<S>> {
        &self.orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use crate::config::ResourceRatio;
    use crate::storage::MemoryStorage;
    use crate::types::SUN_PER_TRX;

    const POOL: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";
    const PAYER: &str = "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf";
    const KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    async fn service() -> (EnergyPoolService<MemoryStorage>, Arc<InMemoryChain>) {
        let mut config = PoolConfig::development();
        config.ratio = ResourceRatio {
            energy_per_trx: SUN_PER_TRX,
            bandwidth_per_trx: SUN_PER_TRX,
        };
        config.pricing.price_per_unit_sun = 1_000_000;
        config.pricing.resource_per_unit = 100;

        let chain = Arc::new(InMemoryChain::new());
        chain.fund(POOL, ResourceKind::Energy, 1_000).await;

        let service = EnergyPoolService::builder()
            .config(config)
            .storage(Arc::new(MemoryStorage::new()))
            .chain(chain.clone())
            .build()
            .await
            .unwrap();
        service
            .add_account(NewAccount::new(POOL, KEY).with_priority(1))
            .await
            .unwrap();
        (service, chain)
    }

    #[tokio::test]
    async fn test_synchronous_order() {
        let (service, chain) = service().await;

        let order = service
            .create_order_from_payment(PaymentEvent::new(PAYER, 3_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(chain.delegated_to(PAYER, ResourceKind::Energy).await, 300);

        let stats = service
            .get_pool_statistics(ResourceKind::Energy)
            .await
            .unwrap();
        assert_eq!(stats.available_capacity, 700);

        let metrics = service.metrics();
        assert_eq!(metrics.orders_completed, 1);
        assert_eq!(metrics.legs_delegated, 1);
    }

    #[tokio::test]
    async fn test_background_workers() {
        let (service, chain) = service().await;
        assert!(service.submit_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-0", "nile")).await.is_err());

        service.start().await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Running);

        service
            .submit_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        service
            .submit_payment(PaymentEvent::new(PAYER, 2_000_000, "tx-2", "nile"))
            .await
            .unwrap();
        // 重复支付
        service
            .submit_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"))
            .await
            .unwrap();

        service.stop().await.unwrap();
        assert_eq!(service.status().await, ServiceStatus::Stopped);

        assert_eq!(chain.delegated_to(PAYER, ResourceKind::Energy).await, 300);
        assert_eq!(service.list_orders(OrderStatus::Completed).await.unwrap().len(), 2);
        assert!(service.list_open_reservations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_releases_orphaned_holds() {
        let (service, _chain) = service().await;
        let account = service.list_accounts().await.unwrap().remove(0);

        service
            .ledger()
            .reserve(crate::types::ReservationRequest {
                account_id: account.id,
                kind: ResourceKind::Energy,
                amount: 100,
                external_ref: "orphan".to_string(),
                owner: None,
                observed_capacity: 1_000,
            })
            .await
            .unwrap();

        let report = service
            .ledger()
            .sweep_expired(Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!(report.released.len(), 1);
        assert_eq!(service.metrics().reservations_expired, 1);

        assert!(service.sweep_expired().await.unwrap().released.is_empty());
    }
}
