//! 预留账本
//!
//! 池账户容量的唯一占用记录：`reserve → confirm | release`。
//!
//! # 设计原则
//!
//! - 每次变更都是存储层的单个原子事务（批量操作同样是一个事务）
//! - 持有量与预留记录同事务更新，并发分配不会超卖同一账户
//! - 超时未确认的预留由清扫任务自动释放，记录为系统行为

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ReservationConfig;
use crate::error::{PoolError, PoolResult};
use crate::metrics::PoolMetrics;
use crate::retry::with_timeout;
use crate::storage::{HeldCapacity, PoolStorage};
use crate::types::{
    AccountId, ReleaseActor, Reservation, ReservationId, ReservationRequest, ReservationState,
    ResourceKind,
};

/// 清扫结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// 扫描的未结预留数
    pub scanned: usize,
    /// 被释放的预留
    pub released: Vec<ReservationId>,
}

/// 预留账本
pub struct ReservationLedger<S: PoolStorage> {
    storage: Arc<S>,
    ttl: chrono::Duration,
    timeout: Duration,
    metrics: Arc<PoolMetrics>,
}

impl<S: PoolStorage> ReservationLedger<S> {
    /// 创建预留账本
    pub fn new(
        storage: Arc<S>,
        config: &ReservationConfig,
        timeout: Duration,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            storage,
            ttl: chrono::Duration::seconds(config.ttl_secs as i64),
            timeout,
            metrics,
        }
    }

    /// 预留有效期
    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    // ==================== 预留 ====================

    /// 单笔预留
    pub async fn reserve(&self, request: ReservationRequest) -> PoolResult<Reservation> {
        let mut created = self.batch_reserve(&[request]).await?;
        created
            .pop()
            .ok_or_else(|| PoolError::invariant("batch reserve returned no reservation"))
    }

    /// 批量预留（全部成功或全部失败）
    pub async fn batch_reserve(
        &self,
        requests: &[ReservationRequest],
    ) -> PoolResult<Vec<Reservation>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(r) = requests.iter().find(|r| r.amount == 0) {
            return Err(PoolError::InvalidInput(format!(
                "reservation on account {} has zero amount",
                r.account_id
            )));
        }
        if let Some(r) = requests.iter().find(|r| r.amount > r.observed_capacity) {
            return Err(PoolError::CapacityExceeded {
                account_id: r.account_id,
                held: 0,
                requested: r.amount,
                observed: r.observed_capacity,
            });
        }

        let reservations: Vec<Reservation> = requests
            .iter()
            .map(|r| Reservation::from_request(r, self.ttl))
            .collect();

        with_timeout(
            "reserve_batch",
            self.timeout,
            self.storage.reserve_batch(&reservations),
        )
        .await?;

        self.metrics.reservations_created(reservations.len() as u64);
        for r in &reservations {
            debug!(
                reservation_id = %r.id,
                account_id = %r.account_id,
                kind = %r.kind,
                amount = r.amount,
                external_ref = %r.external_ref,
                "Capacity reserved"
            );
        }
        Ok(reservations)
    }

    // ==================== 确认 / 释放 ====================

    /// 记录代理交易ID
    pub async fn record_tx(&self, id: &ReservationId, tx_id: &str) -> PoolResult<()> {
        with_timeout(
            "set_reservation_tx",
            self.timeout,
            self.storage.set_reservation_tx(id, tx_id),
        )
        .await
    }

    /// 确认预留（代理已在链上生效）
    pub async fn confirm(&self, ids: &[ReservationId]) -> PoolResult<Vec<Reservation>> {
        let confirmed = self
            .transition(ids, ReservationState::Confirmed, None)
            .await?;
        self.metrics.reservations_confirmed(confirmed.len() as u64);
        if !confirmed.is_empty() {
            info!(count = confirmed.len(), "Reservations confirmed");
        }
        Ok(confirmed)
    }

    /// 释放预留
    pub async fn release(
        &self,
        ids: &[ReservationId],
        actor: ReleaseActor,
        reason: &str,
    ) -> PoolResult<Vec<Reservation>> {
        let reason = format!("{}: {}", actor, reason);
        let released = self
            .transition(ids, ReservationState::Released, Some(&reason))
            .await?;

        if actor == ReleaseActor::System {
            self.metrics.reservations_expired(released.len() as u64);
        } else {
            self.metrics.reservations_released(released.len() as u64);
        }
        for r in &released {
            info!(
                reservation_id = %r.id,
                account_id = %r.account_id,
                amount = r.amount,
                actor = %actor,
                reason = %reason,
                "Reservation released"
            );
        }
        Ok(released)
    }

    /// 释放外部引用下所有未结预留
    pub async fn release_for_ref(
        &self,
        external_ref: &str,
        actor: ReleaseActor,
        reason: &str,
    ) -> PoolResult<Vec<Reservation>> {
        let open: Vec<ReservationId> = self
            .list_by_ref(external_ref)
            .await?
            .into_iter()
            .filter(|r| r.is_open())
            .map(|r| r.id)
            .collect();
        if open.is_empty() {
            return Ok(Vec::new());
        }
        self.release(&open, actor, reason).await
    }

    async fn transition(
        &self,
        ids: &[ReservationId],
        target: ReservationState,
        reason: Option<&str>,
    ) -> PoolResult<Vec<Reservation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        with_timeout(
            "transition_reservations",
            self.timeout,
            self.storage.transition_reservations(ids, target, reason),
        )
        .await
    }

    // ==================== 超时清扫 ====================

    /// 释放所有已超时的未结预留
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> PoolResult<SweepReport> {
        let open = self.list_open().await?;
        let expired: Vec<ReservationId> = open
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();

        let mut report = SweepReport {
            scanned: open.len(),
            released: Vec::new(),
        };
        if expired.is_empty() {
            debug!(scanned = report.scanned, "No expired reservations");
            return Ok(report);
        }

        let released = self
            .release(&expired, ReleaseActor::System, "expired")
            .await?;
        report.released = released.iter().map(|r| r.id).collect();

        warn!(
            actor = "system",
            scanned = report.scanned,
            released = report.released.len(),
            "Expired reservations swept"
        );
        Ok(report)
    }

    // ==================== 查询 ====================

    pub async fn get(&self, id: &ReservationId) -> PoolResult<Reservation> {
        with_timeout("get_reservation", self.timeout, self.storage.get_reservation(id))
            .await?
            .ok_or_else(|| PoolError::ReservationNotFound(id.to_string()))
    }

    pub async fn list_by_ref(&self, external_ref: &str) -> PoolResult<Vec<Reservation>> {
        with_timeout(
            "list_reservations_by_ref",
            self.timeout,
            self.storage.list_reservations_by_ref(external_ref),
        )
        .await
    }

    pub async fn list_open(&self) -> PoolResult<Vec<Reservation>> {
        with_timeout(
            "list_open_reservations",
            self.timeout,
            self.storage.list_open_reservations(),
        )
        .await
    }

    /// 所有账户的持有量
    pub async fn held_amounts(&self) -> PoolResult<HashMap<(AccountId, ResourceKind), HeldCapacity>> {
        with_timeout("held_amounts", self.timeout, self.storage.held_amounts()).await
    }

    /// 单个账户的持有量
    pub async fn held(&self, account_id: AccountId, kind: ResourceKind) -> PoolResult<u64> {
        Ok(self
            .held_amounts()
            .await?
            .get(&(account_id, kind))
            .map(|h| h.amount)
            .unwrap_or(0))
    }

    /// 自 `since` 起已预留 + 已确认的量
    pub async fn committed_since(
        &self,
        account_id: AccountId,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> PoolResult<u64> {
        with_timeout(
            "committed_since",
            self.timeout,
            self.storage.committed_since(account_id, kind, since),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{AccountClass, AccountStatus, PoolAccount};
    use rust_decimal::Decimal;

    async fn setup(ttl_secs: u64) -> (ReservationLedger<MemoryStorage>, AccountId) {
        let storage = Arc::new(MemoryStorage::new());
        let account = storage
            .insert_account(PoolAccount {
                id: AccountId(0),
                address: "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7".to_string(),
                name: "a".to_string(),
                encrypted_key: String::new(),
                status: AccountStatus::Active,
                priority: 1,
                cost_per_unit: Decimal::ZERO,
                class: AccountClass::Own,
                daily_cap: None,
                monthly_cap: None,
                description: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let ledger = ReservationLedger::new(
            storage,
            &ReservationConfig {
                ttl_secs,
                sweep_interval_secs: 1,
            },
            Duration::from_secs(1),
            Arc::new(PoolMetrics::new()),
        );
        (ledger, account.id)
    }

    fn request(account_id: AccountId, amount: u64, external_ref: &str) -> ReservationRequest {
        ReservationRequest {
            account_id,
            kind: ResourceKind::Energy,
            amount,
            external_ref: external_ref.to_string(),
            owner: None,
            observed_capacity: 1_000,
        }
    }

    #[tokio::test]
    async fn test_reserve_release_restores_claimable() {
        let (ledger, account) = setup(3600).await;
        assert_eq!(ledger.held(account, ResourceKind::Energy).await.unwrap(), 0);

        let r = ledger.reserve(request(account, 400, "order-1")).await.unwrap();
        assert_eq!(ledger.held(account, ResourceKind::Energy).await.unwrap(), 400);

        let released = ledger
            .release(&[r.id], ReleaseActor::Order, "delegation failed")
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(ledger.held(account, ResourceKind::Energy).await.unwrap(), 0);

        // 重复释放是空操作
        let again = ledger
            .release(&[r.id], ReleaseActor::Order, "retry")
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let (ledger, account) = setup(3600).await;
        ledger.reserve(request(account, 700, "order-1")).await.unwrap();

        let result = ledger
            .batch_reserve(&[request(account, 200, "order-2"), request(account, 200, "order-2")])
            .await;
        assert!(matches!(result, Err(PoolError::CapacityExceeded { .. })));
        assert!(ledger.list_by_ref("order-2").await.unwrap().is_empty());
        assert_eq!(ledger.held(account, ResourceKind::Energy).await.unwrap(), 700);
    }

    #[tokio::test]
    async fn test_zero_amount_rejected() {
        let (ledger, account) = setup(3600).await;
        assert!(matches!(
            ledger.reserve(request(account, 0, "order-1")).await,
            Err(PoolError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_then_release_is_illegal() {
        let (ledger, account) = setup(3600).await;
        let r = ledger.reserve(request(account, 100, "order-1")).await.unwrap();
        ledger.record_tx(&r.id, "abcd").await.unwrap();
        ledger.confirm(&[r.id]).await.unwrap();

        let stored = ledger.get(&r.id).await.unwrap();
        assert_eq!(stored.state, ReservationState::Confirmed);
        assert_eq!(stored.tx_id.as_deref(), Some("abcd"));

        assert!(matches!(
            ledger.release(&[r.id], ReleaseActor::Operator, "late").await,
            Err(PoolError::StateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_as_system() {
        let (ledger, account) = setup(60).await;
        let r = ledger.reserve(request(account, 100, "order-1")).await.unwrap();

        let report = ledger.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert!(report.released.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let report = ledger.sweep_expired(later).await.unwrap();
        assert_eq!(report.released, vec![r.id]);

        let stored = ledger.get(&r.id).await.unwrap();
        assert_eq!(stored.state, ReservationState::Released);
        assert_eq!(stored.release_reason.as_deref(), Some("system: expired"));
        assert_eq!(ledger.held(account, ResourceKind::Energy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_for_ref() {
        let (ledger, account) = setup(3600).await;
        ledger
            .batch_reserve(&[request(account, 100, "order-1"), request(account, 50, "order-1")])
            .await
            .unwrap();
        ledger.reserve(request(account, 10, "order-2")).await.unwrap();

        let released = ledger
            .release_for_ref("order-1", ReleaseActor::Order, "cancelled")
            .await
            .unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(ledger.held(account, ResourceKind::Energy).await.unwrap(), 10);
    }
}
