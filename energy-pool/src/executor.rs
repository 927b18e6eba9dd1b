//! 代理执行器
//!
//! 按分配分项逐一在链上代理资源。每个分项：
//!
//! 1. 解密该账户的签名密钥，得到仅在本次调用内有效的 [`ScopedSigner`]
//! 2. 提交前重新核对链上可领取量（规划后链上状态可能已变化）
//! 3. 提交代理交易，意图ID 使用预留ID，传输失败可安全重试
//! 4. 链上拒绝不自动重试，原因返回给调用方以便换账户重新规划
//!
//! 预留已不再 reserved（被清扫或被取消释放）的分项不提交。
//! 提交成功但预留无法记录交易时，立即在链上回收。
//!
//! 资源单位到 SUN 的换算与快照使用同一个 [`ResourceConverter`](crate::accountant::ResourceConverter)。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::accountant::ResourceAccountant;
use crate::chain::{ChainClient, DelegationRequest, SubmitOutcome};
use crate::config::PoolConfig;
use crate::error::{ErrorClass, PoolError, PoolResult};
use crate::keys::KeyVault;
use crate::ledger::ReservationLedger;
use crate::metrics::PoolMetrics;
use crate::retry::{retry_external, with_timeout, RetryStrategy};
use crate::storage::PoolStorage;
use crate::types::{AccountId, AllocationLeg, PoolAccount, ReservationId, ResourceKind};

/// 分项执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LegOutcome {
    /// 链上已接受
    Delegated { tx_id: String },
    /// 链上拒绝（或提交前核对未通过）
    Rejected { reason: String },
    /// 传输失败，重试耗尽
    Failed { reason: String },
}

impl LegOutcome {
    pub fn is_delegated(&self) -> bool {
        matches!(self, LegOutcome::Delegated { .. })
    }
}

/// 单个分项的交易结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub address: String,
    pub amount: u64,
    pub amount_sun: u64,
    pub outcome: LegOutcome,
}

/// 一轮执行的结果
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// 已执行分项的结果（按执行顺序）
    pub results: Vec<TxResult>,
    /// 中止本轮的非链上错误；此前分项的结果仍在 `results` 中
    pub error: Option<PoolError>,
}

/// 代理执行器
pub struct DelegationExecutor<S: PoolStorage> {
    storage: Arc<S>,
    chain: Arc<dyn ChainClient>,
    accountant: Arc<ResourceAccountant>,
    ledger: Arc<ReservationLedger<S>>,
    vault: Arc<KeyVault>,
    metrics: Arc<PoolMetrics>,
    lock: bool,
    lock_period: Option<u64>,
    retry: RetryStrategy,
    max_attempts: u32,
    chain_timeout: Duration,
    storage_timeout: Duration,
}

impl<S: PoolStorage> DelegationExecutor<S> {
    /// 创建执行器
    pub fn new(
        storage: Arc<S>,
        chain: Arc<dyn ChainClient>,
        accountant: Arc<ResourceAccountant>,
        ledger: Arc<ReservationLedger<S>>,
        vault: Arc<KeyVault>,
        config: &PoolConfig,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            storage,
            chain,
            accountant,
            ledger,
            vault,
            metrics,
            lock: config.chain.lock,
            lock_period: config.chain.lock_period,
            retry: RetryStrategy::from_config(&config.retry),
            max_attempts: config.retry.max_attempts,
            chain_timeout: config.chain_timeout(),
            storage_timeout: config.storage_timeout(),
        }
    }

    /// 依次执行分项
    ///
    /// 拒绝的分项不影响后续分项；出现传输失败或内部错误时立即停止，
    /// 剩余分项不提交。已代理分项的结果总是返回给调用方记账。
    pub async fn execute(
        &self,
        legs: &[AllocationLeg],
        kind: ResourceKind,
        receiver: &str,
    ) -> ExecutionReport {
        let mut report = ExecutionReport {
            results: Vec::with_capacity(legs.len()),
            error: None,
        };
        for leg in legs {
            match self.delegate_leg(leg, kind, receiver).await {
                Ok(result) => {
                    let stop = matches!(result.outcome, LegOutcome::Failed { .. });
                    report.results.push(result);
                    if stop {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        reservation_id = %leg.reservation_id,
                        account_id = %leg.account_id,
                        completed = report.results.len(),
                        "Leg execution aborted: {}",
                        e
                    );
                    report.error = Some(e);
                    break;
                }
            }
        }
        report
    }

    /// 代理单个分项
    pub async fn delegate_leg(
        &self,
        leg: &AllocationLeg,
        kind: ResourceKind,
        receiver: &str,
    ) -> PoolResult<TxResult> {
        let amount_sun = self.accountant.converter().units_to_sun(leg.amount, kind);
        let result = |outcome| TxResult {
            reservation_id: leg.reservation_id,
            account_id: leg.account_id,
            address: leg.address.clone(),
            amount: leg.amount,
            amount_sun,
            outcome,
        };

        // 重启恢复：交易已记录则不再提交
        let reservation = self.ledger.get(&leg.reservation_id).await?;
        if let Some(tx_id) = reservation.tx_id {
            debug!(reservation_id = %leg.reservation_id, tx_id = %tx_id, "Leg already delegated");
            return Ok(result(LegOutcome::Delegated { tx_id }));
        }
        if !reservation.is_open() {
            self.metrics.leg_rejected();
            let reason = format!("reservation {} is {}", reservation.id, reservation.state);
            warn!(
                reservation_id = %leg.reservation_id,
                account_id = %leg.account_id,
                "Leg not submitted: {}",
                reason
            );
            return Ok(result(LegOutcome::Rejected { reason }));
        }

        let account = self.load_account(leg.account_id).await?;

        match self.accountant.snapshot(&account.address, kind).await {
            Ok(snapshot) if snapshot.claimable_base() < leg.amount => {
                self.metrics.leg_rejected();
                let reason = format!(
                    "claimable balance insufficient: observed {}, required {}",
                    snapshot.claimable_base(),
                    leg.amount
                );
                warn!(
                    reservation_id = %leg.reservation_id,
                    account_id = %leg.account_id,
                    "Pre-submit check failed: {}",
                    reason
                );
                return Ok(result(LegOutcome::Rejected { reason }));
            }
            Ok(_) => {}
            Err(e) if e.class() == ErrorClass::ExternalService => {
                return Ok(result(LegOutcome::Failed {
                    reason: e.to_string(),
                }));
            }
            Err(e) => return Err(e),
        }

        let request = DelegationRequest {
            intent_id: leg.reservation_id,
            from: account.address.clone(),
            to: receiver.to_string(),
            amount_sun,
            kind,
            lock: self.lock,
            lock_period: self.lock_period,
        };

        let signer = self.vault.activate(&account)?;
        let (signer_ref, request_ref, this) = (&signer, &request, self);
        let submitted = retry_external(
            "submit_delegation",
            &self.retry,
            self.max_attempts,
            move || async move {
                this.metrics.leg_submitted();
                with_timeout(
                    "submit_delegation",
                    this.chain_timeout,
                    this.chain.submit_delegation(signer_ref, request_ref),
                )
                .await
            },
        )
        .await;
        drop(signer);

        let outcome = match submitted {
            Ok(SubmitOutcome::Accepted(receipt)) => {
                if let Err(e) = self.ledger.record_tx(&leg.reservation_id, &receipt.tx_id).await {
                    let outcome = self
                        .reclaim_unrecorded(leg, kind, receiver, &receipt.tx_id, e)
                        .await;
                    return Ok(result(outcome));
                }
                self.metrics.leg_delegated();
                info!(
                    reservation_id = %leg.reservation_id,
                    account_id = %leg.account_id,
                    receiver = %receiver,
                    kind = %kind,
                    amount = leg.amount,
                    amount_sun,
                    tx_id = %receipt.tx_id,
                    "Resource delegated"
                );
                LegOutcome::Delegated {
                    tx_id: receipt.tx_id,
                }
            }
            Ok(SubmitOutcome::Rejected { reason }) => {
                self.metrics.leg_rejected();
                warn!(
                    reservation_id = %leg.reservation_id,
                    account_id = %leg.account_id,
                    "Delegation rejected by chain: {}",
                    reason
                );
                LegOutcome::Rejected { reason }
            }
            Err(e) if e.class() == ErrorClass::ExternalService => {
                warn!(
                    reservation_id = %leg.reservation_id,
                    account_id = %leg.account_id,
                    "Delegation submission failed: {}",
                    e
                );
                LegOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(e) => return Err(e),
        };

        Ok(result(outcome))
    }

    /// 回收已代理的分项
    ///
    /// 与代理使用同一意图ID与换算；传输失败重试耗尽后以错误返回。
    pub async fn undelegate(
        &self,
        leg: &AllocationLeg,
        kind: ResourceKind,
        receiver: &str,
    ) -> PoolResult<SubmitOutcome> {
        let account = self.load_account(leg.account_id).await?;
        let request = DelegationRequest {
            intent_id: leg.reservation_id,
            from: account.address.clone(),
            to: receiver.to_string(),
            amount_sun: self.accountant.converter().units_to_sun(leg.amount, kind),
            kind,
            lock: false,
            lock_period: None,
        };

        let signer = self.vault.activate(&account)?;
        let (signer_ref, request_ref, this) = (&signer, &request, self);
        let submitted = retry_external(
            "submit_undelegation",
            &self.retry,
            self.max_attempts,
            move || async move {
                with_timeout(
                    "submit_undelegation",
                    this.chain_timeout,
                    this.chain.submit_undelegation(signer_ref, request_ref),
                )
                .await
            },
        )
        .await;
        drop(signer);

        match submitted? {
            SubmitOutcome::Accepted(receipt) => {
                self.metrics.undelegated();
                info!(
                    reservation_id = %leg.reservation_id,
                    account_id = %leg.account_id,
                    receiver = %receiver,
                    tx_id = %receipt.tx_id,
                    "Resource undelegated"
                );
                Ok(SubmitOutcome::Accepted(receipt))
            }
            SubmitOutcome::Rejected { reason } => {
                warn!(
                    reservation_id = %leg.reservation_id,
                    account_id = %leg.account_id,
                    "Undelegation rejected by chain: {}",
                    reason
                );
                Ok(SubmitOutcome::Rejected { reason })
            }
        }
    }

    /// 链上已接受但预留无法记录交易：立即回收
    ///
    /// 回收成功按拒绝处理（调用方换账户重新规划）；回收失败时仍按已代理
    /// 返回，让代理记在订单上，由订单的补偿流程继续回收。
    async fn reclaim_unrecorded(
        &self,
        leg: &AllocationLeg,
        kind: ResourceKind,
        receiver: &str,
        tx_id: &str,
        cause: PoolError,
    ) -> LegOutcome {
        warn!(
            reservation_id = %leg.reservation_id,
            account_id = %leg.account_id,
            tx_id = %tx_id,
            "Delegation accepted but not recorded, reclaiming: {}",
            cause
        );
        let failure = match self.undelegate(leg, kind, receiver).await {
            Ok(SubmitOutcome::Accepted(_)) => {
                self.metrics.leg_rejected();
                return LegOutcome::Rejected {
                    reason: format!("delegation reclaimed: {}", cause),
                };
            }
            Ok(SubmitOutcome::Rejected { reason }) => reason,
            Err(e) => e.to_string(),
        };
        error!(
            alert = "undelegation",
            reservation_id = %leg.reservation_id,
            account_id = %leg.account_id,
            tx_id = %tx_id,
            "Unrecorded delegation could not be reclaimed: {}",
            failure
        );
        LegOutcome::Delegated {
            tx_id: tx_id.to_string(),
        }
    }

    async fn load_account(&self, id: AccountId) -> PoolResult<PoolAccount> {
        with_timeout("get_account", self.storage_timeout, self.storage.get_account(id))
            .await?
            .ok_or(PoolError::AccountNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::ResourceConverter;
    use crate::chain::InMemoryChain;
    use crate::config::ResourceRatio;
    use crate::storage::MemoryStorage;
    use crate::keys::ScopedSigner;
    use crate::types::{
        AccountClass, AccountResources, AccountStatus, LegStatus, ReleaseActor,
        ReservationRequest, ReservationState, SUN_PER_TRX,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    const POOL: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";
    const USER: &str = "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf";
    const OTHER: &str = "TMuA6YqfCeX8EhbfYEg5y7S4DqzSJireY9";
    const KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    struct Fixture {
        chain: Arc<InMemoryChain>,
        storage: Arc<MemoryStorage>,
        ledger: Arc<ReservationLedger<MemoryStorage>>,
        executor: DelegationExecutor<MemoryStorage>,
        account: PoolAccount,
    }

    /// 提交时先释放对应预留（模拟清扫与提交并发）
    struct ReleasingChain {
        inner: Arc<InMemoryChain>,
        ledger: Arc<ReservationLedger<MemoryStorage>>,
    }

    #[async_trait]
    impl ChainClient for ReleasingChain {
        async fn resource_usage(&self, address: &str) -> PoolResult<AccountResources> {
            self.inner.resource_usage(address).await
        }

        async fn delegatable(&self, address: &str, kind: ResourceKind) -> PoolResult<u64> {
            self.inner.delegatable(address, kind).await
        }

        async fn submit_delegation(
            &self,
            signer: &ScopedSigner,
            request: &DelegationRequest,
        ) -> PoolResult<SubmitOutcome> {
            self.ledger
                .release(&[request.intent_id], ReleaseActor::System, "expired")
                .await?;
            self.inner.submit_delegation(signer, request).await
        }

        async fn submit_undelegation(
            &self,
            signer: &ScopedSigner,
            request: &DelegationRequest,
        ) -> PoolResult<SubmitOutcome> {
            self.inner.submit_undelegation(signer, request).await
        }
    }

    async fn fixture(staked: u64) -> Fixture {
        fixture_with(staked, false).await
    }

    async fn fixture_with(staked: u64, release_on_submit: bool) -> Fixture {
        let mut config = PoolConfig::development();
        config.ratio = ResourceRatio {
            energy_per_trx: SUN_PER_TRX,
            bandwidth_per_trx: SUN_PER_TRX,
        };
        config.retry.initial_delay_ms = 1;
        config.retry.max_delay_ms = 5;

        let chain = Arc::new(InMemoryChain::new());
        chain.fund(POOL, ResourceKind::Energy, staked).await;

        let storage = Arc::new(MemoryStorage::new());
        let metrics = Arc::new(PoolMetrics::new());
        let vault = Arc::new(KeyVault::new(&config.keys).unwrap());
        let accountant = Arc::new(ResourceAccountant::new(
            chain.clone(),
            ResourceConverter::new(config.ratio),
            config.chain_timeout(),
        ));
        let ledger = Arc::new(ReservationLedger::new(
            storage.clone(),
            &config.reservation,
            config.storage_timeout(),
            metrics.clone(),
        ));

        let account = storage
            .insert_account(PoolAccount {
                id: AccountId(0),
                address: POOL.to_string(),
                name: "pool".to_string(),
                encrypted_key: vault.encrypt_key(KEY).unwrap(),
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

        let client: Arc<dyn ChainClient> = if release_on_submit {
            Arc::new(ReleasingChain {
                inner: chain.clone(),
                ledger: ledger.clone(),
            })
        } else {
            chain.clone()
        };
        let executor = DelegationExecutor::new(
            storage.clone(),
            client,
            accountant,
            ledger.clone(),
            vault,
            &config,
            metrics,
        );
        Fixture {
            chain,
            storage,
            ledger,
            executor,
            account,
        }
    }

    async fn planned_leg(f: &Fixture, amount: u64) -> AllocationLeg {
        planned_leg_on(f, &f.account, amount).await
    }

    async fn planned_leg_on(f: &Fixture, account: &PoolAccount, amount: u64) -> AllocationLeg {
        let reservation = f
            .ledger
            .reserve(ReservationRequest {
                account_id: account.id,
                kind: ResourceKind::Energy,
                amount,
                external_ref: "order-1".to_string(),
                owner: Some(USER.to_string()),
                observed_capacity: 1_000,
            })
            .await
            .unwrap();
        AllocationLeg {
            reservation_id: reservation.id,
            account_id: account.id,
            address: account.address.clone(),
            amount,
            status: LegStatus::Planned,
            tx_id: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_delegation_records_tx() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;

        let report = f
            .executor
            .execute(&[leg.clone()], ResourceKind::Energy, USER)
            .await;
        assert!(report.error.is_none());
        let results = report.results;
        assert_eq!(results.len(), 1);
        assert!(results[0].outcome.is_delegated());
        assert_eq!(results[0].amount_sun, 400);

        assert_eq!(f.chain.delegated_to(USER, ResourceKind::Energy).await, 400);
        let reservation = f.ledger.get(&leg.reservation_id).await.unwrap();
        assert!(reservation.tx_id.is_some());
        assert_eq!(reservation.state, ReservationState::Reserved);
    }

    #[tokio::test]
    async fn test_chain_rejection_not_retried() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;
        f.chain
            .reject_next(POOL, "claimable balance insufficient")
            .await;

        let result = f
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert_eq!(
            result.outcome,
            LegOutcome::Rejected {
                reason: "claimable balance insufficient".to_string()
            }
        );
        assert_eq!(f.chain.submission_count().await, 1);
        assert!(f.chain.delegations().await.is_empty());
    }

    #[tokio::test]
    async fn test_precheck_blocks_submission() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;
        // 规划之后链上可代理量下降
        f.chain.set_delegatable(POOL, ResourceKind::Energy, 100).await;

        let result = f
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert!(matches!(result.outcome, LegOutcome::Rejected { .. }));
        assert_eq!(f.chain.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once_delegated() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;
        f.chain.fail_submissions(1).await;

        let result = f
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert!(result.outcome.is_delegated());
        assert_eq!(f.chain.submission_count().await, 2);
        assert_eq!(f.chain.delegations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_transport_stops_execution() {
        let f = fixture(1_000).await;
        let first = planned_leg(&f, 100).await;
        let second = planned_leg(&f, 100).await;
        f.chain.fail_submissions(10).await;

        let report = f
            .executor
            .execute(&[first, second], ResourceKind::Energy, USER)
            .await;
        assert!(report.error.is_none());
        assert_eq!(report.results.len(), 1);
        assert!(matches!(report.results[0].outcome, LegOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_released_reservation_not_submitted() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;
        f.ledger
            .release(&[leg.reservation_id], ReleaseActor::System, "expired")
            .await
            .unwrap();

        let result = f
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert!(matches!(result.outcome, LegOutcome::Rejected { .. }));
        assert_eq!(f.chain.submission_count().await, 0);
        assert_eq!(f.chain.delegated_to(USER, ResourceKind::Energy).await, 0);
    }

    #[tokio::test]
    async fn test_internal_error_keeps_earlier_results() {
        let f = fixture(1_000).await;
        f.chain.fund(OTHER, ResourceKind::Energy, 1_000).await;
        let broken = f
            .storage
            .insert_account(PoolAccount {
                address: OTHER.to_string(),
                encrypted_key: "00".repeat(40),
                ..f.account.clone()
            })
            .await
            .unwrap();

        let first = planned_leg(&f, 300).await;
        let second = planned_leg_on(&f, &broken, 300).await;
        let report = f
            .executor
            .execute(&[first.clone(), second], ResourceKind::Energy, USER)
            .await;

        assert!(matches!(report.error, Some(PoolError::SigningKey(_))));
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].reservation_id, first.reservation_id);
        assert!(report.results[0].outcome.is_delegated());
        assert_eq!(f.chain.delegated_to(USER, ResourceKind::Energy).await, 300);
    }

    #[tokio::test]
    async fn test_unrecorded_delegation_reclaimed() {
        let f = fixture_with(1_000, true).await;
        let leg = planned_leg(&f, 400).await;

        let result = f
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert!(matches!(result.outcome, LegOutcome::Rejected { .. }));
        assert_eq!(f.chain.delegated_to(USER, ResourceKind::Energy).await, 0);
        assert_eq!(
            f.chain.delegatable(POOL, ResourceKind::Energy).await.unwrap(),
            1_000
        );
        let reservation = f.ledger.get(&leg.reservation_id).await.unwrap();
        assert_eq!(reservation.state, ReservationState::Released);
        assert!(reservation.tx_id.is_none());
    }

    #[tokio::test]
    async fn test_resumed_leg_not_resubmitted() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;

        f.executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        let again = f
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert!(again.outcome.is_delegated());
        assert_eq!(f.chain.submission_count().await, 1);
    }

    #[tokio::test]
    async fn test_undelegate_restores_balance() {
        let f = fixture(1_000).await;
        let leg = planned_leg(&f, 400).await;
        f.executor
            .delegate_leg(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();

        let outcome = f
            .executor
            .undelegate(&leg, ResourceKind::Energy, USER)
            .await
            .unwrap();
        assert!(outcome.tx_id().is_some());
        assert_eq!(f.chain.delegated_to(USER, ResourceKind::Energy).await, 0);
        assert_eq!(
            f.chain.delegatable(POOL, ResourceKind::Energy).await.unwrap(),
            1_000
        );
    }
}
