//! 订单生命周期协调器
//!
//! 驱动闪租订单完成整个处理闭环：
//! ```text
//! received → validated → calculated → allocated → delegated → completed
//! ```
//!
//! # 设计原则
//!
//! - 每一步完成后立即持久化（乐观锁），崩溃后可从最后状态恢复
//! - 同一支付哈希最多一个订单，重复支付继续处理或直接拒绝
//! - 失败原因面向用户记录在订单上，详细错误记录在审计轨迹中
//! - 代理后的失败或取消先回收链上资源，再释放预留
//! - 取消先以版本号认领订单，认领失败不产生任何副作用

pub mod idempotency;
pub mod pricing;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::allocation::{AllocationEngine, AllocationOutcome, AllocationPlan, AllocationRequest};
use crate::chain::SubmitOutcome;
use crate::config::{PricingConfig, RetryConfig, TronNetwork};
use crate::error::{ErrorClass, PoolError, PoolResult};
use crate::executor::{DelegationExecutor, ExecutionReport, LegOutcome};
use crate::ledger::ReservationLedger;
use crate::metrics::PoolMetrics;
use crate::retry::with_timeout;
use crate::storage::PoolStorage;
use crate::types::{
    AccountId, LegStatus, Order, OrderId, OrderStatus, PaymentEvent, ReleaseActor, ReservationId,
};

pub use idempotency::{IntakeCheck, IntakeChecker};
pub use pricing::{calculate, validate_payment};

/// 订单生命周期协调器
pub struct OrderLifecycleCoordinator<S: PoolStorage> {
    storage: Arc<S>,
    engine: Arc<AllocationEngine<S>>,
    ledger: Arc<ReservationLedger<S>>,
    executor: Arc<DelegationExecutor<S>>,
    intake: IntakeChecker<S>,
    pricing: PricingConfig,
    network: TronNetwork,
    retry: RetryConfig,
    timeout: Duration,
    metrics: Arc<PoolMetrics>,
}

impl<S: PoolStorage> OrderLifecycleCoordinator<S> {
    /// 创建协调器
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<S>,
        engine: Arc<AllocationEngine<S>>,
        ledger: Arc<ReservationLedger<S>>,
        executor: Arc<DelegationExecutor<S>>,
        pricing: PricingConfig,
        network: TronNetwork,
        retry: RetryConfig,
        timeout: Duration,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        let intake = IntakeChecker::new(storage.clone(), timeout);
        Self {
            storage,
            engine,
            ledger,
            executor,
            intake,
            pricing,
            network,
            retry,
            timeout,
            metrics,
        }
    }

    // ==================== 入口 ====================

    /// 由支付事件创建（或继续处理）订单
    ///
    /// - 新支付：持久化 `received` 订单后开始处理
    /// - 已有进行中的订单：继续处理该订单
    /// - 已有终态订单：返回 `DuplicateOrder`，无任何副作用
    pub async fn create_order_from_payment(&self, payment: PaymentEvent) -> PoolResult<Order> {
        match self.intake.check(&payment.payment_tx_ref).await? {
            IntakeCheck::Terminal(existing) => return Err(self.duplicate(&existing)),
            IntakeCheck::Resume(existing) => {
                self.metrics.order_resumed();
                info!(
                    order_id = %existing.id,
                    status = %existing.status,
                    payment_tx_ref = %payment.payment_tx_ref,
                    "Duplicate payment, resuming order"
                );
                return self.process(existing).await;
            }
            IntakeCheck::NotExists => {}
        }

        let order = Order::from_payment(
            &payment,
            self.pricing.resource_kind,
            self.pricing.duration_secs,
        );
        match with_timeout("insert_order", self.timeout, self.storage.insert_order(&order)).await {
            Ok(()) => {}
            Err(PoolError::DuplicateOrder { .. }) => {
                // 并发的重复支付抢先插入
                return match self.intake.check(&payment.payment_tx_ref).await? {
                    IntakeCheck::Resume(existing) => {
                        self.metrics.order_resumed();
                        self.process(existing).await
                    }
                    IntakeCheck::Terminal(existing) => Err(self.duplicate(&existing)),
                    IntakeCheck::NotExists => Err(PoolError::invariant(format!(
                        "order for payment {} vanished after duplicate insert",
                        payment.payment_tx_ref
                    ))),
                };
            }
            Err(e) => return Err(e),
        }

        self.metrics.order_received();
        info!(
            order_id = %order.id,
            payment_tx_ref = %order.external_ref,
            amount_sun = order.payment_amount_sun,
            target = %order.target_address,
            "Order received"
        );
        self.process(order).await
    }

    fn duplicate(&self, existing: &Order) -> PoolError {
        self.metrics.order_duplicate();
        warn!(
            order_id = %existing.id,
            status = %existing.status,
            "Duplicate payment for settled order rejected"
        );
        PoolError::DuplicateOrder {
            external_ref: existing.external_ref.clone(),
            order_id: existing.id.to_string(),
            status: existing.status.to_string(),
        }
    }

    /// 推进订单直到终态
    ///
    /// 可能失败的步骤会把订单置为 `failed` 并返回 `Ok`；
    /// 只有存储不可用等意外情况以错误返回。
    /// 另一个 worker 已接手该订单时，返回存储中的当前订单。
    pub async fn process(&self, order: Order) -> PoolResult<Order> {
        // 认领：版本号前进，并发处理同一订单的 worker 只有一个能成功
        let mut order = match self.save(&order).await {
            Ok(saved) => saved,
            Err(PoolError::ConcurrentModification(msg)) => {
                debug!(order_id = %order.id, "Order claimed by another worker: {}", msg);
                return self.get_order(&order.id).await;
            }
            Err(e) => return Err(e),
        };

        while !order.status.is_terminal() {
            let step = match order.status {
                OrderStatus::Received => self.validate(&mut order),
                OrderStatus::Validated => self.calculate(&mut order),
                OrderStatus::Calculated => self.allocate(&mut order).await,
                OrderStatus::Allocated => self.delegate(&mut order).await,
                OrderStatus::Delegated => self.complete(&mut order).await,
                OrderStatus::Completed | OrderStatus::Failed | OrderStatus::Cancelled => Ok(()),
            };

            match step {
                Ok(()) => {}
                Err(PoolError::ConcurrentModification(msg)) => {
                    return self.yield_order(&order, &msg).await;
                }
                Err(e) => self.fail_order(&mut order, &e).await?,
            }

            order = match self.save(&order).await {
                Ok(saved) => saved,
                Err(PoolError::ConcurrentModification(msg)) => {
                    return self.yield_order(&order, &msg).await;
                }
                Err(e) => return Err(e),
            };
        }

        self.metrics.order_finished(order.status);
        info!(
            order_id = %order.id,
            status = %order.status,
            delegated = order.delegated_amount(),
            reason = order.failure_reason.as_deref().unwrap_or(""),
            "Order finished"
        );
        Ok(order)
    }

    /// 重新处理所有非终态订单（启动恢复）
    pub async fn resume_pending(&self) -> PoolResult<Vec<Order>> {
        let mut resumed = Vec::new();
        for status in [
            OrderStatus::Received,
            OrderStatus::Validated,
            OrderStatus::Calculated,
            OrderStatus::Allocated,
            OrderStatus::Delegated,
        ] {
            for order in self.list_orders(status).await? {
                self.metrics.order_resumed();
                resumed.push(self.process(order).await?);
            }
        }
        if !resumed.is_empty() {
            info!(count = resumed.len(), "Pending orders resumed");
        }
        Ok(resumed)
    }

    /// 取消订单
    ///
    /// 先把订单认领为 `cancelled`（版本号冲突时返回 `ConcurrentModification`），
    /// 再回收已代理的分项并释放其余预留。
    /// 回收失败时返回错误，订单保留未回收的分项，再次取消会重试回收。
    pub async fn cancel_order(&self, id: &OrderId, reason: &str) -> PoolResult<Order> {
        let order = self.get_order(id).await?;
        self.cancel(order, reason).await
    }

    async fn cancel(&self, mut order: Order, reason: &str) -> PoolResult<Order> {
        let reclaim_retry =
            order.status == OrderStatus::Cancelled && order.delegated_legs().next().is_some();
        if order.status.is_terminal() && !reclaim_retry {
            return Err(PoolError::StateTransition(format!(
                "order {} is already {}",
                order.id, order.status
            )));
        }

        if reclaim_retry {
            order.record(
                "operator",
                format!("retrying reclaim: {}", reason),
                serde_json::Value::Null,
            );
        } else {
            order.transition(OrderStatus::Cancelled, "cancelled")?;
            order.record("operator", reason, serde_json::Value::Null);
        }
        let mut order = match self.save(&order).await {
            Ok(claimed) => claimed,
            Err(PoolError::ConcurrentModification(msg)) => {
                return Err(PoolError::ConcurrentModification(format!(
                    "order {} changed while cancelling: {}",
                    order.id, msg
                )));
            }
            Err(e) => return Err(e),
        };

        let pending = self
            .unwind(&mut order, ReleaseActor::Operator, reason)
            .await?;
        if pending > 0 {
            order.record(
                "operator",
                format!("cancel incomplete: {} legs still delegated", pending),
                serde_json::Value::Null,
            );
            self.save(&order).await?;
            error!(
                alert = "undelegation",
                order_id = %order.id,
                pending,
                "Cancelled order still has delegated legs"
            );
            return Err(PoolError::ChainConnection(format!(
                "{} delegations of order {} could not be reclaimed",
                pending, order.id
            )));
        }

        let order = self.save(&order).await?;
        if !reclaim_retry {
            self.metrics.order_finished(OrderStatus::Cancelled);
        }
        info!(actor = "operator", order_id = %order.id, reason, "Order cancelled");
        Ok(order)
    }

    // ==================== 查询 ====================

    pub async fn get_order(&self, id: &OrderId) -> PoolResult<Order> {
        with_timeout("get_order", self.timeout, self.storage.get_order(id))
            .await?
            .ok_or_else(|| PoolError::OrderNotFound(id.to_string()))
    }

    pub async fn get_order_by_ref(&self, payment_tx_ref: &str) -> PoolResult<Option<Order>> {
        with_timeout(
            "get_order_by_ref",
            self.timeout,
            self.storage.get_order_by_ref(payment_tx_ref),
        )
        .await
    }

    pub async fn list_orders(&self, status: OrderStatus) -> PoolResult<Vec<Order>> {
        with_timeout(
            "list_orders_by_status",
            self.timeout,
            self.storage.list_orders_by_status(status),
        )
        .await
    }

    // ==================== 状态步骤 ====================

    fn validate(&self, order: &mut Order) -> PoolResult<()> {
        let payment = PaymentEvent {
            from_address: order.payer_address.clone(),
            receiver_address: Some(order.target_address.clone()),
            amount_sun: order.payment_amount_sun,
            payment_tx_ref: order.external_ref.clone(),
            network_id: order.network_id.clone(),
            confirmed: order.payment_confirmed,
            observed_at: order.payment_observed_at,
        };
        validate_payment(&payment, &self.pricing, self.network, Utc::now())?;
        order.transition(OrderStatus::Validated, "payment validated")
    }

    fn calculate(&self, order: &mut Order) -> PoolResult<()> {
        let inputs = calculate(order.payment_amount_sun, &self.pricing)?;
        order.kind = inputs.kind;
        order.requested_amount = inputs.requested_amount;
        order.computed_price_sun = inputs.computed_price_sun;
        order.duration_secs = inputs.duration_secs;
        let detail = serde_json::to_value(&inputs)?;
        order.calculation = Some(inputs);
        order.transition(OrderStatus::Calculated, "amount and price calculated")?;
        order.record("system", "calculation inputs", detail);
        Ok(())
    }

    async fn allocate(&self, order: &mut Order) -> PoolResult<()> {
        // 恢复时上一次未完成的预留先释放，避免重复占用
        let stale = self
            .ledger
            .release_for_ref(&order.id.to_string(), ReleaseActor::Order, "superseded by re-plan")
            .await?;
        if !stale.is_empty() {
            warn!(order_id = %order.id, released = stale.len(), "Released stale reservations");
        }
        order.legs.clear();

        let request =
            AllocationRequest::new(order.requested_amount, order.kind, order.id.to_string())
                .with_owner(order.target_address.clone());
        let plan = self.allocate_with_backoff(&request).await?;

        let detail = serde_json::to_value(&plan)?;
        order.legs = plan.legs.iter().map(|l| l.to_leg()).collect();
        order.transition(OrderStatus::Allocated, format!("{} legs reserved", order.legs.len()))?;
        order.record("system", "allocation plan", detail);
        Ok(())
    }

    async fn delegate(&self, order: &mut Order) -> PoolResult<()> {
        let mut replans = 0;
        let mut excluded: Vec<AccountId> = order
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Rejected)
            .map(|l| l.account_id)
            .collect();

        loop {
            let planned: Vec<_> = order
                .legs
                .iter()
                .filter(|l| l.status == LegStatus::Planned)
                .cloned()
                .collect();
            if planned.is_empty() {
                break;
            }

            let ExecutionReport { results, error } = self
                .executor
                .execute(&planned, order.kind, &order.target_address)
                .await;

            let mut rejected: Vec<ReservationId> = Vec::new();
            let mut rejected_amount = 0u64;
            let mut transport_failure = None;
            for result in &results {
                let Some(leg) = order.leg_mut(&result.reservation_id) else {
                    return Err(PoolError::invariant(format!(
                        "executor returned unknown leg {}",
                        result.reservation_id
                    )));
                };
                match &result.outcome {
                    LegOutcome::Delegated { tx_id } => {
                        leg.status = LegStatus::Delegated;
                        leg.tx_id = Some(tx_id.clone());
                    }
                    LegOutcome::Rejected { reason } => {
                        leg.status = LegStatus::Rejected;
                        leg.reason = Some(reason.clone());
                        rejected.push(result.reservation_id);
                        rejected_amount += result.amount;
                        excluded.push(result.account_id);
                    }
                    LegOutcome::Failed { reason } => {
                        transport_failure = Some(reason.clone());
                    }
                }
            }
            order.record(
                "system",
                "delegation results",
                serde_json::to_value(&results)?,
            );

            if !rejected.is_empty() {
                self.release_open(
                    order,
                    &rejected,
                    ReleaseActor::Order,
                    "chain rejected delegation",
                )
                .await?;
            }
            // 每轮结果立即落盘，重启后不会重复提交已成功的分项
            *order = self.save(order).await?;

            if let Some(e) = error {
                return Err(e);
            }
            if let Some(reason) = transport_failure {
                return Err(PoolError::ChainConnection(reason));
            }
            if rejected_amount == 0 {
                continue;
            }

            if replans >= self.retry.max_replans {
                return Err(PoolError::InsufficientCapacity {
                    kind: order.kind,
                    requested: order.requested_amount,
                    shortfall: rejected_amount,
                });
            }
            replans += 1;

            info!(
                order_id = %order.id,
                amount = rejected_amount,
                excluded = excluded.len(),
                attempt = replans,
                "Re-planning rejected legs"
            );
            let request = AllocationRequest::new(rejected_amount, order.kind, order.id.to_string())
                .with_owner(order.target_address.clone())
                .excluding(excluded.iter().copied());
            let plan = self.allocate_with_backoff(&request).await?;
            order.record("system", "re-plan", serde_json::to_value(&plan)?);
            order.legs.extend(plan.legs.iter().map(|l| l.to_leg()));
            *order = self.save(order).await?;
        }

        if order.delegated_amount() != order.requested_amount {
            return Err(PoolError::invariant(format!(
                "order {} delegated {} of {}",
                order.id,
                order.delegated_amount(),
                order.requested_amount
            )));
        }
        order.transition(OrderStatus::Delegated, "all legs delegated")
    }

    async fn complete(&self, order: &mut Order) -> PoolResult<()> {
        let ids: Vec<ReservationId> = order.delegated_legs().map(|l| l.reservation_id).collect();
        self.ledger.confirm(&ids).await?;
        order.transition(OrderStatus::Completed, "reservations confirmed")
    }

    // ==================== 失败与补偿 ====================

    /// 带退避的分配；容量不足在配置的次数内重试
    async fn allocate_with_backoff(
        &self,
        request: &AllocationRequest,
    ) -> PoolResult<AllocationPlan> {
        let attempts = self.retry.capacity_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.engine.allocate(request).await {
                Ok(AllocationOutcome::Planned(plan)) => return Ok(plan),
                Ok(AllocationOutcome::Deficit(report)) => report.to_error(),
                Err(e) => e,
            };
            if result.class() != ErrorClass::Capacity || attempt >= attempts {
                return Err(result);
            }
            debug!(
                external_ref = %request.external_ref,
                attempt,
                "Capacity unavailable, backing off: {}",
                result
            );
            tokio::time::sleep(Duration::from_millis(self.retry.capacity_backoff_ms)).await;
        }
    }

    /// 标记订单失败（先补偿已产生的副作用）
    async fn fail_order(&self, order: &mut Order, err: &PoolError) -> PoolResult<()> {
        let pending = if order.legs.is_empty() {
            0
        } else {
            self.unwind(order, ReleaseActor::Order, "order failed").await?
        };
        if pending > 0 {
            error!(
                alert = "undelegation",
                order_id = %order.id,
                pending,
                "Failed order still has delegated legs"
            );
        }

        match err.class() {
            ErrorClass::Validation | ErrorClass::Capacity => {
                warn!(order_id = %order.id, "Order failed: {}", err)
            }
            _ => error!(order_id = %order.id, "Order failed: {}", err),
        }
        order.fail(
            err.user_reason(),
            serde_json::json!({
                "error": err.to_string(),
                "class": err.class().to_string(),
                "undelegation_pending": pending,
            }),
        )
    }

    /// 回收已代理分项并释放其余预留，返回回收失败的分项数
    ///
    /// 预留上已记录交易的分项一律按已代理处理，即使订单上仍是 `planned`。
    async fn unwind(
        &self,
        order: &mut Order,
        actor: ReleaseActor,
        reason: &str,
    ) -> PoolResult<usize> {
        // 先释放：之后完成提交的执行器无法记账，会自行回收
        let planned: Vec<ReservationId> = order
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Planned)
            .map(|l| l.reservation_id)
            .collect();
        self.release_open(order, &planned, actor, reason).await?;

        let recorded: HashMap<ReservationId, String> = self
            .ledger
            .list_by_ref(&order.id.to_string())
            .await?
            .into_iter()
            .filter_map(|r| r.tx_id.map(|tx_id| (r.id, tx_id)))
            .collect();
        let mut found = Vec::new();
        for leg in order.legs.iter_mut().filter(|l| l.status == LegStatus::Planned) {
            match recorded.get(&leg.reservation_id) {
                Some(tx_id) => {
                    leg.status = LegStatus::Delegated;
                    leg.tx_id = Some(tx_id.clone());
                    found.push(format!("leg {} found delegated ({})", leg.reservation_id, tx_id));
                }
                None => leg.status = LegStatus::Released,
            }
        }
        for message in found {
            warn!(order_id = %order.id, "{}", message);
            order.record(&actor.to_string(), message, serde_json::Value::Null);
        }

        let mut pending = 0;
        let mut to_release = Vec::new();
        let delegated: Vec<_> = order.delegated_legs().cloned().collect();
        for leg in delegated {
            let outcome = self
                .executor
                .undelegate(&leg, order.kind, &order.target_address)
                .await;
            let message = match outcome {
                Ok(SubmitOutcome::Accepted(receipt)) => {
                    if let Some(l) = order.leg_mut(&leg.reservation_id) {
                        l.status = LegStatus::Undelegated;
                    }
                    to_release.push(leg.reservation_id);
                    format!("undelegated leg {} ({})", leg.reservation_id, receipt.tx_id)
                }
                Ok(SubmitOutcome::Rejected { reason }) => {
                    pending += 1;
                    format!("undelegation of leg {} rejected: {}", leg.reservation_id, reason)
                }
                Err(e) if e.class() == ErrorClass::ExternalService => {
                    pending += 1;
                    format!("undelegation of leg {} failed: {}", leg.reservation_id, e)
                }
                Err(e) => return Err(e),
            };
            order.record(&actor.to_string(), message, serde_json::Value::Null);
        }

        self.release_open(order, &to_release, actor, reason).await?;
        Ok(pending)
    }

    /// 释放仍处于 reserved 的预留（已被清扫的跳过）
    async fn release_open(
        &self,
        order: &Order,
        ids: &[ReservationId],
        actor: ReleaseActor,
        reason: &str,
    ) -> PoolResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let wanted: HashSet<&ReservationId> = ids.iter().collect();
        let open: Vec<ReservationId> = self
            .ledger
            .list_by_ref(&order.id.to_string())
            .await?
            .into_iter()
            .filter(|r| r.is_open() && wanted.contains(&r.id))
            .map(|r| r.id)
            .collect();
        self.ledger.release(&open, actor, reason).await?;
        Ok(())
    }

    /// 另一个 worker 已推进该订单：撤回本次新建的预留并返回当前订单
    ///
    /// 当前订单已是终态时，本次代理而当前订单不知道的分项在链上回收。
    async fn yield_order(&self, ours: &Order, msg: &str) -> PoolResult<Order> {
        let current = self.get_order(&ours.id).await?;
        let theirs: HashMap<ReservationId, LegStatus> = current
            .legs
            .iter()
            .map(|l| (l.reservation_id, l.status))
            .collect();
        let orphaned: Vec<ReservationId> = ours
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Planned && !theirs.contains_key(&l.reservation_id))
            .map(|l| l.reservation_id)
            .collect();
        if !orphaned.is_empty() {
            self.release_open(
                ours,
                &orphaned,
                ReleaseActor::Order,
                "order claimed by another worker",
            )
            .await?;
        }

        if current.status.is_terminal() {
            let stray: Vec<_> = ours
                .delegated_legs()
                .filter(|l| {
                    !matches!(
                        theirs.get(&l.reservation_id),
                        Some(LegStatus::Delegated | LegStatus::Undelegated)
                    )
                })
                .cloned()
                .collect();
            for leg in stray {
                match self
                    .executor
                    .undelegate(&leg, ours.kind, &ours.target_address)
                    .await
                {
                    Ok(SubmitOutcome::Accepted(_)) => {
                        self.release_open(
                            ours,
                            &[leg.reservation_id],
                            ReleaseActor::Order,
                            "order settled by another worker",
                        )
                        .await?;
                    }
                    Ok(SubmitOutcome::Rejected { reason }) => error!(
                        alert = "undelegation",
                        order_id = %ours.id,
                        reservation_id = %leg.reservation_id,
                        "Stray delegation not reclaimed: {}",
                        reason
                    ),
                    Err(e) if e.class() == ErrorClass::ExternalService => error!(
                        alert = "undelegation",
                        order_id = %ours.id,
                        reservation_id = %leg.reservation_id,
                        "Stray delegation not reclaimed: {}",
                        e
                    ),
                    Err(e) => return Err(e),
                }
            }
        }

        debug!(order_id = %ours.id, "Yielding order to another worker: {}", msg);
        Ok(current)
    }

    async fn save(&self, order: &Order) -> PoolResult<Order> {
        with_timeout("update_order", self.timeout, self.storage.update_order(order)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountant::{ResourceAccountant, ResourceConverter};
    use crate::chain::InMemoryChain;
    use crate::config::{PoolConfig, ResourceRatio};
    use crate::keys::KeyVault;
    use crate::storage::MemoryStorage;
    use crate::types::{
        AccountClass, AccountStatus, PoolAccount, ReservationState, ResourceKind, SUN_PER_TRX,
    };
    use rust_decimal::Decimal;

    const A: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";
    const B: &str = "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf";
    const PAYER: &str = "TMuA6YqfCeX8EhbfYEg5y7S4DqzSJireY9";
    const KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    struct Fixture {
        chain: Arc<InMemoryChain>,
        storage: Arc<MemoryStorage>,
        ledger: Arc<ReservationLedger<MemoryStorage>>,
        vault: Arc<KeyVault>,
        coordinator: OrderLifecycleCoordinator<MemoryStorage>,
    }

    /// 1 SUN = 1 单位；每 1 TRX 买 100 单位能量
    fn fixture() -> Fixture {
        let mut config = PoolConfig::development();
        config.ratio = ResourceRatio {
            energy_per_trx: SUN_PER_TRX,
            bandwidth_per_trx: SUN_PER_TRX,
        };
        config.pricing.price_per_unit_sun = 1_000_000;
        config.pricing.resource_per_unit = 100;
        config.retry.initial_delay_ms = 1;
        config.retry.capacity_backoff_ms = 1;

        let chain = Arc::new(InMemoryChain::new());
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
        let engine = Arc::new(AllocationEngine::new(
            storage.clone(),
            accountant.clone(),
            ledger.clone(),
            config.allocation.clone(),
            config.storage_timeout(),
            metrics.clone(),
        ));
        let executor = Arc::new(DelegationExecutor::new(
            storage.clone(),
            chain.clone(),
            accountant,
            ledger.clone(),
            vault.clone(),
            &config,
            metrics.clone(),
        ));
        let coordinator = OrderLifecycleCoordinator::new(
            storage.clone(),
            engine,
            ledger.clone(),
            executor,
            config.pricing.clone(),
            config.chain.network,
            config.retry.clone(),
            config.storage_timeout(),
            metrics,
        );
        Fixture {
            chain,
            storage,
            ledger,
            vault,
            coordinator,
        }
    }

    async fn add(f: &Fixture, address: &str, priority: u32, staked: u64) -> PoolAccount {
        let key = f.vault.encrypt_key(KEY).unwrap();
        add_with_key(f, address, priority, staked, key).await
    }

    async fn add_with_key(
        f: &Fixture,
        address: &str,
        priority: u32,
        staked: u64,
        encrypted_key: String,
    ) -> PoolAccount {
        f.chain.fund(address, ResourceKind::Energy, staked).await;
        f.storage
            .insert_account(PoolAccount {
                id: AccountId(0),
                address: address.to_string(),
                name: address.to_string(),
                encrypted_key,
                status: AccountStatus::Active,
                priority,
                cost_per_unit: Decimal::ZERO,
                class: AccountClass::Own,
                daily_cap: None,
                monthly_cap: None,
                description: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    /// 插入订单并推进到 allocated（不代理）
    async fn allocated_order(f: &Fixture, amount_sun: u64, payment_ref: &str) -> Order {
        let mut order = Order::from_payment(
            &PaymentEvent::new(PAYER, amount_sun, payment_ref, "nile"),
            ResourceKind::Energy,
            3_600,
        );
        f.storage.insert_order(&order).await.unwrap();
        f.coordinator.validate(&mut order).unwrap();
        f.coordinator.calculate(&mut order).unwrap();
        f.coordinator.allocate(&mut order).await.unwrap();
        f.coordinator.save(&order).await.unwrap()
    }

    #[tokio::test]
    async fn test_order_completes() {
        let f = fixture();
        add(&f, A, 1, 500).await;
        add(&f, B, 2, 1_000).await;

        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 7_000_000, "tx-1", "nile"))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.requested_amount, 700);
        assert_eq!(order.delegated_amount(), 700);
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 700);

        let reservations = f.ledger.list_by_ref(&order.id.to_string()).await.unwrap();
        assert_eq!(reservations.len(), 2);
        assert!(reservations
            .iter()
            .all(|r| r.state == ReservationState::Confirmed));
    }

    #[tokio::test]
    async fn test_invalid_payment_fails_with_reason() {
        let f = fixture();
        add(&f, A, 1, 500).await;

        let mut payment = PaymentEvent::new(PAYER, 7_000_000, "tx-1", "nile");
        payment.confirmed = false;
        let order = f.coordinator.create_order_from_payment(payment).await.unwrap();

        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order
            .failure_reason
            .as_deref()
            .unwrap()
            .starts_with("payment invalid"));
        assert!(f.ledger.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_capacity_fails_without_holds() {
        let f = fixture();
        add(&f, A, 1, 100).await;

        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 7_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(
            order.failure_reason.as_deref(),
            Some("no capacity available right now")
        );
        assert!(f.ledger.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_leg_replanned_elsewhere() {
        let f = fixture();
        let a = add(&f, A, 1, 1_000).await;
        let b = add(&f, B, 2, 1_000).await;
        f.chain.reject_next(A, "claimable balance insufficient").await;

        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 3_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Completed);

        let rejected: Vec<_> = order
            .legs
            .iter()
            .filter(|l| l.status == LegStatus::Rejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].account_id, a.id);
        assert_eq!(order.delegated_legs().next().unwrap().account_id, b.id);
        assert_eq!(f.ledger.held(a.id, ResourceKind::Energy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_compensates() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;
        f.chain.fail_submissions(100).await;

        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(
            order.failure_reason.as_deref(),
            Some("blockchain temporarily unavailable, please retry later")
        );
        assert!(order.legs.iter().all(|l| l.status == LegStatus::Released));
        assert!(f.ledger.list_open().await.unwrap().is_empty());
        assert!(f.chain.delegations().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_payment_single_order() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;

        let first = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        let second = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"))
            .await;

        assert!(matches!(second, Err(PoolError::DuplicateOrder { .. })));
        assert_eq!(f.chain.delegations().await.len(), 1);
        assert_eq!(
            f.coordinator.get_order_by_ref("tx-1").await.unwrap().unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn test_cancel_before_delegation_releases() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;

        // 手工推进到 allocated
        let mut order = Order::from_payment(
            &PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"),
            ResourceKind::Energy,
            3_600,
        );
        f.storage.insert_order(&order).await.unwrap();
        f.coordinator.validate(&mut order).unwrap();
        f.coordinator.calculate(&mut order).unwrap();
        f.coordinator.allocate(&mut order).await.unwrap();
        f.coordinator.save(&order).await.unwrap();
        assert_eq!(f.ledger.list_open().await.unwrap().len(), 1);

        let cancelled = f
            .coordinator
            .cancel_order(&order.id, "customer request")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(f.ledger.list_open().await.unwrap().is_empty());
        assert!(f.chain.delegations().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_completed_rejected() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;
        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile"))
            .await
            .unwrap();

        assert!(matches!(
            f.coordinator.cancel_order(&order.id, "late").await,
            Err(PoolError::StateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_delegation_undelegates() {
        let f = fixture();
        let a = add(&f, A, 1, 1_000).await;

        let mut order = Order::from_payment(
            &PaymentEvent::new(PAYER, 2_000_000, "tx-1", "nile"),
            ResourceKind::Energy,
            3_600,
        );
        f.storage.insert_order(&order).await.unwrap();
        order = f.coordinator.save(&order).await.unwrap();
        f.coordinator.validate(&mut order).unwrap();
        f.coordinator.calculate(&mut order).unwrap();
        f.coordinator.allocate(&mut order).await.unwrap();
        f.coordinator.delegate(&mut order).await.unwrap();
        f.coordinator.save(&order).await.unwrap();
        assert_eq!(order.status, OrderStatus::Delegated);
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 200);

        let cancelled = f
            .coordinator
            .cancel_order(&order.id, "customer request")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled
            .legs
            .iter()
            .all(|l| l.status == LegStatus::Undelegated));
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 0);
        assert_eq!(f.ledger.held(a.id, ResourceKind::Energy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_internal_error_after_delegation_undelegates() {
        let f = fixture();
        add(&f, A, 1, 500).await;
        add_with_key(&f, B, 2, 1_000, "00".repeat(40)).await;

        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 7_000_000, "tx-1", "nile"))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(
            order.failure_reason.as_deref(),
            Some("internal error - contact support")
        );
        assert!(order
            .legs
            .iter()
            .any(|l| l.status == LegStatus::Undelegated && l.address == A));
        assert!(order.delegated_legs().next().is_none());
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 0);
        assert!(f.ledger.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_reclaims_recorded_but_unsaved_leg() {
        let f = fixture();
        let a = add(&f, A, 1, 1_000).await;
        let order = allocated_order(&f, 2_000_000, "tx-1").await;

        // 交易已记到预留上，订单上仍是 planned
        let leg = order.legs[0].clone();
        let result = f
            .coordinator
            .executor
            .delegate_leg(&leg, ResourceKind::Energy, PAYER)
            .await
            .unwrap();
        assert!(result.outcome.is_delegated());
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 200);

        let cancelled = f
            .coordinator
            .cancel_order(&order.id, "customer request")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.legs[0].status, LegStatus::Undelegated);
        assert!(cancelled.legs[0].tx_id.is_some());
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 0);
        assert_eq!(f.ledger.held(a.id, ResourceKind::Energy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_swept_reservation_not_delegated() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;
        let order = allocated_order(&f, 1_000_000, "tx-1").await;

        let swept = f
            .ledger
            .sweep_expired(Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!(swept.released.len(), 1);

        let order = f.coordinator.process(order).await.unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(order.delegated_legs().next().is_none());
        assert_eq!(f.chain.submission_count().await, 0);
        assert!(f.chain.delegations().await.is_empty());
        assert!(f.ledger.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_loses_claim_to_concurrent_update() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;
        let stale = allocated_order(&f, 1_000_000, "tx-1").await;

        // 另一个 worker 先推进了版本号
        f.coordinator.save(&stale).await.unwrap();

        let result = f.coordinator.cancel(stale.clone(), "customer request").await;
        assert!(matches!(result, Err(PoolError::ConcurrentModification(_))));
        assert_eq!(result.unwrap_err().class(), ErrorClass::Conflict);

        // 认领失败：预留与订单均未被改动
        assert_eq!(f.ledger.list_open().await.unwrap().len(), 1);
        let current = f.coordinator.get_order(&stale.id).await.unwrap();
        assert_eq!(current.status, OrderStatus::Allocated);
        assert!(current.legs.iter().all(|l| l.status == LegStatus::Planned));

        let cancelled = f
            .coordinator
            .cancel_order(&stale.id, "customer request")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(f.ledger.list_open().await.unwrap().is_empty());

        assert!(matches!(
            f.coordinator.cancel_order(&stale.id, "again").await,
            Err(PoolError::StateTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_retries_failed_reclaim() {
        let f = fixture();
        let a = add(&f, A, 1, 1_000).await;
        let mut order = allocated_order(&f, 2_000_000, "tx-1").await;
        f.coordinator.delegate(&mut order).await.unwrap();
        f.coordinator.save(&order).await.unwrap();

        // 回收的每次重试都失败
        f.chain.fail_submissions(3).await;
        let first = f.coordinator.cancel_order(&order.id, "customer request").await;
        assert!(matches!(first, Err(PoolError::ChainConnection(_))));

        let stuck = f.coordinator.get_order(&order.id).await.unwrap();
        assert_eq!(stuck.status, OrderStatus::Cancelled);
        assert_eq!(stuck.delegated_legs().count(), 1);
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 200);

        let cancelled = f
            .coordinator
            .cancel_order(&order.id, "customer request")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.delegated_legs().next().is_none());
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 0);
        assert_eq!(f.ledger.held(a.id, ResourceKind::Energy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_payment_resumes_received_order() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;

        let payment = PaymentEvent::new(PAYER, 1_000_000, "tx-1", "nile");
        let received = Order::from_payment(&payment, ResourceKind::Energy, 3_600);
        f.storage.insert_order(&received).await.unwrap();

        let order = f
            .coordinator
            .create_order_from_payment(payment)
            .await
            .unwrap();
        assert_eq!(order.id, received.id);
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(f.storage.get_stats().await.unwrap().total_orders, 1);
        assert_eq!(f.chain.delegations().await.len(), 1);
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 100);
    }

    #[tokio::test]
    async fn test_duplicate_payment_resumes_allocated_order() {
        let f = fixture();
        add(&f, A, 1, 1_000).await;
        let allocated = allocated_order(&f, 2_000_000, "tx-1").await;
        assert_eq!(allocated.status, OrderStatus::Allocated);

        let order = f
            .coordinator
            .create_order_from_payment(PaymentEvent::new(PAYER, 2_000_000, "tx-1", "nile"))
            .await
            .unwrap();
        assert_eq!(order.id, allocated.id);
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.legs.len(), allocated.legs.len());
        assert_eq!(f.storage.get_stats().await.unwrap().total_orders, 1);
        assert_eq!(f.chain.delegations().await.len(), allocated.legs.len());
        assert_eq!(f.chain.delegated_to(PAYER, ResourceKind::Energy).await, 200);
        assert_eq!(
            f.ledger.list_by_ref(&order.id.to_string()).await.unwrap().len(),
            1
        );
    }
}
