//! 分配引擎
//!
//! 为资源请求挑选池账户并生成分配计划。
//!
//! # 算法
//!
//! 1. 取全部活跃账户（排除调用方指定的账户）
//! 2. 按优先级升序排序，优先级相同按创建顺序
//! 3. 逐个获取实时快照，扣除本地持有量与日/月上限余量，得到可领取量
//! 4. 贪心取 `min(剩余需求, 可领取量)`
//! 5. 需求不能完全满足时返回缺口报告，不返回部分计划
//! 6. 成功时在单个事务中为计划的每一分项创建预留
//!
//! 提交与规划之间若有并发分配抢占了容量，事务会失败，引擎按配置次数重新规划。

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::accountant::ResourceAccountant;
use crate::config::AllocationConfig;
use crate::error::{PoolError, PoolResult};
use crate::ledger::ReservationLedger;
use crate::metrics::PoolMetrics;
use crate::retry::with_timeout;
use crate::storage::PoolStorage;
use crate::types::{
    AccountId, AccountStatus, AllocationLeg, LegStatus, PoolAccount, ReservationId,
    ReservationRequest, ResourceKind,
};

/// 分配请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// 需求量（资源单位）
    pub amount: u64,
    pub kind: ResourceKind,
    /// 预留归属的外部引用（订单ID）
    pub external_ref: String,
    /// 所属用户
    pub owner: Option<String>,
    /// 不参与本次分配的账户
    #[serde(default)]
    pub exclude: Vec<AccountId>,
}

impl AllocationRequest {
    pub fn new(amount: u64, kind: ResourceKind, external_ref: impl Into<String>) -> Self {
        Self {
            amount,
            kind,
            external_ref: external_ref.into(),
            owner: None,
            exclude: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = AccountId>) -> Self {
        self.exclude.extend(ids);
        self
    }
}

/// 计划分项（已预留）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLeg {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub address: String,
    pub amount: u64,
    /// 规划时该账户的可领取量
    pub claimable: u64,
}

impl PlanLeg {
    /// 转为订单分项（待代理）
    pub fn to_leg(&self) -> AllocationLeg {
        AllocationLeg {
            reservation_id: self.reservation_id,
            account_id: self.account_id,
            address: self.address.clone(),
            amount: self.amount,
            status: LegStatus::Planned,
            tx_id: None,
            reason: None,
        }
    }
}

/// 分配计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub external_ref: String,
    pub kind: ResourceKind,
    pub required: u64,
    pub legs: Vec<PlanLeg>,
}

impl AllocationPlan {
    /// 计划总量（总是等于需求量）
    pub fn total(&self) -> u64 {
        self.legs.iter().map(|l| l.amount).sum()
    }

    pub fn reservation_ids(&self) -> Vec<ReservationId> {
        self.legs.iter().map(|l| l.reservation_id).collect()
    }
}

/// 跳过的账户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedAccount {
    pub account_id: AccountId,
    pub reason: String,
}

/// 缺口报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeficitReport {
    pub kind: ResourceKind,
    pub required: u64,
    /// 所有候选账户的可领取总量
    pub claimable: u64,
    pub shortfall: u64,
    pub skipped: Vec<SkippedAccount>,
}

impl DeficitReport {
    pub fn to_error(&self) -> PoolError {
        PoolError::InsufficientCapacity {
            kind: self.kind,
            requested: self.required,
            shortfall: self.shortfall,
        }
    }
}

/// 分配结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationOutcome {
    Planned(AllocationPlan),
    Deficit(DeficitReport),
}

impl AllocationOutcome {
    /// 缺口转为错误
    pub fn into_plan(self) -> PoolResult<AllocationPlan> {
        match self {
            AllocationOutcome::Planned(plan) => Ok(plan),
            AllocationOutcome::Deficit(report) => Err(report.to_error()),
        }
    }
}

/// 规划草案（尚未预留）
struct Draft {
    requests: Vec<(ReservationRequest, String, u64)>,
    claimable: u64,
    skipped: Vec<SkippedAccount>,
}

/// 分配引擎
pub struct AllocationEngine<S: PoolStorage> {
    storage: Arc<S>,
    accountant: Arc<ResourceAccountant>,
    ledger: Arc<ReservationLedger<S>>,
    config: AllocationConfig,
    timeout: Duration,
    metrics: Arc<PoolMetrics>,
    /// 连续快照失败次数
    failures: Mutex<HashMap<AccountId, u32>>,
}

impl<S: PoolStorage> AllocationEngine<S> {
    /// 创建分配引擎
    pub fn new(
        storage: Arc<S>,
        accountant: Arc<ResourceAccountant>,
        ledger: Arc<ReservationLedger<S>>,
        config: AllocationConfig,
        timeout: Duration,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        Self {
            storage,
            accountant,
            ledger,
            config,
            timeout,
            metrics,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// 分配并预留
    ///
    /// 预期内的失败（容量不足）以 [`AllocationOutcome::Deficit`] 返回；
    /// 没有活跃账户、所有快照失败等以错误返回。
    pub async fn allocate(&self, request: &AllocationRequest) -> PoolResult<AllocationOutcome> {
        if request.amount == 0 {
            return Err(PoolError::InvalidInput(
                "allocation amount must be non-zero".to_string(),
            ));
        }

        let attempts = self.config.max_commit_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;

            let draft = match self.plan(request).await? {
                Ok(draft) => draft,
                Err(report) => {
                    self.metrics.allocation_deficit();
                    info!(
                        kind = %report.kind,
                        required = report.required,
                        claimable = report.claimable,
                        shortfall = report.shortfall,
                        "Allocation deficit"
                    );
                    return Ok(AllocationOutcome::Deficit(report));
                }
            };

            let reservation_requests: Vec<ReservationRequest> =
                draft.requests.iter().map(|(r, _, _)| r.clone()).collect();

            match self.ledger.batch_reserve(&reservation_requests).await {
                Ok(reservations) => {
                    let legs: Vec<PlanLeg> = reservations
                        .iter()
                        .zip(draft.requests.iter())
                        .map(|(reservation, (_, address, claimable))| PlanLeg {
                            reservation_id: reservation.id,
                            account_id: reservation.account_id,
                            address: address.clone(),
                            amount: reservation.amount,
                            claimable: *claimable,
                        })
                        .collect();

                    let plan = AllocationPlan {
                        external_ref: request.external_ref.clone(),
                        kind: request.kind,
                        required: request.amount,
                        legs,
                    };
                    if plan.total() != request.amount {
                        return Err(PoolError::invariant(format!(
                            "plan total {} differs from required {}",
                            plan.total(),
                            request.amount
                        )));
                    }

                    info!(
                        external_ref = %plan.external_ref,
                        kind = %plan.kind,
                        required = plan.required,
                        legs = plan.legs.len(),
                        "Allocation planned"
                    );
                    return Ok(AllocationOutcome::Planned(plan));
                }
                Err(e @ (PoolError::CapacityExceeded { .. } | PoolError::CapExceeded { .. }))
                    if attempt < attempts =>
                {
                    self.metrics.commit_conflict();
                    warn!(
                        external_ref = %request.external_ref,
                        attempt,
                        "Reservation commit lost a race, re-planning: {}",
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 规划（不写入）
    async fn plan(&self, request: &AllocationRequest) -> PoolResult<Result<Draft, DeficitReport>> {
        let mut candidates: Vec<PoolAccount> =
            with_timeout("list_accounts", self.timeout, self.storage.list_accounts())
                .await?
                .into_iter()
                .filter(|a| a.is_allocatable() && !request.exclude.contains(&a.id))
                .collect();
        if candidates.is_empty() {
            return Err(PoolError::NoActiveAccounts);
        }
        candidates.sort_by_key(|a| (a.priority, a.id));

        let held = self.ledger.held_amounts().await?;

        let mut remaining = request.amount;
        let mut draft = Draft {
            requests: Vec::new(),
            claimable: 0,
            skipped: Vec::new(),
        };
        let mut observed = 0usize;
        let mut first_failure = None;

        for account in &candidates {
            if remaining == 0 {
                break;
            }

            let snapshot = match self.accountant.snapshot(&account.address, request.kind).await {
                Ok(snapshot) => {
                    self.record_success(account.id).await;
                    snapshot
                }
                Err(e) => {
                    self.metrics.snapshot_failure();
                    warn!(account_id = %account.id, "Snapshot unavailable, skipping account: {}", e);
                    first_failure.get_or_insert(account.id);
                    draft.skipped.push(SkippedAccount {
                        account_id: account.id,
                        reason: e.to_string(),
                    });
                    self.record_failure(account).await;
                    continue;
                }
            };
            observed += 1;

            let base = snapshot.claimable_base();
            let account_held = held
                .get(&(account.id, request.kind))
                .map(|h| h.amount)
                .unwrap_or(0);
            if account_held > base {
                // 链上状态已先于本地确认变化，属于已知的外部一致性窗口
                warn!(
                    account_id = %account.id,
                    held = account_held,
                    observed = base,
                    "Held capacity above observed claimable"
                );
            }

            let mut claimable = base.saturating_sub(account_held);
            if let Some(room) = self.cap_room(account, request.kind).await? {
                claimable = claimable.min(room);
            }
            draft.claimable += claimable;

            let take = remaining.min(claimable);
            debug!(
                account_id = %account.id,
                priority = account.priority,
                base,
                held = account_held,
                claimable,
                take,
                "Allocation candidate"
            );
            if take == 0 {
                continue;
            }

            remaining -= take;
            draft.requests.push((
                ReservationRequest {
                    account_id: account.id,
                    kind: request.kind,
                    amount: take,
                    external_ref: request.external_ref.clone(),
                    owner: request.owner.clone(),
                    observed_capacity: base,
                },
                account.address.clone(),
                claimable,
            ));
        }

        if observed == 0 {
            if let Some(account_id) = first_failure {
                return Err(PoolError::SnapshotUnavailable(account_id));
            }
        }

        if remaining > 0 {
            return Ok(Err(DeficitReport {
                kind: request.kind,
                required: request.amount,
                claimable: draft.claimable,
                shortfall: remaining,
                skipped: draft.skipped,
            }));
        }
        Ok(Ok(draft))
    }

    /// 日/月上限余量（无上限时为 None）
    async fn cap_room(&self, account: &PoolAccount, kind: ResourceKind) -> PoolResult<Option<u64>> {
        let now = Utc::now();
        let mut room: Option<u64> = None;

        if let Some(cap) = account.daily_cap {
            let used = self
                .ledger
                .committed_since(account.id, kind, start_of_day(now))
                .await?;
            room = Some(cap.saturating_sub(used));
        }
        if let Some(cap) = account.monthly_cap {
            let used = self
                .ledger
                .committed_since(account.id, kind, start_of_month(now))
                .await?;
            let monthly = cap.saturating_sub(used);
            room = Some(room.map_or(monthly, |r| r.min(monthly)));
        }
        Ok(room)
    }

    async fn record_success(&self, account_id: AccountId) {
        self.failures.lock().await.remove(&account_id);
    }

    /// 连续失败达到阈值时自动降级为维护状态
    async fn record_failure(&self, account: &PoolAccount) {
        let threshold = self.config.demote_after_failures;
        if threshold == 0 {
            return;
        }

        let count = {
            let mut failures = self.failures.lock().await;
            let count = failures.entry(account.id).or_insert(0);
            *count += 1;
            *count
        };
        if count < threshold {
            return;
        }

        let demoted = with_timeout(
            "batch_update_status",
            self.timeout,
            self.storage
                .batch_update_status(&[account.id], AccountStatus::Maintenance),
        )
        .await;
        match demoted {
            Ok(_) => {
                self.failures.lock().await.remove(&account.id);
                self.metrics.account_demoted();
                warn!(
                    actor = "system",
                    account_id = %account.id,
                    failures = count,
                    "Account demoted to maintenance after repeated chain errors"
                );
            }
            Err(e) => {
                warn!(account_id = %account.id, "Failed to demote account: {}", e);
            }
        }
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let first = today.with_day(1).unwrap_or(today);
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}
