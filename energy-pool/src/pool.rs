//! 账户池管理
//!
//! 池账户的增删改查与状态生命周期。
//!
//! # 设计原则
//!
//! - 地址唯一：写入前预检查，存储层唯一索引作为并发兜底
//! - 批量状态更新是单个事务，不逐条写入
//! - 池统计基于实时资源快照计算，不使用持久化的容量字段

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::accountant::ResourceAccountant;
use crate::error::{PoolError, PoolResult};
use crate::keys::KeyVault;
use crate::ledger::ReservationLedger;
use crate::retry::with_timeout;
use crate::storage::PoolStorage;
use crate::types::{
    validate_address, AccountId, AccountStatus, AccountUpdate, NewAccount, PoolAccount,
    ResourceKind,
};

/// 池统计（实时快照）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub kind: ResourceKind,
    pub total_accounts: u64,
    pub active_accounts: u64,
    /// 活跃账户质押所得资源总量
    pub total_capacity: u64,
    /// 活跃账户当前可领取总量（已扣除本地持有）
    pub available_capacity: u64,
    /// 已代理出的资源总量
    pub delegated_out: u64,
    /// 本地预留持有总量
    pub held: u64,
    /// `1 - available / total`
    pub utilization_rate: f64,
    /// 快照获取失败、未计入统计的账户
    pub unreachable: Vec<AccountId>,
}

/// 账户池管理器
pub struct AccountPoolManager<S: PoolStorage> {
    storage: Arc<S>,
    accountant: Arc<ResourceAccountant>,
    ledger: Arc<ReservationLedger<S>>,
    vault: Arc<KeyVault>,
    timeout: Duration,
}

impl<S: PoolStorage> AccountPoolManager<S> {
    /// 创建账户池管理器
    pub fn new(
        storage: Arc<S>,
        accountant: Arc<ResourceAccountant>,
        ledger: Arc<ReservationLedger<S>>,
        vault: Arc<KeyVault>,
        timeout: Duration,
    ) -> Self {
        Self {
            storage,
            accountant,
            ledger,
            vault,
            timeout,
        }
    }

    // ==================== 创建 ====================

    /// 添加账户
    ///
    /// 地址已存在（无论状态）时返回 `DuplicateAddress`。
    pub async fn add_account(&self, new_account: NewAccount) -> PoolResult<PoolAccount> {
        let address = new_account.address.trim().to_string();
        validate_address(&address)?;

        if let Some(existing) = with_timeout(
            "get_account_by_address",
            self.timeout,
            self.storage.get_account_by_address(&address),
        )
        .await?
        {
            return Err(PoolError::DuplicateAddress {
                address,
                existing: existing.id,
            });
        }

        let encrypted_key = self.vault.encrypt_key(&new_account.private_key_hex)?;
        let now = chrono::Utc::now();
        let account = PoolAccount {
            id: AccountId::default(),
            address,
            name: new_account.name,
            encrypted_key,
            status: AccountStatus::Active,
            priority: new_account.priority,
            cost_per_unit: new_account.cost_per_unit,
            class: new_account.class,
            daily_cap: new_account.daily_cap,
            monthly_cap: new_account.monthly_cap,
            description: new_account.description,
            created_at: now,
            updated_at: now,
        };

        // 预检查与写入之间的并发由存储层唯一索引兜底
        let account = with_timeout(
            "insert_account",
            self.timeout,
            self.storage.insert_account(account),
        )
        .await?;

        info!(
            account_id = %account.id,
            address = %account.address,
            priority = account.priority,
            class = %account.class,
            "Pool account added"
        );
        Ok(account)
    }

    // ==================== 查询 ====================

    pub async fn get_account(&self, id: AccountId) -> PoolResult<PoolAccount> {
        with_timeout("get_account", self.timeout, self.storage.get_account(id))
            .await?
            .ok_or(PoolError::AccountNotFound(id))
    }

    /// 全部账户（按 id 升序）
    pub async fn list_accounts(&self) -> PoolResult<Vec<PoolAccount>> {
        with_timeout("list_accounts", self.timeout, self.storage.list_accounts()).await
    }

    /// 活跃账户（按优先级升序，优先级相同按创建顺序）
    pub async fn list_active(&self) -> PoolResult<Vec<PoolAccount>> {
        let mut active: Vec<PoolAccount> = self
            .list_accounts()
            .await?
            .into_iter()
            .filter(|a| a.is_allocatable())
            .collect();
        active.sort_by_key(|a| (a.priority, a.id));
        Ok(active)
    }

    // ==================== 状态 ====================

    /// 设置单个账户状态
    pub async fn set_account_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> PoolResult<PoolAccount> {
        let mut updated = self.batch_update(&[id], status).await?;
        updated.pop().ok_or(PoolError::AccountNotFound(id))
    }

    /// 批量设置账户状态（单个事务）
    pub async fn batch_update(
        &self,
        ids: &[AccountId],
        status: AccountStatus,
    ) -> PoolResult<Vec<PoolAccount>> {
        let mut seen = HashSet::new();
        let ids: Vec<AccountId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let updated = with_timeout(
            "batch_update_status",
            self.timeout,
            self.storage.batch_update_status(&ids, status),
        )
        .await?;

        info!(count = updated.len(), status = %status, "Account status updated");
        Ok(updated)
    }

    /// 修改账户属性（地址与密钥不可修改）
    pub async fn update_account(
        &self,
        id: AccountId,
        update: &AccountUpdate,
    ) -> PoolResult<PoolAccount> {
        let mut account = self.get_account(id).await?;
        update.apply(&mut account);
        with_timeout(
            "update_account",
            self.timeout,
            self.storage.update_account(&account),
        )
        .await?;
        info!(account_id = %id, "Account updated");
        Ok(account)
    }

    /// 删除账户
    ///
    /// 存在未结预留时返回 `AccountInUse`。
    pub async fn remove_account(&self, id: AccountId) -> PoolResult<()> {
        with_timeout("delete_account", self.timeout, self.storage.delete_account(id)).await?;
        info!(account_id = %id, "Pool account removed");
        Ok(())
    }

    // ==================== 统计 ====================

    /// 基于实时快照的池统计
    pub async fn get_pool_statistics(&self, kind: ResourceKind) -> PoolResult<PoolStatistics> {
        let accounts = self.list_accounts().await?;
        let held = self.ledger.held_amounts().await?;

        let mut stats = PoolStatistics {
            kind,
            total_accounts: accounts.len() as u64,
            ..Default::default()
        };

        for account in accounts.iter().filter(|a| a.is_allocatable()) {
            stats.active_accounts += 1;

            let snapshot = match self.accountant.snapshot(&account.address, kind).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(account_id = %account.id, "Snapshot failed, excluded from statistics: {}", e);
                    stats.unreachable.push(account.id);
                    continue;
                }
            };
            let account_held = held.get(&(account.id, kind)).map(|h| h.amount).unwrap_or(0);

            stats.total_capacity += snapshot.total_from_staking;
            stats.delegated_out += snapshot.delegated_out;
            stats.held += account_held;
            stats.available_capacity += snapshot.claimable_base().saturating_sub(account_held);
        }

        stats.utilization_rate = if stats.total_capacity == 0 {
            0.0
        } else {
            let used = stats.total_capacity.saturating_sub(stats.available_capacity);
            used as f64 / stats.total_capacity as f64
        };
        Ok(stats)
    }
}
