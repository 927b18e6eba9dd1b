//! 能量池存储层
//!
//! 提供池账户、预留与订单的持久化接口和实现。
//!
//! # 设计原则
//!
//! - 地址唯一约束由存储层兜底（并发写入时的最终防线）
//! - 每个多行变更都是单个原子事务（预留批量创建 / 批量状态迁移 / 批量账户状态）
//! - 账户持有量（held）与预留记录在同一事务内更新，不存在读-改-写窗口
//! - 日/月上限在创建预留的同一事务内复核
//! - 订单按支付哈希唯一，更新使用乐观锁版本号

pub mod memory;
pub mod sled;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::PoolResult;
use crate::types::{
    AccountId, AccountStatus, Order, OrderId, OrderStatus, PoolAccount, Reservation,
    ReservationId, ReservationState, ResourceKind,
};

/// 能量池存储接口
#[async_trait]
pub trait PoolStorage: Send + Sync {
    // ==================== 账户操作 ====================

    /// 插入账户（忽略传入的 id，由存储分配）
    ///
    /// 地址已存在时返回 `DuplicateAddress`。
    async fn insert_account(&self, account: PoolAccount) -> PoolResult<PoolAccount>;

    /// 获取账户
    async fn get_account(&self, id: AccountId) -> PoolResult<Option<PoolAccount>>;

    /// 根据地址获取账户
    async fn get_account_by_address(&self, address: &str) -> PoolResult<Option<PoolAccount>>;

    /// 列出所有账户（按 id 升序）
    async fn list_accounts(&self) -> PoolResult<Vec<PoolAccount>>;

    /// 更新账户（地址不可变）
    async fn update_account(&self, account: &PoolAccount) -> PoolResult<()>;

    /// 批量设置账户状态（单个事务；任一 id 不存在则整体失败）
    async fn batch_update_status(
        &self,
        ids: &[AccountId],
        status: AccountStatus,
    ) -> PoolResult<Vec<PoolAccount>>;

    /// 删除账户（存在未结预留时返回 `AccountInUse`）
    async fn delete_account(&self, id: AccountId) -> PoolResult<()>;

    // ==================== 预留操作 ====================

    /// 原子批量创建预留（全部成功或全部失败）
    ///
    /// 对每条预留检查 `held(account, kind) + amount <= observed_capacity`，
    /// 不满足时返回 `CapacityExceeded`；账户设有日/月上限时，窗口内已预留 +
    /// 已确认量加上本批不得超过上限，否则返回 `CapExceeded`。
    /// 任一检查失败都不写入任何记录。
    async fn reserve_batch(&self, reservations: &[Reservation]) -> PoolResult<()>;

    /// 获取预留
    async fn get_reservation(&self, id: &ReservationId) -> PoolResult<Option<Reservation>>;

    /// 根据外部引用列出预留
    async fn list_reservations_by_ref(&self, external_ref: &str) -> PoolResult<Vec<Reservation>>;

    /// 列出所有未结预留
    async fn list_open_reservations(&self) -> PoolResult<Vec<Reservation>>;

    /// 所有账户的持有量
    async fn held_amounts(&self) -> PoolResult<HashMap<(AccountId, ResourceKind), HeldCapacity>>;

    /// 记录代理交易ID（仅对未结预留）
    async fn set_reservation_tx(&self, id: &ReservationId, tx_id: &str) -> PoolResult<()>;

    /// 批量状态迁移（单个事务）
    ///
    /// 已处于目标状态的预留被跳过；其他非法迁移使整个批次失败。
    /// 返回实际发生迁移的预留。
    async fn transition_reservations(
        &self,
        ids: &[ReservationId],
        target: ReservationState,
        reason: Option<&str>,
    ) -> PoolResult<Vec<Reservation>>;

    /// 自 `since` 起账户已预留 + 已确认的数量（用于日/月上限）
    async fn committed_since(
        &self,
        account_id: AccountId,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> PoolResult<u64>;

    // ==================== 订单操作 ====================

    /// 插入订单（同一支付哈希已有订单时返回 `DuplicateOrder`）
    async fn insert_order(&self, order: &Order) -> PoolResult<()>;

    /// 获取订单
    async fn get_order(&self, id: &OrderId) -> PoolResult<Option<Order>>;

    /// 根据支付哈希获取订单
    async fn get_order_by_ref(&self, external_ref: &str) -> PoolResult<Option<Order>>;

    /// 乐观锁更新订单
    ///
    /// 存储中的版本必须等于 `order.version`，否则返回
    /// `ConcurrentModification`。成功后返回版本号加一的订单。
    async fn update_order(&self, order: &Order) -> PoolResult<Order>;

    /// 列出指定状态的订单
    async fn list_orders_by_status(&self, status: OrderStatus) -> PoolResult<Vec<Order>>;

    // ==================== 统计 ====================

    /// 获取统计信息
    async fn get_stats(&self) -> PoolResult<StorageStats>;
}

/// 账户持有量（未结预留的汇总列）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeldCapacity {
    /// 未结预留总量
    pub amount: u64,
    /// 未结预留条数
    pub open: u64,
}

impl HeldCapacity {
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.amount.to_be_bytes());
        out[8..].copy_from_slice(&self.open.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let mut amount = [0u8; 8];
        let mut open = [0u8; 8];
        amount.copy_from_slice(&bytes[..8]);
        open.copy_from_slice(&bytes[8..]);
        Some(Self {
            amount: u64::from_be_bytes(amount),
            open: u64::from_be_bytes(open),
        })
    }
}

/// 账户上限的统计窗口（UTC 自然日 / 自然月）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapWindow {
    Daily,
    Monthly,
}

impl CapWindow {
    pub const ALL: [CapWindow; 2] = [CapWindow::Daily, CapWindow::Monthly];

    /// 账户在该窗口的上限
    pub fn cap(&self, account: &PoolAccount) -> Option<u64> {
        match self {
            CapWindow::Daily => account.daily_cap,
            CapWindow::Monthly => account.monthly_cap,
        }
    }

    /// `at` 所在窗口的标识
    pub fn period(&self, at: DateTime<Utc>) -> String {
        match self {
            CapWindow::Daily => at.format("%Y-%m-%d").to_string(),
            CapWindow::Monthly => at.format("%Y-%m").to_string(),
        }
    }
}

impl std::fmt::Display for CapWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapWindow::Daily => write!(f, "daily"),
            CapWindow::Monthly => write!(f, "monthly"),
        }
    }
}

/// 存储统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// 账户总数
    pub total_accounts: u64,
    /// 活跃账户数
    pub active_accounts: u64,
    /// 预留总数
    pub total_reservations: u64,
    /// 未结预留数
    pub open_reservations: u64,
    /// 订单总数
    pub total_orders: u64,
    /// 非终态订单数
    pub pending_orders: u64,
}

/// 存储配置
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// 数据目录（为空时使用临时库）
    pub data_dir: String,
    /// 缓存大小（字节）
    pub cache_size: u64,
    /// 刷盘间隔（毫秒）
    pub flush_every_ms: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./energy_pool_data".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_every_ms: Some(500),
        }
    }
}

impl StorageConfig {
    /// 从环境变量加载（ENERGY_POOL_DATA_DIR）
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("ENERGY_POOL_DATA_DIR") {
            config.data_dir = dir;
        }
        config
    }

    /// 创建开发配置
    pub fn development() -> Self {
        Self {
            data_dir: "./energy_pool_dev_data".to_string(),
            cache_size: 16 * 1024 * 1024, // 16MB
            flush_every_ms: Some(1_000),
        }
    }

    /// 创建测试配置（临时库）
    pub fn test() -> Self {
        Self {
            data_dir: "".to_string(),
            cache_size: 4 * 1024 * 1024, // 4MB
            flush_every_ms: None,
        }
    }
}

// 重新导出
pub use self::sled::SledStorage;
pub use memory::MemoryStorage;
