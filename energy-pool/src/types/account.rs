//! PoolAccount - 池账户
//!
//! 持有质押资源并可对外代理能量/带宽的链上账户。
//!
//! # 状态
//!
//! ```text
//! active ⇄ inactive
//!   ⇅
//! maintenance   (连续链上错误时由分配引擎自动降级，或由管理员设置)
//! ```
//!
//! 账户被未结预留引用时不得物理删除。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use super::common::*;

/// 池账户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolAccount {
    /// 账户ID（创建顺序，用作优先级相同时的确定性排序）
    pub id: AccountId,

    /// 链上地址（全局唯一）
    pub address: String,

    /// 显示名称
    pub name: String,

    /// 加密后的签名私钥（hex: nonce || ciphertext）
    pub encrypted_key: String,

    /// 账户状态
    pub status: AccountStatus,

    /// 优先级（数值越小越优先）
    pub priority: u32,

    /// 单位成本（TRX / 单位）
    pub cost_per_unit: Decimal,

    /// 账户类别
    pub class: AccountClass,

    /// 日代理上限（资源单位）
    pub daily_cap: Option<u64>,

    /// 月代理上限（资源单位）
    pub monthly_cap: Option<u64>,

    /// 备注
    pub description: Option<String>,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

impl PoolAccount {
    /// 是否可参与分配
    pub fn is_allocatable(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// 账户状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum AccountStatus {
    /// 参与分配
    #[default]
    Active,
    /// 停用
    Inactive,
    /// 维护中（链上错误过多或人工维护）
    Maintenance,
}

impl AccountStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// 账户类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum AccountClass {
    /// 自有账户
    #[default]
    Own,
    /// 代理商账户
    Agent,
    /// 第三方账户
    ThirdParty,
}

impl AccountClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "own" => Some(Self::Own),
            "agent" => Some(Self::Agent),
            "third_party" => Some(Self::ThirdParty),
            _ => None,
        }
    }
}

impl fmt::Display for AccountClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Own => write!(f, "own"),
            Self::Agent => write!(f, "agent"),
            Self::ThirdParty => write!(f, "third_party"),
        }
    }
}

/// 新增账户请求
///
/// 私钥以明文传入，由 [`crate::pool::AccountPoolManager`] 加密后落库。
pub struct NewAccount {
    pub address: String,
    pub name: String,
    pub private_key_hex: Zeroizing<String>,
    pub priority: u32,
    pub cost_per_unit: Decimal,
    pub class: AccountClass,
    pub daily_cap: Option<u64>,
    pub monthly_cap: Option<u64>,
    pub description: Option<String>,
}

impl NewAccount {
    /// 以默认参数创建
    pub fn new(address: impl Into<String>, private_key_hex: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: address.clone(),
            address,
            private_key_hex: Zeroizing::new(private_key_hex.into()),
            priority: 100,
            cost_per_unit: Decimal::ZERO,
            class: AccountClass::Own,
            daily_cap: None,
            monthly_cap: None,
            description: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_class(mut self, class: AccountClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_cost(mut self, cost_per_unit: Decimal) -> Self {
        self.cost_per_unit = cost_per_unit;
        self
    }

    pub fn with_caps(mut self, daily: Option<u64>, monthly: Option<u64>) -> Self {
        self.daily_cap = daily;
        self.monthly_cap = monthly;
        self
    }
}

impl fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccount")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("private_key_hex", &"<redacted>")
            .field("priority", &self.priority)
            .field("cost_per_unit", &self.cost_per_unit)
            .field("class", &self.class)
            .field("daily_cap", &self.daily_cap)
            .field("monthly_cap", &self.monthly_cap)
            .finish()
    }
}

/// 账户可修改字段（None 表示不修改）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub name: Option<String>,
    pub priority: Option<u32>,
    pub cost_per_unit: Option<Decimal>,
    pub class: Option<AccountClass>,
    pub daily_cap: Option<Option<u64>>,
    pub monthly_cap: Option<Option<u64>>,
    pub description: Option<Option<String>>,
}

impl AccountUpdate {
    /// 应用到账户
    pub fn apply(&self, account: &mut PoolAccount) {
        if let Some(name) = &self.name {
            account.name = name.clone();
        }
        if let Some(priority) = self.priority {
            account.priority = priority;
        }
        if let Some(cost) = self.cost_per_unit {
            account.cost_per_unit = cost;
        }
        if let Some(class) = self.class {
            account.class = class;
        }
        if let Some(cap) = self.daily_cap {
            account.daily_cap = cap;
        }
        if let Some(cap) = self.monthly_cap {
            account.monthly_cap = cap;
        }
        if let Some(description) = &self.description {
            account.description = description.clone();
        }
        account.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_display() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Inactive,
            AccountStatus::Maintenance,
        ] {
            assert_eq!(AccountStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(AccountClass::parse("third-party"), Some(AccountClass::ThirdParty));
    }

    #[test]
    fn test_new_account_debug_redacts_key() {
        let account = NewAccount::new("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7", "deadbeef");
        let debug = format!("{:?}", account);
        assert!(!debug.contains("deadbeef"));
        assert!(debug.contains("<redacted>"));
    }
}
