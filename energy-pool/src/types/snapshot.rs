//! ResourceSnapshot - 资源快照
//!
//! 链上计数器在 [`crate::accountant::ResourceAccountant`] 边界处归一化为固定结构，
//! 业务逻辑只接触快照，不接触链上原始响应。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::*;

/// 链上原始资源计数器（单一资源类型）
///
/// 数值保持有符号，便于在归一化时发现并钳制链上漂移产生的负值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChainResourceUsage {
    /// 链上报告的资源上限（资源单位）
    pub limit: i64,
    /// 已使用（资源单位）
    pub used: i64,
    /// 自身质押（SUN）
    pub staked: i64,
    /// 代理给他人（SUN）
    pub delegated_out: i64,
    /// 他人代理给本账户（SUN）
    pub delegated_in: i64,
}

/// 账户两类资源的原始计数器
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountResources {
    pub address: String,
    pub energy: ChainResourceUsage,
    pub bandwidth: ChainResourceUsage,
}

impl AccountResources {
    pub fn get(&self, kind: ResourceKind) -> &ChainResourceUsage {
        match kind {
            ResourceKind::Energy => &self.energy,
            ResourceKind::Bandwidth => &self.bandwidth,
        }
    }

    pub fn get_mut(&mut self, kind: ResourceKind) -> &mut ChainResourceUsage {
        match kind {
            ResourceKind::Energy => &mut self.energy,
            ResourceKind::Bandwidth => &mut self.bandwidth,
        }
    }
}

/// 资源快照（派生值，不持久化）
///
/// `available = total_from_staking + delegated_in - delegated_out - used`，下限为零。
/// `delegatable` 来自链上"当前可代理"视图，是能否立即代理的权威值。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub address: String,
    pub kind: ResourceKind,
    pub total_from_staking: u64,
    pub delegated_out: u64,
    pub delegated_in: u64,
    pub used: u64,
    pub available: u64,
    pub delegatable: u64,
    pub observed_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    /// 由归一化后的计数器构造快照
    pub fn new(
        address: impl Into<String>,
        kind: ResourceKind,
        total_from_staking: u64,
        delegated_out: u64,
        delegated_in: u64,
        used: u64,
        delegatable: u64,
    ) -> Self {
        let available = total_from_staking
            .saturating_add(delegated_in)
            .saturating_sub(delegated_out.saturating_add(used));

        Self {
            address: address.into(),
            kind,
            total_from_staking,
            delegated_out,
            delegated_in,
            used,
            available,
            delegatable,
            observed_at: Utc::now(),
        }
    }

    /// 可领取容量的基数（扣除本地预留之前）
    ///
    /// 代理入的资源不能再次代理，因此取公式值与链上可代理值中较小者。
    pub fn claimable_base(&self) -> u64 {
        self.available.min(self.delegatable)
    }

    /// 理论总容量（用于运营统计）
    pub fn theoretical_total(&self) -> u64 {
        self.total_from_staking
            .saturating_add(self.delegated_in)
            .saturating_sub(self.delegated_out)
    }
}
