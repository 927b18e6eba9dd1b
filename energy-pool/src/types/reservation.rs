//! Reservation - 容量预留
//!
//! 对池账户可领取容量的本地、限时占用。
//!
//! # 状态机
//!
//! ```text
//! reserved ──→ confirmed   (代理成功，订单完成)
//!     │
//!     └──────→ released    (失败 / 取消 / 超时清扫)
//! ```
//!
//! 预留只做状态迁移，不删除记录。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::common::*;

/// 容量预留
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// 预留ID（同时作为链上代理意图ID）
    pub id: ReservationId,

    /// 池账户
    pub account_id: AccountId,

    /// 资源类型
    pub kind: ResourceKind,

    /// 预留数量（资源单位）
    pub amount: u64,

    /// 外部引用（订单ID）
    pub external_ref: String,

    /// 所属用户（接收地址）
    pub owner: Option<String>,

    /// 状态
    pub state: ReservationState,

    /// 预留时观察到的账户容量基数（链上快照）
    pub observed_capacity: u64,

    /// 代理交易ID（代理成功后填充）
    pub tx_id: Option<String>,

    /// 释放原因
    pub release_reason: Option<String>,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,

    /// 超时时间（超时未确认/释放由清扫任务自动释放）
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// 由预留请求创建
    pub fn from_request(request: &ReservationRequest, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: request.account_id,
            kind: request.kind,
            amount: request.amount,
            external_ref: request.external_ref.clone(),
            owner: request.owner.clone(),
            state: ReservationState::Reserved,
            observed_capacity: request.observed_capacity,
            tx_id: None,
            release_reason: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// 是否仍占用容量
    pub fn is_open(&self) -> bool {
        self.state == ReservationState::Reserved
    }

    /// 是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.expires_at <= now
    }
}

/// 预留状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum ReservationState {
    /// 已预留
    #[default]
    Reserved,
    /// 已确认
    Confirmed,
    /// 已释放
    Released,
}

impl ReservationState {
    /// 是否是终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Released)
    }

    /// 是否可以转换到目标状态
    pub fn can_transition_to(&self, target: ReservationState) -> bool {
        matches!(
            (self, target),
            (Self::Reserved, Self::Confirmed) | (Self::Reserved, Self::Released)
        )
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved => write!(f, "reserved"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Released => write!(f, "released"),
        }
    }
}

/// 预留请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub account_id: AccountId,
    pub kind: ResourceKind,
    pub amount: u64,
    pub external_ref: String,
    pub owner: Option<String>,
    /// 规划时观察到的容量基数；提交时账户持有总量不得超过此值
    pub observed_capacity: u64,
}

/// 释放发起方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseActor {
    /// 订单流程
    Order,
    /// 系统清扫（不归属任何用户）
    System,
    /// 运维人员
    Operator,
}

impl fmt::Display for ReleaseActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Order => write!(f, "order"),
            Self::System => write!(f, "system"),
            Self::Operator => write!(f, "operator"),
        }
    }
}
