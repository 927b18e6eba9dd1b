//! Order - 闪租订单
//!
//! 一次资源租赁交易：目标地址、请求资源量、价格、支付引用与处理审计轨迹。
//!
//! # 状态机
//!
//! ```text
//! received → validated → calculated → allocated → delegated → completed
//!     │           │            │            │           │
//!     └───────────┴────────────┴────────────┴───────────┴──→ failed
//!     │           │            │            │           │
//!     └───────────┴────────────┴────────────┴───────────┴──→ cancelled
//! ```
//!
//! - 不允许跳过任何状态
//! - `delegated` 之后的取消必须先走释放 + 链上回收路径
//! - 终态订单保留用于审计，不删除

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::common::*;
use crate::error::{PoolError, PoolResult};

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum OrderStatus {
    /// 已接收（支付已检测到）
    #[default]
    Received,
    /// 支付已校验
    Validated,
    /// 已计算资源量与价格
    Calculated,
    /// 已分配（预留已创建）
    Allocated,
    /// 已代理（链上交易已提交）
    Delegated,
    /// 已完成
    Completed,
    /// 已失败
    Failed,
    /// 已取消
    Cancelled,
}

impl OrderStatus {
    /// 是否是终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 正常流程的下一状态
    pub fn next(&self) -> Option<OrderStatus> {
        match self {
            Self::Received => Some(Self::Validated),
            Self::Validated => Some(Self::Calculated),
            Self::Calculated => Some(Self::Allocated),
            Self::Allocated => Some(Self::Delegated),
            Self::Delegated => Some(Self::Completed),
            Self::Completed | Self::Failed | Self::Cancelled => None,
        }
    }

    /// 是否可以转换到目标状态
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            Self::Failed | Self::Cancelled => true,
            _ => self.next() == Some(target),
        }
    }

    /// 取消时是否需要链上回收
    pub fn requires_undelegation(&self) -> bool {
        matches!(self, Self::Delegated)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "received" => Some(Self::Received),
            "validated" => Some(Self::Validated),
            "calculated" => Some(Self::Calculated),
            "allocated" => Some(Self::Allocated),
            "delegated" => Some(Self::Delegated),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::Calculated => "calculated",
            Self::Allocated => "allocated",
            Self::Delegated => "delegated",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// 支付事件（来自外部支付检测层）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// 付款地址
    pub from_address: String,
    /// 资源接收地址（为空时使用付款地址）
    pub receiver_address: Option<String>,
    /// 支付金额（SUN）
    pub amount_sun: u64,
    /// 支付交易哈希
    pub payment_tx_ref: String,
    /// 网络标识
    pub network_id: String,
    /// 是否已确认
    pub confirmed: bool,
    /// 支付在链上被观察到的时间
    pub observed_at: DateTime<Utc>,
}

impl PaymentEvent {
    /// 已确认、刚观察到的支付（资源发往付款地址）
    pub fn new(
        from_address: impl Into<String>,
        amount_sun: u64,
        payment_tx_ref: impl Into<String>,
        network_id: impl Into<String>,
    ) -> Self {
        Self {
            from_address: from_address.into(),
            receiver_address: None,
            amount_sun,
            payment_tx_ref: payment_tx_ref.into(),
            network_id: network_id.into(),
            confirmed: true,
            observed_at: Utc::now(),
        }
    }

    /// 指定资源接收地址
    pub fn with_receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver_address = Some(receiver.into());
        self
    }

    /// 接收资源的地址
    pub fn target_address(&self) -> &str {
        self.receiver_address.as_deref().unwrap_or(&self.from_address)
    }
}

/// 计算阶段的全部输入与输出（可复算审计）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationInputs {
    /// 支付金额（SUN）
    pub payment_sun: u64,
    /// 单价（SUN / 单位）
    pub price_per_unit_sun: u64,
    /// 每单位资源量
    pub resource_per_unit: u64,
    /// 单笔订单最大单位数
    pub max_units: u64,
    /// 资源类型
    pub kind: ResourceKind,
    /// 计算得到的单位数
    pub units: u64,
    /// 请求资源量
    pub requested_amount: u64,
    /// 计价（SUN）
    pub computed_price_sun: u64,
    /// 超付金额（SUN）
    pub overpayment_sun: u64,
    /// 租期（秒）
    pub duration_secs: u64,
}

/// 分配分项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegStatus {
    /// 已预留，待代理
    Planned,
    /// 链上代理成功
    Delegated,
    /// 链上拒绝（已释放）
    Rejected,
    /// 已释放
    Released,
    /// 已回收（取消后链上回收）
    Undelegated,
}

/// 分配分项（一个账户、一笔预留）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLeg {
    pub reservation_id: ReservationId,
    pub account_id: AccountId,
    pub address: String,
    pub amount: u64,
    pub status: LegStatus,
    pub tx_id: Option<String>,
    pub reason: Option<String>,
}

/// 处理记录（仅追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingEvent {
    pub at: DateTime<Utc>,
    pub status: OrderStatus,
    pub actor: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

/// 闪租订单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// 订单ID
    pub id: OrderId,

    /// 支付交易哈希（非终态订单内唯一）
    pub external_ref: String,

    /// 网络标识
    pub network_id: String,

    /// 付款地址
    pub payer_address: String,

    /// 资源接收地址
    pub target_address: String,

    /// 支付金额（SUN）
    pub payment_amount_sun: u64,

    /// 支付被观察到的时间
    pub payment_observed_at: DateTime<Utc>,

    /// 支付是否已确认
    pub payment_confirmed: bool,

    /// 资源类型
    pub kind: ResourceKind,

    /// 请求资源量（计算后填充）
    pub requested_amount: u64,

    /// 计价（SUN，计算后填充）
    pub computed_price_sun: u64,

    /// 租期（秒）
    pub duration_secs: u64,

    /// 状态
    pub status: OrderStatus,

    /// 失败原因（面向用户）
    pub failure_reason: Option<String>,

    /// 计算输入
    pub calculation: Option<CalculationInputs>,

    /// 分配分项
    pub legs: Vec<AllocationLeg>,

    /// 处理审计轨迹（仅追加）
    pub processing_details: Vec<ProcessingEvent>,

    /// 乐观锁版本
    pub version: u64,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// 由支付事件创建订单（状态为 received）
    pub fn from_payment(payment: &PaymentEvent, kind: ResourceKind, duration_secs: u64) -> Self {
        let now = Utc::now();
        let mut order = Self {
            id: Uuid::new_v4(),
            external_ref: payment.payment_tx_ref.clone(),
            network_id: payment.network_id.clone(),
            payer_address: payment.from_address.clone(),
            target_address: payment.target_address().to_string(),
            payment_amount_sun: payment.amount_sun,
            payment_observed_at: payment.observed_at,
            payment_confirmed: payment.confirmed,
            kind,
            requested_amount: 0,
            computed_price_sun: 0,
            duration_secs,
            status: OrderStatus::Received,
            failure_reason: None,
            calculation: None,
            legs: Vec::new(),
            processing_details: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        order.record(
            "system",
            "payment received",
            serde_json::json!({
                "payment_tx_ref": payment.payment_tx_ref,
                "amount_sun": payment.amount_sun,
                "network_id": payment.network_id,
            }),
        );
        order
    }

    /// 状态迁移并追加审计记录
    pub fn transition(&mut self, target: OrderStatus, message: impl Into<String>) -> PoolResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(PoolError::StateTransition(format!(
                "order {} cannot move from {} to {}",
                self.id, self.status, target
            )));
        }
        self.status = target;
        self.record("system", message, serde_json::Value::Null);
        Ok(())
    }

    /// 标记失败并记录原因
    pub fn fail(&mut self, reason: impl Into<String>, detail: serde_json::Value) -> PoolResult<()> {
        let reason = reason.into();
        if !self.status.can_transition_to(OrderStatus::Failed) {
            return Err(PoolError::StateTransition(format!(
                "order {} is already {}",
                self.id, self.status
            )));
        }
        self.status = OrderStatus::Failed;
        self.failure_reason = Some(reason.clone());
        self.record("system", format!("failed: {}", reason), detail);
        Ok(())
    }

    /// 追加审计记录（不改变状态）
    pub fn record(&mut self, actor: &str, message: impl Into<String>, detail: serde_json::Value) {
        let now = Utc::now();
        self.processing_details.push(ProcessingEvent {
            at: now,
            status: self.status,
            actor: actor.to_string(),
            message: message.into(),
            detail,
        });
        self.updated_at = now;
    }

    /// 仍占用预留的分项
    pub fn open_legs(&self) -> impl Iterator<Item = &AllocationLeg> {
        self.legs
            .iter()
            .filter(|l| matches!(l.status, LegStatus::Planned | LegStatus::Delegated))
    }

    /// 已在链上代理成功的分项
    pub fn delegated_legs(&self) -> impl Iterator<Item = &AllocationLeg> {
        self.legs.iter().filter(|l| l.status == LegStatus::Delegated)
    }

    /// 已代理总量
    pub fn delegated_amount(&self) -> u64 {
        self.delegated_legs().map(|l| l.amount).sum()
    }

    /// 仍有效（计划中或已代理）的分配总量
    pub fn allocated_amount(&self) -> u64 {
        self.open_legs().map(|l| l.amount).sum()
    }

    /// 查找分项
    pub fn leg_mut(&mut self, reservation_id: &ReservationId) -> Option<&mut AllocationLeg> {
        self.legs.iter_mut().find(|l| &l.reservation_id == reservation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment() -> PaymentEvent {
        PaymentEvent {
            from_address: "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7".to_string(),
            receiver_address: None,
            amount_sun: 3_000_000,
            payment_tx_ref: "abc123".to_string(),
            network_id: "mainnet".to_string(),
            confirmed: true,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_state_skipping() {
        assert!(OrderStatus::Received.can_transition_to(OrderStatus::Validated));
        assert!(!OrderStatus::Received.can_transition_to(OrderStatus::Calculated));
        assert!(!OrderStatus::Validated.can_transition_to(OrderStatus::Allocated));
        assert!(OrderStatus::Allocated.can_transition_to(OrderStatus::Delegated));
        assert!(!OrderStatus::Allocated.can_transition_to(OrderStatus::Completed));
    }

    #[test]
    fn test_terminal_states() {
        for status in [OrderStatus::Completed, OrderStatus::Failed, OrderStatus::Cancelled] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(OrderStatus::Failed));
            assert!(status.next().is_none());
        }
        assert!(OrderStatus::Delegated.can_transition_to(OrderStatus::Failed));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(OrderStatus::parse("Completed"), Some(OrderStatus::Completed));
        assert_eq!(OrderStatus::parse("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::parse("done"), None);
    }

    #[test]
    fn test_transition_appends_audit_trail() {
        let mut order = Order::from_payment(&payment(), ResourceKind::Energy, 3600);
        assert_eq!(order.processing_details.len(), 1);

        order.transition(OrderStatus::Validated, "payment valid").unwrap();
        assert_eq!(order.status, OrderStatus::Validated);
        assert_eq!(order.processing_details.len(), 2);

        let err = order.transition(OrderStatus::Completed, "skip").unwrap_err();
        assert!(matches!(err, PoolError::StateTransition(_)));
        assert_eq!(order.processing_details.len(), 2);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut order = Order::from_payment(&payment(), ResourceKind::Energy, 3600);
        order
            .fail("no capacity available right now", serde_json::Value::Null)
            .unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(
            order.failure_reason.as_deref(),
            Some("no capacity available right now")
        );
        assert!(order.fail("again", serde_json::Value::Null).is_err());
    }

    #[test]
    fn test_target_defaults_to_payer() {
        let mut p = payment();
        assert_eq!(p.target_address(), p.from_address);
        p.receiver_address = Some("TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf".to_string());
        assert_eq!(p.target_address(), "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf");
    }
}
