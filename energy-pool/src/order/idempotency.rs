//! 支付去重
//!
//! 同一支付哈希最多对应一个订单：
//!
//! - 不存在：允许创建
//! - 存在非终态订单：继续处理该订单
//! - 存在终态订单：拒绝，不产生任何副作用

use std::sync::Arc;
use std::time::Duration;

use crate::error::PoolResult;
use crate::retry::with_timeout;
use crate::storage::PoolStorage;
use crate::types::Order;

/// 去重检查结果
#[derive(Debug, Clone)]
pub enum IntakeCheck {
    /// 不存在，允许创建
    NotExists,
    /// 存在进行中的订单
    Resume(Order),
    /// 存在已结束的订单
    Terminal(Order),
}

/// 支付去重检查器
pub struct IntakeChecker<S: PoolStorage> {
    storage: Arc<S>,
    timeout: Duration,
}

impl<S: PoolStorage> IntakeChecker<S> {
    pub fn new(storage: Arc<S>, timeout: Duration) -> Self {
        Self { storage, timeout }
    }

    /// 按支付哈希检查
    pub async fn check(&self, payment_tx_ref: &str) -> PoolResult<IntakeCheck> {
        let existing = with_timeout(
            "get_order_by_ref",
            self.timeout,
            self.storage.get_order_by_ref(payment_tx_ref),
        )
        .await?;

        Ok(match existing {
            None => IntakeCheck::NotExists,
            Some(order) if order.status.is_terminal() => {
                tracing::debug!(
                    order_id = %order.id,
                    status = %order.status,
                    "Intake check: payment already settled"
                );
                IntakeCheck::Terminal(order)
            }
            Some(order) => {
                tracing::debug!(
                    order_id = %order.id,
                    status = %order.status,
                    "Intake check: order in progress"
                );
                IntakeCheck::Resume(order)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{OrderStatus, PaymentEvent, ResourceKind};
    use chrono::Utc;

    fn order(tx_ref: &str) -> Order {
        Order::from_payment(
            &PaymentEvent {
                from_address: "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7".to_string(),
                receiver_address: None,
                amount_sun: 3_000_000,
                payment_tx_ref: tx_ref.to_string(),
                network_id: "nile".to_string(),
                confirmed: true,
                observed_at: Utc::now(),
            },
            ResourceKind::Energy,
            3_600,
        )
    }

    #[tokio::test]
    async fn test_not_exists() {
        let checker = IntakeChecker::new(Arc::new(MemoryStorage::new()), Duration::from_secs(1));
        assert!(matches!(
            checker.check("abc").await.unwrap(),
            IntakeCheck::NotExists
        ));
    }

    #[tokio::test]
    async fn test_in_progress_resumes() {
        let storage = Arc::new(MemoryStorage::new());
        storage.insert_order(&order("abc")).await.unwrap();

        let checker = IntakeChecker::new(storage, Duration::from_secs(1));
        assert!(matches!(
            checker.check("abc").await.unwrap(),
            IntakeCheck::Resume(_)
        ));
    }

    #[tokio::test]
    async fn test_terminal_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let mut failed = order("abc");
        failed.fail("payment invalid", serde_json::Value::Null).unwrap();
        storage.insert_order(&failed).await.unwrap();

        let checker = IntakeChecker::new(storage, Duration::from_secs(1));
        match checker.check("abc").await.unwrap() {
            IntakeCheck::Terminal(order) => assert_eq!(order.status, OrderStatus::Failed),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
