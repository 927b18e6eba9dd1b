//! 支付校验与计价
//!
//! 计价完全由支付金额与配置常量决定，输入全部记录在
//! [`CalculationInputs`] 中，可离线复算。

use chrono::{DateTime, Utc};

use crate::config::{PricingConfig, TronNetwork};
use crate::error::{PoolError, PoolResult};
use crate::types::{validate_address, CalculationInputs, PaymentEvent};

/// 校验支付事件（validated 阶段）
pub fn validate_payment(
    payment: &PaymentEvent,
    config: &PricingConfig,
    network: TronNetwork,
    now: DateTime<Utc>,
) -> PoolResult<()> {
    if TronNetwork::parse(&payment.network_id) != Some(network) {
        return Err(PoolError::InvalidPayment(format!(
            "payment is on network '{}', pool serves {}",
            payment.network_id,
            network.id()
        )));
    }
    if payment.amount_sun == 0 {
        return Err(PoolError::InvalidPayment("amount is zero".to_string()));
    }
    if !payment.confirmed {
        return Err(PoolError::InvalidPayment(
            "payment not confirmed".to_string(),
        ));
    }

    let age = now.signed_duration_since(payment.observed_at);
    if age.num_seconds() > config.payment_freshness_secs as i64 {
        return Err(PoolError::InvalidPayment(format!(
            "payment is {}s old, freshness window is {}s",
            age.num_seconds(),
            config.payment_freshness_secs
        )));
    }

    validate_address(&payment.from_address)
        .map_err(|e| PoolError::InvalidPayment(format!("payer: {}", e)))?;
    validate_address(payment.target_address())
        .map_err(|e| PoolError::InvalidPayment(format!("receiver: {}", e)))?;
    Ok(())
}

/// 计算租赁单位、资源量与价格（calculated 阶段）
///
/// `units = floor(amount / price)`，上限 `max_units_per_order`，
/// 低于 `min_units` 拒绝；超出计价的部分记为超付。
pub fn calculate(amount_sun: u64, config: &PricingConfig) -> PoolResult<CalculationInputs> {
    if config.price_per_unit_sun == 0 {
        return Err(PoolError::Configuration(
            "price_per_unit_sun must be non-zero".to_string(),
        ));
    }

    let affordable = amount_sun / config.price_per_unit_sun;
    let units = affordable.min(config.max_units_per_order);
    if units < config.min_units {
        return Err(PoolError::InvalidPayment(format!(
            "payment of {} SUN buys {} units, minimum is {}",
            amount_sun, units, config.min_units
        )));
    }

    let requested_amount = units.checked_mul(config.resource_per_unit).ok_or_else(|| {
        PoolError::InvalidInput(format!("{} units overflow the resource amount", units))
    })?;
    let computed_price_sun = units * config.price_per_unit_sun;

    Ok(CalculationInputs {
        payment_sun: amount_sun,
        price_per_unit_sun: config.price_per_unit_sun,
        resource_per_unit: config.resource_per_unit,
        max_units: config.max_units_per_order,
        kind: config.resource_kind,
        units,
        requested_amount,
        computed_price_sun,
        overpayment_sun: amount_sun - computed_price_sun,
        duration_secs: config.duration_secs,
    })
}
