//! 能量池核心类型定义
//!
//! # 核心对象
//!
//! - [`PoolAccount`]: 池账户 - 持有质押资源、可对外代理的链上账户
//! - [`ResourceSnapshot`]: 资源快照 - 由链上计数器归一化得到（不持久化）
//! - [`Reservation`]: 预留 - 对账户可领取容量的本地占用
//! - [`Order`]: 订单 - 一次闪租交易的完整生命周期
//!
//! # 设计原则
//!
//! - 地址全局唯一
//! - 可用容量永不为负（链上漂移值钳制为零并记录）
//! - 同一支付哈希最多一个非终态订单
//! - 订单与预留只做状态迁移，不物理删除

pub mod account;
pub mod common;
pub mod order;
pub mod reservation;
pub mod snapshot;

pub use account::*;
pub use common::*;
pub use order::*;
pub use reservation::*;
pub use snapshot::*;
