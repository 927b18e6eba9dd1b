//! 通用类型定义
//!
//! 包含各模块共享的基础类型。

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{PoolError, PoolResult};

/// 1 TRX = 1_000_000 SUN
pub const SUN_PER_TRX: u64 = 1_000_000;

/// 池账户ID（由存储层按创建顺序分配）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AccountId(pub u64);

impl AccountId {
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 预留ID
pub type ReservationId = Uuid;

/// 订单ID
pub type OrderId = Uuid;

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[derive(Default)]
pub enum ResourceKind {
    /// 能量
    #[default]
    Energy,
    /// 带宽
    Bandwidth,
}

impl ResourceKind {
    /// 全部资源类型
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Energy, ResourceKind::Bandwidth];

    /// 链上接口使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Energy => "ENERGY",
            Self::Bandwidth => "BANDWIDTH",
        }
    }

    /// 从字符串解析（不区分大小写）
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ENERGY" => Some(Self::Energy),
            "BANDWIDTH" | "NET" => Some(Self::Bandwidth),
            _ => None,
        }
    }

    /// 存储键使用的单字节标识
    pub fn tag(&self) -> u8 {
        match self {
            Self::Energy => 1,
            Self::Bandwidth => 0,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// 校验 TRON Base58 地址格式
///
/// 只做结构校验（前缀、长度、字符集），校验和由链节点负责。
pub fn validate_address(address: &str) -> PoolResult<()> {
    if address.len() != 34 {
        return Err(PoolError::InvalidAddress(format!(
            "{}: expected 34 characters, got {}",
            address,
            address.len()
        )));
    }
    if !address.starts_with('T') {
        return Err(PoolError::InvalidAddress(format!(
            "{}: must start with 'T'",
            address
        )));
    }
    if let Some(c) = address.chars().find(|c| !BASE58_ALPHABET.contains(*c)) {
        return Err(PoolError::InvalidAddress(format!(
            "{}: invalid base58 character '{}'",
            address, c
        )));
    }
    Ok(())
}
