//! Sled 持久化存储实现
//!
//! 提供基于 Sled 嵌入式数据库的持久化存储实现。
//!
//! 每个多行变更都在一个跨 tree 的 sled 事务中完成；
//! 地址与支付哈希的唯一约束由独立索引 tree 在同一事务中维护。
//! 日/月上限用按窗口累计的用量计数器复核（事务内无法扫描 tree）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::Transactional;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

use super::{CapWindow, HeldCapacity, PoolStorage, StorageConfig, StorageStats};
use crate::error::{PoolError, PoolResult};
use crate::types::{
    AccountId, AccountStatus, Order, OrderId, OrderStatus, PoolAccount, Reservation,
    ReservationId, ReservationState, ResourceKind,
};

/// Tree 名称常量
const ACCOUNTS_TREE: &str = "accounts";
const ACCOUNT_ADDRESSES_TREE: &str = "account_addresses";
const RESERVATIONS_TREE: &str = "reservations";
const RESERVATION_REFS_TREE: &str = "reservation_refs";
const OPEN_RESERVATIONS_TREE: &str = "open_reservations";
const HOLDS_TREE: &str = "holds";
const CAP_USAGE_TREE: &str = "cap_usage";
const ORDERS_TREE: &str = "orders";
const ORDER_REFS_TREE: &str = "order_refs";

/// Sled 持久化存储
#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
    accounts: sled::Tree,
    account_addresses: sled::Tree,
    reservations: sled::Tree,
    reservation_refs: sled::Tree,
    open_reservations: sled::Tree,
    holds: sled::Tree,
    cap_usage: sled::Tree,
    orders: sled::Tree,
    order_refs: sled::Tree,
}

type TxError = ConflictableTransactionError<PoolError>;

fn abort(e: impl Into<PoolError>) -> TxError {
    ConflictableTransactionError::Abort(e.into())
}

fn finish<T>(result: TransactionResult<T, PoolError>) -> PoolResult<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => PoolError::Storage(e.to_string()),
    })
}

impl SledStorage {
    /// 使用配置创建新的 Sled 存储
    pub fn new(config: &StorageConfig) -> PoolResult<Self> {
        let mut sled_config = sled::Config::new().cache_capacity(config.cache_size);
        sled_config = if config.data_dir.is_empty() {
            sled_config.temporary(true)
        } else {
            sled_config.path(&config.data_dir)
        };
        sled_config = sled_config.flush_every_ms(config.flush_every_ms);

        let db = sled_config
            .open()
            .map_err(|e| PoolError::Storage(format!("Failed to open sled db: {}", e)))?;
        Self::from_db(db)
    }

    /// 打开或创建 Sled 数据库
    pub fn open<P: AsRef<Path>>(path: P) -> PoolResult<Self> {
        let db = sled::open(path)
            .map_err(|e| PoolError::Storage(format!("Failed to open sled db: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> PoolResult<Self> {
        let tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| PoolError::Storage(format!("Failed to open {} tree: {}", name, e)))
        };

        Ok(Self {
            accounts: tree(ACCOUNTS_TREE)?,
            account_addresses: tree(ACCOUNT_ADDRESSES_TREE)?,
            reservations: tree(RESERVATIONS_TREE)?,
            reservation_refs: tree(RESERVATION_REFS_TREE)?,
            open_reservations: tree(OPEN_RESERVATIONS_TREE)?,
            holds: tree(HOLDS_TREE)?,
            cap_usage: tree(CAP_USAGE_TREE)?,
            orders: tree(ORDERS_TREE)?,
            order_refs: tree(ORDER_REFS_TREE)?,
            db,
        })
    }

    /// 刷新到磁盘
    pub fn flush(&self) -> PoolResult<()> {
        self.db
            .flush()
            .map_err(|e| PoolError::Storage(format!("Failed to flush db: {}", e)))?;
        Ok(())
    }

    // ==================== 辅助方法 ====================

    fn serialize<T: Serialize>(value: &T) -> PoolResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| PoolError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> PoolResult<T> {
        serde_json::from_slice(bytes).map_err(|e| PoolError::Serialization(e.to_string()))
    }

    fn hold_key(account_id: AccountId, kind: ResourceKind) -> Vec<u8> {
        let mut key = account_id.to_be_bytes().to_vec();
        key.push(kind.tag());
        key
    }

    fn usage_key(
        account_id: AccountId,
        kind: ResourceKind,
        window: CapWindow,
        at: DateTime<Utc>,
    ) -> Vec<u8> {
        let mut key = Self::hold_key(account_id, kind);
        key.push(match window {
            CapWindow::Daily => b'd',
            CapWindow::Monthly => b'm',
        });
        key.extend_from_slice(window.period(at).as_bytes());
        key
    }

    fn read_u64(bytes: Option<sled::IVec>) -> u64 {
        bytes
            .and_then(|b| <[u8; 8]>::try_from(b.as_ref()).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0)
    }

    fn parse_hold_key(key: &[u8]) -> Option<(AccountId, ResourceKind)> {
        if key.len() != 9 {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&key[..8]);
        let kind = ResourceKind::ALL.into_iter().find(|k| k.tag() == key[8])?;
        Some((AccountId::from_be_bytes(id), kind))
    }

    fn ref_key(external_ref: &str, id: &Uuid) -> Vec<u8> {
        let mut key = Self::ref_prefix(external_ref);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn ref_prefix(external_ref: &str) -> Vec<u8> {
        let mut key = external_ref.as_bytes().to_vec();
        key.push(0);
        key
    }

    fn parse_uuid(bytes: &[u8]) -> PoolResult<Uuid> {
        Uuid::from_slice(bytes).map_err(|e| PoolError::Storage(format!("corrupt id: {}", e)))
    }

    fn scan_values<T: DeserializeOwned>(tree: &sled::Tree) -> PoolResult<Vec<T>> {
        let mut result = Vec::new();
        for item in tree.iter() {
            let (_, value) = item?;
            result.push(Self::deserialize(&value)?);
        }
        Ok(result)
    }
}

#[async_trait]
impl PoolStorage for SledStorage {
    // ==================== 账户操作 ====================

    async fn insert_account(&self, mut account: PoolAccount) -> PoolResult<PoolAccount> {
        account.id = AccountId(self.db.generate_id()? + 1);
        let value = Self::serialize(&account)?;

        finish((&self.accounts, &self.account_addresses).transaction(|(accounts, addresses)| {
            if let Some(existing) = addresses.get(account.address.as_bytes())? {
                let mut id = [0u8; 8];
                id.copy_from_slice(&existing);
                return Err(abort(PoolError::DuplicateAddress {
                    address: account.address.clone(),
                    existing: AccountId::from_be_bytes(id),
                }));
            }
            addresses.insert(account.address.as_bytes(), &account.id.to_be_bytes()[..])?;
            accounts.insert(&account.id.to_be_bytes()[..], value.clone())?;
            Ok(())
        }))?;

        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> PoolResult<Option<PoolAccount>> {
        match self.accounts.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_account_by_address(&self, address: &str) -> PoolResult<Option<PoolAccount>> {
        match self.account_addresses.get(address.as_bytes())? {
            Some(id) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&id);
                self.get_account(AccountId::from_be_bytes(bytes)).await
            }
            None => Ok(None),
        }
    }

    async fn list_accounts(&self) -> PoolResult<Vec<PoolAccount>> {
        // 大端键保证按 id 升序
        Self::scan_values(&self.accounts)
    }

    async fn update_account(&self, account: &PoolAccount) -> PoolResult<()> {
        let value = Self::serialize(account)?;
        finish(self.accounts.transaction(|accounts| {
            let key = account.id.to_be_bytes();
            let stored: PoolAccount = match accounts.get(key)? {
                Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                None => return Err(abort(PoolError::AccountNotFound(account.id))),
            };
            if stored.address != account.address {
                return Err(abort(PoolError::InvalidInput(format!(
                    "account {} address is immutable",
                    account.id
                ))));
            }
            accounts.insert(&key[..], value.clone())?;
            Ok(())
        }))
    }

    async fn batch_update_status(
        &self,
        ids: &[AccountId],
        status: AccountStatus,
    ) -> PoolResult<Vec<PoolAccount>> {
        let now = Utc::now();
        finish(self.accounts.transaction(|accounts| {
            let mut updated = Vec::with_capacity(ids.len());
            for id in ids {
                let key = id.to_be_bytes();
                let mut account: PoolAccount = match accounts.get(key)? {
                    Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                    None => return Err(abort(PoolError::AccountNotFound(*id))),
                };
                account.status = status;
                account.updated_at = now;
                accounts.insert(&key[..], Self::serialize(&account).map_err(abort)?)?;
                updated.push(account);
            }
            Ok(updated)
        }))
    }

    async fn delete_account(&self, id: AccountId) -> PoolResult<()> {
        finish(
            (&self.accounts, &self.account_addresses, &self.holds).transaction(
                |(accounts, addresses, holds)| {
                    let key = id.to_be_bytes();
                    let account: PoolAccount = match accounts.get(key)? {
                        Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                        None => return Err(abort(PoolError::AccountNotFound(id))),
                    };

                    let mut open = 0;
                    for kind in ResourceKind::ALL {
                        if let Some(bytes) = holds.get(Self::hold_key(id, kind))? {
                            open += HeldCapacity::from_bytes(&bytes).map(|h| h.open).unwrap_or(0);
                        }
                    }
                    if open > 0 {
                        return Err(abort(PoolError::AccountInUse {
                            account_id: id,
                            open: open as usize,
                        }));
                    }

                    accounts.remove(&key[..])?;
                    addresses.remove(account.address.as_bytes())?;
                    Ok(())
                },
            ),
        )
    }

    // ==================== 预留操作 ====================

    async fn reserve_batch(&self, reservations: &[Reservation]) -> PoolResult<()> {
        let values = reservations
            .iter()
            .map(Self::serialize)
            .collect::<PoolResult<Vec<_>>>()?;

        finish(
            (
                &self.accounts,
                &self.reservations,
                &self.holds,
                &self.open_reservations,
                &self.reservation_refs,
                &self.cap_usage,
            )
                .transaction(|(accounts, stored, holds, open, refs, usage)| {
                    for (r, value) in reservations.iter().zip(values.iter()) {
                        let account: PoolAccount = match accounts.get(r.account_id.to_be_bytes())? {
                            Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                            None => return Err(abort(PoolError::AccountNotFound(r.account_id))),
                        };
                        if stored.get(r.id.as_bytes())?.is_some() {
                            return Err(abort(PoolError::invariant(format!(
                                "reservation {} already exists",
                                r.id
                            ))));
                        }

                        // 同一事务内的读可见本事务之前的写
                        let hold_key = Self::hold_key(r.account_id, r.kind);
                        let mut held = match holds.get(&hold_key)? {
                            Some(bytes) => HeldCapacity::from_bytes(&bytes).unwrap_or_default(),
                            None => HeldCapacity::default(),
                        };
                        let total = held.amount.saturating_add(r.amount);
                        if total > r.observed_capacity {
                            return Err(abort(PoolError::CapacityExceeded {
                                account_id: r.account_id,
                                held: held.amount,
                                requested: r.amount,
                                observed: r.observed_capacity,
                            }));
                        }
                        held.amount = total;
                        held.open += 1;

                        // 计数器对所有账户维护，之后设置的上限也能看到已有用量
                        for window in CapWindow::ALL {
                            let key = Self::usage_key(r.account_id, r.kind, window, r.created_at);
                            let committed = Self::read_u64(usage.get(&key)?);
                            if let Some(cap) = window.cap(&account) {
                                if committed.saturating_add(r.amount) > cap {
                                    return Err(abort(PoolError::CapExceeded {
                                        account_id: r.account_id,
                                        window: window.to_string(),
                                        cap,
                                        committed,
                                        requested: r.amount,
                                    }));
                                }
                            }
                            usage.insert(key, &(committed + r.amount).to_be_bytes()[..])?;
                        }

                        holds.insert(hold_key, &held.to_bytes()[..])?;
                        stored.insert(&r.id.as_bytes()[..], value.clone())?;
                        open.insert(&r.id.as_bytes()[..], &[][..])?;
                        refs.insert(Self::ref_key(&r.external_ref, &r.id), &[][..])?;
                    }
                    Ok(())
                }),
        )
    }

    async fn get_reservation(&self, id: &ReservationId) -> PoolResult<Option<Reservation>> {
        match self.reservations.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_reservations_by_ref(&self, external_ref: &str) -> PoolResult<Vec<Reservation>> {
        let prefix = Self::ref_prefix(external_ref);
        let mut result = Vec::new();
        for item in self.reservation_refs.scan_prefix(&prefix) {
            let (key, _) = item?;
            let id = Self::parse_uuid(&key[prefix.len()..])?;
            if let Some(reservation) = self.get_reservation(&id).await? {
                result.push(reservation);
            }
        }
        result.sort_by_key(|r: &Reservation| r.created_at);
        Ok(result)
    }

    async fn list_open_reservations(&self) -> PoolResult<Vec<Reservation>> {
        let mut result = Vec::new();
        for item in self.open_reservations.iter() {
            let (key, _) = item?;
            let id = Self::parse_uuid(&key)?;
            if let Some(reservation) = self.get_reservation(&id).await? {
                result.push(reservation);
            }
        }
        result.sort_by_key(|r: &Reservation| r.created_at);
        Ok(result)
    }

    async fn held_amounts(&self) -> PoolResult<HashMap<(AccountId, ResourceKind), HeldCapacity>> {
        let mut result = HashMap::new();
        for item in self.holds.iter() {
            let (key, value) = item?;
            let parsed = Self::parse_hold_key(&key).zip(HeldCapacity::from_bytes(&value));
            match parsed {
                Some((account_kind, held)) => {
                    result.insert(account_kind, held);
                }
                None => {
                    return Err(PoolError::Storage("corrupt holds entry".to_string()));
                }
            }
        }
        Ok(result)
    }

    async fn set_reservation_tx(&self, id: &ReservationId, tx_id: &str) -> PoolResult<()> {
        finish(self.reservations.transaction(|stored| {
            let mut reservation: Reservation = match stored.get(id.as_bytes())? {
                Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                None => return Err(abort(PoolError::ReservationNotFound(id.to_string()))),
            };
            if !reservation.is_open() {
                return Err(abort(PoolError::StateTransition(format!(
                    "reservation {} is {}",
                    id, reservation.state
                ))));
            }
            reservation.tx_id = Some(tx_id.to_string());
            reservation.updated_at = Utc::now();
            stored.insert(&id.as_bytes()[..], Self::serialize(&reservation).map_err(abort)?)?;
            Ok(())
        }))
    }

    async fn transition_reservations(
        &self,
        ids: &[ReservationId],
        target: ReservationState,
        reason: Option<&str>,
    ) -> PoolResult<Vec<Reservation>> {
        let mut seen = HashSet::new();
        let ids: Vec<ReservationId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let now = Utc::now();

        finish(
            (&self.reservations, &self.holds, &self.open_reservations, &self.cap_usage).transaction(
                |(stored, holds, open, usage)| {
                    let mut moved = Vec::with_capacity(ids.len());
                    for id in &ids {
                        let mut reservation: Reservation = match stored.get(id.as_bytes())? {
                            Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                            None => {
                                return Err(abort(PoolError::ReservationNotFound(id.to_string())))
                            }
                        };
                        if reservation.state == target {
                            continue;
                        }
                        if !reservation.state.can_transition_to(target) {
                            return Err(abort(PoolError::StateTransition(format!(
                                "reservation {} cannot move from {} to {}",
                                id, reservation.state, target
                            ))));
                        }

                        let hold_key = Self::hold_key(reservation.account_id, reservation.kind);
                        let mut held = match holds.get(&hold_key)? {
                            Some(bytes) => HeldCapacity::from_bytes(&bytes).unwrap_or_default(),
                            None => HeldCapacity::default(),
                        };
                        if held.amount < reservation.amount || held.open == 0 {
                            return Err(abort(PoolError::invariant(format!(
                                "held capacity of account {} ({}) below reservation {} amount {}",
                                reservation.account_id, held.amount, id, reservation.amount
                            ))));
                        }
                        held.amount -= reservation.amount;
                        held.open -= 1;
                        holds.insert(hold_key, &held.to_bytes()[..])?;

                        if target == ReservationState::Released {
                            for window in CapWindow::ALL {
                                let key = Self::usage_key(
                                    reservation.account_id,
                                    reservation.kind,
                                    window,
                                    reservation.created_at,
                                );
                                let committed = Self::read_u64(usage.get(&key)?);
                                usage.insert(
                                    key,
                                    &committed.saturating_sub(reservation.amount).to_be_bytes()[..],
                                )?;
                            }
                        }

                        reservation.state = target;
                        reservation.release_reason = reason.map(str::to_string);
                        reservation.updated_at = now;
                        stored.insert(
                            &id.as_bytes()[..],
                            Self::serialize(&reservation).map_err(abort)?,
                        )?;
                        open.remove(&id.as_bytes()[..])?;
                        moved.push(reservation);
                    }
                    Ok(moved)
                },
            ),
        )
    }

    async fn committed_since(
        &self,
        account_id: AccountId,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> PoolResult<u64> {
        let all: Vec<Reservation> = Self::scan_values(&self.reservations)?;
        Ok(all
            .iter()
            .filter(|r| {
                r.account_id == account_id
                    && r.kind == kind
                    && r.created_at >= since
                    && r.state != ReservationState::Released
            })
            .map(|r| r.amount)
            .sum())
    }

    // ==================== 订单操作 ====================

    async fn insert_order(&self, order: &Order) -> PoolResult<()> {
        let value = Self::serialize(order)?;
        finish((&self.orders, &self.order_refs).transaction(|(orders, refs)| {
            if let Some(existing_id) = refs.get(order.external_ref.as_bytes())? {
                let existing: Option<Order> = match orders.get(&existing_id)? {
                    Some(bytes) => Some(Self::deserialize(&bytes).map_err(abort)?),
                    None => None,
                };
                return Err(abort(PoolError::DuplicateOrder {
                    external_ref: order.external_ref.clone(),
                    order_id: existing
                        .as_ref()
                        .map(|o| o.id.to_string())
                        .unwrap_or_default(),
                    status: existing
                        .map(|o| o.status.to_string())
                        .unwrap_or_default(),
                }));
            }
            refs.insert(order.external_ref.as_bytes(), &order.id.as_bytes()[..])?;
            orders.insert(&order.id.as_bytes()[..], value.clone())?;
            Ok(())
        }))
    }

    async fn get_order(&self, id: &OrderId) -> PoolResult<Option<Order>> {
        match self.orders.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_order_by_ref(&self, external_ref: &str) -> PoolResult<Option<Order>> {
        match self.order_refs.get(external_ref.as_bytes())? {
            Some(id) => self.get_order(&Self::parse_uuid(&id)?).await,
            None => Ok(None),
        }
    }

    async fn update_order(&self, order: &Order) -> PoolResult<Order> {
        let mut updated = order.clone();
        updated.version += 1;
        let value = Self::serialize(&updated)?;

        finish(self.orders.transaction(|orders| {
            let stored: Order = match orders.get(order.id.as_bytes())? {
                Some(bytes) => Self::deserialize(&bytes).map_err(abort)?,
                None => return Err(abort(PoolError::OrderNotFound(order.id.to_string()))),
            };
            if stored.version != order.version {
                return Err(abort(PoolError::ConcurrentModification(format!(
                    "order {} version {} (stored {})",
                    order.id, order.version, stored.version
                ))));
            }
            orders.insert(&order.id.as_bytes()[..], value.clone())?;
            Ok(())
        }))?;

        Ok(updated)
    }

    async fn list_orders_by_status(&self, status: OrderStatus) -> PoolResult<Vec<Order>> {
        let mut result: Vec<Order> = Self::scan_values::<Order>(&self.orders)?
            .into_iter()
            .filter(|o| o.status == status)
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }

    // ==================== 统计 ====================

    async fn get_stats(&self) -> PoolResult<StorageStats> {
        let accounts: Vec<PoolAccount> = Self::scan_values(&self.accounts)?;
        let orders: Vec<Order> = Self::scan_values(&self.orders)?;

        Ok(StorageStats {
            total_accounts: accounts.len() as u64,
            active_accounts: accounts
                .iter()
                .filter(|a| a.status == AccountStatus::Active)
                .count() as u64,
            total_reservations: self.reservations.len() as u64,
            open_reservations: self.open_reservations.len() as u64,
            total_orders: orders.len() as u64,
            pending_orders: orders.iter().filter(|o| !o.status.is_terminal()).count() as u64,
        })
    }
}
