//! 内存存储实现
//!
//! 提供基于内存的存储实现，主要用于测试和开发。
//!
//! 所有表放在同一把 `RwLock` 之下，多行变更在一次写锁内完成，
//! 语义与 sled 事务一致。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use super::{CapWindow, HeldCapacity, PoolStorage, StorageStats};
use crate::error::{PoolError, PoolResult};
use crate::types::{
    AccountId, AccountStatus, Order, OrderId, OrderStatus, PoolAccount, Reservation,
    ReservationId, ReservationState, ResourceKind,
};

#[derive(Debug, Default)]
struct State {
    next_account_id: u64,
    accounts: BTreeMap<AccountId, PoolAccount>,
    // 索引
    addresses: HashMap<String, AccountId>,
    reservations: HashMap<ReservationId, Reservation>,
    held: HashMap<(AccountId, ResourceKind), HeldCapacity>,
    open: HashSet<ReservationId>,
    orders: HashMap<OrderId, Order>,
    order_refs: HashMap<String, OrderId>,
}

impl State {
    /// 窗口内未释放预留的总量
    fn committed_in(
        &self,
        account_id: AccountId,
        kind: ResourceKind,
        window: CapWindow,
        period: &str,
    ) -> u64 {
        self.reservations
            .values()
            .filter(|r| {
                r.account_id == account_id
                    && r.kind == kind
                    && r.state != ReservationState::Released
                    && window.period(r.created_at) == period
            })
            .map(|r| r.amount)
            .sum()
    }
}

/// 内存存储
///
/// 线程安全的内存存储实现，使用单个 RwLock 保护全部数据。
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 清空所有数据
    pub async fn clear(&self) {
        *self.state.write().await = State::default();
    }
}

#[async_trait]
impl PoolStorage for MemoryStorage {
    // ==================== 账户操作 ====================

    async fn insert_account(&self, mut account: PoolAccount) -> PoolResult<PoolAccount> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.addresses.get(&account.address) {
            return Err(PoolError::DuplicateAddress {
                address: account.address.clone(),
                existing: *existing,
            });
        }

        state.next_account_id += 1;
        account.id = AccountId(state.next_account_id);
        state.addresses.insert(account.address.clone(), account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> PoolResult<Option<PoolAccount>> {
        Ok(self.state.read().await.accounts.get(&id).cloned())
    }

    async fn get_account_by_address(&self, address: &str) -> PoolResult<Option<PoolAccount>> {
        let state = self.state.read().await;
        Ok(state
            .addresses
            .get(address)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn list_accounts(&self) -> PoolResult<Vec<PoolAccount>> {
        Ok(self.state.read().await.accounts.values().cloned().collect())
    }

    async fn update_account(&self, account: &PoolAccount) -> PoolResult<()> {
        let mut state = self.state.write().await;
        let stored = state
            .accounts
            .get_mut(&account.id)
            .ok_or(PoolError::AccountNotFound(account.id))?;
        if stored.address != account.address {
            return Err(PoolError::InvalidInput(format!(
                "account {} address is immutable",
                account.id
            )));
        }
        *stored = account.clone();
        Ok(())
    }

    async fn batch_update_status(
        &self,
        ids: &[AccountId],
        status: AccountStatus,
    ) -> PoolResult<Vec<PoolAccount>> {
        let mut state = self.state.write().await;
        if let Some(missing) = ids.iter().find(|id| !state.accounts.contains_key(*id)) {
            return Err(PoolError::AccountNotFound(*missing));
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(account) = state.accounts.get_mut(id) {
                account.status = status;
                account.updated_at = now;
                updated.push(account.clone());
            }
        }
        Ok(updated)
    }

    async fn delete_account(&self, id: AccountId) -> PoolResult<()> {
        let mut state = self.state.write().await;
        if !state.accounts.contains_key(&id) {
            return Err(PoolError::AccountNotFound(id));
        }
        let open: u64 = ResourceKind::ALL
            .iter()
            .filter_map(|kind| state.held.get(&(id, *kind)))
            .map(|h| h.open)
            .sum();
        if open > 0 {
            return Err(PoolError::AccountInUse {
                account_id: id,
                open: open as usize,
            });
        }

        if let Some(account) = state.accounts.remove(&id) {
            state.addresses.remove(&account.address);
        }
        Ok(())
    }

    // ==================== 预留操作 ====================

    async fn reserve_batch(&self, reservations: &[Reservation]) -> PoolResult<()> {
        let mut state = self.state.write().await;

        // 先在副本上校验整批，再一次性写入
        let mut held = state.held.clone();
        let mut batch: HashMap<(AccountId, ResourceKind, CapWindow, String), u64> = HashMap::new();
        for r in reservations {
            let account = state
                .accounts
                .get(&r.account_id)
                .ok_or(PoolError::AccountNotFound(r.account_id))?;
            if state.reservations.contains_key(&r.id) {
                return Err(PoolError::invariant(format!(
                    "reservation {} already exists",
                    r.id
                )));
            }
            let entry = held.entry((r.account_id, r.kind)).or_default();
            let total = entry.amount.saturating_add(r.amount);
            if total > r.observed_capacity {
                return Err(PoolError::CapacityExceeded {
                    account_id: r.account_id,
                    held: entry.amount,
                    requested: r.amount,
                    observed: r.observed_capacity,
                });
            }
            entry.amount = total;
            entry.open += 1;

            for window in CapWindow::ALL {
                let Some(cap) = window.cap(account) else {
                    continue;
                };
                let period = window.period(r.created_at);
                let pending = batch
                    .entry((r.account_id, r.kind, window, period.clone()))
                    .or_default();
                let committed = state.committed_in(r.account_id, r.kind, window, &period) + *pending;
                if committed.saturating_add(r.amount) > cap {
                    return Err(PoolError::CapExceeded {
                        account_id: r.account_id,
                        window: window.to_string(),
                        cap,
                        committed,
                        requested: r.amount,
                    });
                }
                *pending += r.amount;
            }
        }

        state.held = held;
        for r in reservations {
            state.open.insert(r.id);
            state.reservations.insert(r.id, r.clone());
        }
        Ok(())
    }

    async fn get_reservation(&self, id: &ReservationId) -> PoolResult<Option<Reservation>> {
        Ok(self.state.read().await.reservations.get(id).cloned())
    }

    async fn list_reservations_by_ref(&self, external_ref: &str) -> PoolResult<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut result: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.external_ref == external_ref)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn list_open_reservations(&self) -> PoolResult<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut result: Vec<Reservation> = state
            .open
            .iter()
            .filter_map(|id| state.reservations.get(id))
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        Ok(result)
    }

    async fn held_amounts(&self) -> PoolResult<HashMap<(AccountId, ResourceKind), HeldCapacity>> {
        Ok(self.state.read().await.held.clone())
    }

    async fn set_reservation_tx(&self, id: &ReservationId, tx_id: &str) -> PoolResult<()> {
        let mut state = self.state.write().await;
        let reservation = state
            .reservations
            .get_mut(id)
            .ok_or_else(|| PoolError::ReservationNotFound(id.to_string()))?;
        if !reservation.is_open() {
            return Err(PoolError::StateTransition(format!(
                "reservation {} is {}",
                id, reservation.state
            )));
        }
        reservation.tx_id = Some(tx_id.to_string());
        reservation.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_reservations(
        &self,
        ids: &[ReservationId],
        target: ReservationState,
        reason: Option<&str>,
    ) -> PoolResult<Vec<Reservation>> {
        let mut state = self.state.write().await;

        let mut seen = HashSet::new();
        let mut to_move = Vec::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            let reservation = state
                .reservations
                .get(id)
                .ok_or_else(|| PoolError::ReservationNotFound(id.to_string()))?;
            if reservation.state == target {
                continue;
            }
            if !reservation.state.can_transition_to(target) {
                return Err(PoolError::StateTransition(format!(
                    "reservation {} cannot move from {} to {}",
                    id, reservation.state, target
                )));
            }
            to_move.push(*id);
        }

        let mut held = state.held.clone();
        for id in &to_move {
            if let Some(r) = state.reservations.get(id) {
                let entry = held.entry((r.account_id, r.kind)).or_default();
                if entry.amount < r.amount || entry.open == 0 {
                    return Err(PoolError::invariant(format!(
                        "held capacity of account {} ({}) below reservation {} amount {}",
                        r.account_id, entry.amount, id, r.amount
                    )));
                }
                entry.amount -= r.amount;
                entry.open -= 1;
            }
        }

        let now = Utc::now();
        let mut moved = Vec::with_capacity(to_move.len());
        state.held = held;
        for id in &to_move {
            state.open.remove(id);
            if let Some(r) = state.reservations.get_mut(id) {
                r.state = target;
                r.release_reason = reason.map(str::to_string);
                r.updated_at = now;
                moved.push(r.clone());
            }
        }
        Ok(moved)
    }

    async fn committed_since(
        &self,
        account_id: AccountId,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> PoolResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .reservations
            .values()
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
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .order_refs
            .get(&order.external_ref)
            .and_then(|id| state.orders.get(id))
        {
            return Err(PoolError::DuplicateOrder {
                external_ref: order.external_ref.clone(),
                order_id: existing.id.to_string(),
                status: existing.status.to_string(),
            });
        }
        state
            .order_refs
            .insert(order.external_ref.clone(), order.id);
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: &OrderId) -> PoolResult<Option<Order>> {
        Ok(self.state.read().await.orders.get(id).cloned())
    }

    async fn get_order_by_ref(&self, external_ref: &str) -> PoolResult<Option<Order>> {
        let state = self.state.read().await;
        Ok(state
            .order_refs
            .get(external_ref)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn update_order(&self, order: &Order) -> PoolResult<Order> {
        let mut state = self.state.write().await;
        let stored = state
            .orders
            .get_mut(&order.id)
            .ok_or_else(|| PoolError::OrderNotFound(order.id.to_string()))?;
        if stored.version != order.version {
            return Err(PoolError::ConcurrentModification(format!(
                "order {} version {} (stored {})",
                order.id, order.version, stored.version
            )));
        }
        let mut updated = order.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_orders_by_status(&self, status: OrderStatus) -> PoolResult<Vec<Order>> {
        let state = self.state.read().await;
        let mut result: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|o| o.created_at);
        Ok(result)
    }

    // ==================== 统计 ====================

    async fn get_stats(&self) -> PoolResult<StorageStats> {
        let state = self.state.read().await;
        Ok(StorageStats {
            total_accounts: state.accounts.len() as u64,
            active_accounts: state
                .accounts
                .values()
                .filter(|a| a.status == AccountStatus::Active)
                .count() as u64,
            total_reservations: state.reservations.len() as u64,
            open_reservations: state.open.len() as u64,
            total_orders: state.orders.len() as u64,
            pending_orders: state
                .orders
                .values()
                .filter(|o| !o.status.is_terminal())
                .count() as u64,
        })
    }
}
