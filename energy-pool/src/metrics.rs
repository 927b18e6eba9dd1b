//! Energy Pool Metrics
//!
//! In-process counters for orders, reservations and delegation legs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use energy_pool::metrics::PoolMetrics;
//!
//! let metrics = PoolMetrics::new();
//! metrics.order_received();
//! metrics.reservations_created(2);
//!
//! let snapshot = metrics.snapshot();
//! println!("Open holds: {}", snapshot.open_reservations());
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::OrderStatus;

/// Counter metrics (monotonically increasing)
#[derive(Default)]
struct Counters {
    orders_received: AtomicU64,
    orders_resumed: AtomicU64,
    orders_duplicate: AtomicU64,
    orders_completed: AtomicU64,
    orders_failed: AtomicU64,
    orders_cancelled: AtomicU64,

    reservations_created: AtomicU64,
    reservations_confirmed: AtomicU64,
    reservations_released: AtomicU64,
    reservations_expired: AtomicU64,

    legs_submitted: AtomicU64,
    legs_delegated: AtomicU64,
    legs_rejected: AtomicU64,
    undelegations: AtomicU64,

    allocation_deficits: AtomicU64,
    commit_conflicts: AtomicU64,
    snapshot_failures: AtomicU64,
    accounts_demoted: AtomicU64,
}

/// Energy pool metrics collector
#[derive(Default)]
pub struct PoolMetrics {
    counters: Counters,
}

fn inc(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Orders ====================

    pub fn order_received(&self) {
        inc(&self.counters.orders_received, 1);
    }

    pub fn order_resumed(&self) {
        inc(&self.counters.orders_resumed, 1);
    }

    pub fn order_duplicate(&self) {
        inc(&self.counters.orders_duplicate, 1);
    }

    /// Record an order reaching a terminal state
    pub fn order_finished(&self, status: OrderStatus) {
        match status {
            OrderStatus::Completed => inc(&self.counters.orders_completed, 1),
            OrderStatus::Failed => inc(&self.counters.orders_failed, 1),
            OrderStatus::Cancelled => inc(&self.counters.orders_cancelled, 1),
            _ => {}
        }
    }

    // ==================== Reservations ====================

    pub fn reservations_created(&self, count: u64) {
        inc(&self.counters.reservations_created, count);
    }

    pub fn reservations_confirmed(&self, count: u64) {
        inc(&self.counters.reservations_confirmed, count);
    }

    pub fn reservations_released(&self, count: u64) {
        inc(&self.counters.reservations_released, count);
    }

    pub fn reservations_expired(&self, count: u64) {
        inc(&self.counters.reservations_expired, count);
    }

    // ==================== Delegation ====================

    pub fn leg_submitted(&self) {
        inc(&self.counters.legs_submitted, 1);
    }

    pub fn leg_delegated(&self) {
        inc(&self.counters.legs_delegated, 1);
    }

    pub fn leg_rejected(&self) {
        inc(&self.counters.legs_rejected, 1);
    }

    pub fn undelegated(&self) {
        inc(&self.counters.undelegations, 1);
    }

    // ==================== Allocation ====================

    pub fn allocation_deficit(&self) {
        inc(&self.counters.allocation_deficits, 1);
    }

    pub fn commit_conflict(&self) {
        inc(&self.counters.commit_conflicts, 1);
    }

    pub fn snapshot_failure(&self) {
        inc(&self.counters.snapshot_failures, 1);
    }

    pub fn account_demoted(&self) {
        inc(&self.counters.accounts_demoted, 1);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        MetricsSnapshot {
            orders_received: load(&c.orders_received),
            orders_resumed: load(&c.orders_resumed),
            orders_duplicate: load(&c.orders_duplicate),
            orders_completed: load(&c.orders_completed),
            orders_failed: load(&c.orders_failed),
            orders_cancelled: load(&c.orders_cancelled),
            reservations_created: load(&c.reservations_created),
            reservations_confirmed: load(&c.reservations_confirmed),
            reservations_released: load(&c.reservations_released),
            reservations_expired: load(&c.reservations_expired),
            legs_submitted: load(&c.legs_submitted),
            legs_delegated: load(&c.legs_delegated),
            legs_rejected: load(&c.legs_rejected),
            undelegations: load(&c.undelegations),
            allocation_deficits: load(&c.allocation_deficits),
            commit_conflicts: load(&c.commit_conflicts),
            snapshot_failures: load(&c.snapshot_failures),
            accounts_demoted: load(&c.accounts_demoted),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub orders_received: u64,
    pub orders_resumed: u64,
    pub orders_duplicate: u64,
    pub orders_completed: u64,
    pub orders_failed: u64,
    pub orders_cancelled: u64,
    pub reservations_created: u64,
    pub reservations_confirmed: u64,
    pub reservations_released: u64,
    pub reservations_expired: u64,
    pub legs_submitted: u64,
    pub legs_delegated: u64,
    pub legs_rejected: u64,
    pub undelegations: u64,
    pub allocation_deficits: u64,
    pub commit_conflicts: u64,
    pub snapshot_failures: u64,
    pub accounts_demoted: u64,
}

impl MetricsSnapshot {
    /// Reservations still holding capacity
    pub fn open_reservations(&self) -> u64 {
        self.reservations_created.saturating_sub(
            self.reservations_confirmed + self.reservations_released + self.reservations_expired,
        )
    }

    /// Share of finished orders that completed
    pub fn success_rate(&self) -> f64 {
        let finished = self.orders_completed + self.orders_failed + self.orders_cancelled;
        if finished == 0 {
            return 0.0;
        }
        self.orders_completed as f64 / finished as f64
    }
}
