//! Energy Pool - TRON Resource Allocation and Delegation
//!
//! This crate manages a pool of staked TRON accounts and rents their energy
//! and bandwidth out to paying customers. A confirmed TRX payment becomes an
//! order; the order is priced, planned across pool accounts, held in a
//! reservation ledger and finally delegated on-chain to the payer.
//!
//! # Architecture
//!
//! - **Chain Client**: reads account resources and submits (un)delegations
//! - **Resource Accountant**: converts chain figures into claimable capacity
//! - **Reservation Ledger**: holds capacity between planning and delegation
//! - **Allocation Engine**: greedy multi-account planning with atomic commit
//! - **Delegation Executor**: signs and submits each planned leg
//! - **Order Coordinator**: drives an order from payment to completion and
//!   compensates on failure
//! - **Service**: wires the components and runs the background workers
//!
//! # Order Lifecycle
//!
//! ```text
//! received -> validated -> calculated -> allocated -> delegated -> completed
//!     \___________\____________\____________\___________\-> failed | cancelled
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use energy_pool::{EnergyPoolService, MemoryStorage, InMemoryChain, PaymentEvent, PoolConfig};
//!
//! async fn example() {
//!     let service = EnergyPoolService::builder()
//!         .config(PoolConfig::development())
//!         .storage(Arc::new(MemoryStorage::new()))
//!         .chain(Arc::new(InMemoryChain::new()))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let payment = PaymentEvent::new(
//!         "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf",
//!         3_000_000,
//!         "payment-tx-hash",
//!         "nile",
//!     );
//!     let order = service.create_order_from_payment(payment).await.unwrap();
//!     println!("order {} is {}", order.id, order.status);
//! }
//! ```

pub mod accountant;
pub mod allocation;
pub mod chain;
pub mod config;
pub mod error;
pub mod executor;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod order;
pub mod pool;
pub mod retry;
pub mod service;
pub mod storage;
pub mod types;

pub use accountant::{ResourceAccountant, ResourceConverter};
pub use allocation::{
    AllocationEngine, AllocationOutcome, AllocationPlan, AllocationRequest, DeficitReport,
    PlanLeg, SkippedAccount,
};
pub use chain::{
    ChainClient, DelegationRequest, InMemoryChain, SubmitOutcome, TronHttpClient, TxReceipt,
};
pub use config::{
    AllocationConfig, ChainConfig, KeyVaultConfig, PoolConfig, PricingConfig, ReservationConfig,
    ResourceRatio, RetryConfig, TronNetwork,
};
pub use error::{ErrorClass, PoolError, PoolResult};
pub use executor::{DelegationExecutor, LegOutcome, TxResult};
pub use keys::{KeyVault, ScopedSigner};
pub use ledger::{ReservationLedger, SweepReport};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use order::OrderLifecycleCoordinator;
pub use pool::{AccountPoolManager, PoolStatistics};
pub use retry::RetryStrategy;
pub use service::{EnergyPoolService, EnergyPoolServiceBuilder, RunnerHandle, ServiceStatus};
pub use storage::{MemoryStorage, PoolStorage, SledStorage, StorageConfig, StorageStats};
pub use types::*;
