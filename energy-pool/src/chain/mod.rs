//! Chain Client
//!
//! The engine's only view of the ledger. Implementations:
//!
//! - [`TronHttpClient`]: TRON full-node HTTP API
//! - [`InMemoryChain`]: deterministic in-process chain for tests and development
//!
//! Submissions carry an application-generated `intent_id` (the reservation
//! id). Callers may deliver the same intent more than once; an implementation
//! must return the original receipt instead of delegating twice.

pub mod memory;
pub mod tron;

pub use memory::InMemoryChain;
pub use tron::TronHttpClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PoolResult;
use crate::keys::ScopedSigner;
use crate::types::{AccountResources, ResourceKind};

/// Delegation / undelegation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRequest {
    /// Idempotency key for at-least-once submission
    pub intent_id: Uuid,
    /// Pool account address (owner of the staked balance)
    pub from: String,
    /// Receiver address
    pub to: String,
    /// Staked balance to delegate, in SUN
    pub amount_sun: u64,
    pub kind: ResourceKind,
    pub lock: bool,
    pub lock_period: Option<u64>,
}

/// Accepted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_id: String,
}

/// Result of a submission the chain actually evaluated
///
/// Transport failures are `Err`; a chain-level refusal is a normal outcome
/// and is never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Accepted(TxReceipt),
    Rejected { reason: String },
}

impl SubmitOutcome {
    pub fn tx_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Accepted(receipt) => Some(&receipt.tx_id),
            SubmitOutcome::Rejected { .. } => None,
        }
    }
}

/// Ledger capability consumed by the engine
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Raw resource counters for both resource kinds
    async fn resource_usage(&self, address: &str) -> PoolResult<AccountResources>;

    /// Staked balance that can be delegated right now, in SUN
    async fn delegatable(&self, address: &str, kind: ResourceKind) -> PoolResult<u64>;

    /// Submit a delegation signed by `signer`
    async fn submit_delegation(
        &self,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome>;

    /// Submit an undelegation signed by `signer`
    async fn submit_undelegation(
        &self,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome>;
}
