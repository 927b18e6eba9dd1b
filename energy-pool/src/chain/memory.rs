//! In-Memory Chain
//!
//! Deterministic ledger for tests and development. Tracks staked,
//! delegated-out and delegated-in balances in SUN, honours intent-id
//! deduplication, and can be scripted to fail reads, fail submissions or
//! reject the next delegation from an address.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChainClient, DelegationRequest, SubmitOutcome, TxReceipt};
use crate::error::{PoolError, PoolResult};
use crate::keys::ScopedSigner;
use crate::types::{AccountResources, ChainResourceUsage, ResourceKind};

/// Operation a receipt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Delegate,
    Undelegate,
}

/// Delegation recorded on the in-memory ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRecord {
    pub intent_id: Uuid,
    pub from: String,
    pub to: String,
    pub kind: ResourceKind,
    pub amount_sun: u64,
    pub tx_id: String,
    pub undelegated: bool,
}

#[derive(Default)]
struct ChainState {
    accounts: HashMap<String, AccountResources>,
    delegatable_override: HashMap<(String, ResourceKind), i64>,
    receipts: HashMap<(Uuid, Op), TxReceipt>,
    delegations: Vec<DelegationRecord>,
    failing_reads: HashMap<String, u32>,
    failing_submissions: u32,
    rejections: HashMap<String, VecDeque<String>>,
    submissions: u64,
}

impl ChainState {
    fn take_read_failure(&mut self, address: &str) -> PoolResult<()> {
        if let Some(remaining) = self.failing_reads.get_mut(address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PoolError::ChainConnection(format!(
                    "scripted read failure for {}",
                    address
                )));
            }
        }
        Ok(())
    }

    fn take_submit_failure(&mut self) -> PoolResult<()> {
        if self.failing_submissions > 0 {
            self.failing_submissions -= 1;
            return Err(PoolError::Network("scripted submission failure".to_string()));
        }
        Ok(())
    }

    fn delegatable(&self, address: &str, kind: ResourceKind) -> PoolResult<i64> {
        if let Some(value) = self.delegatable_override.get(&(address.to_string(), kind)) {
            return Ok(*value);
        }
        let account = self
            .accounts
            .get(address)
            .ok_or_else(|| PoolError::ChainAccountNotFound(address.to_string()))?;
        let usage = account.get(kind);
        Ok(usage.staked - usage.delegated_out)
    }
}

/// In-process chain
#[derive(Default)]
pub struct InMemoryChain {
    state: RwLock<ChainState>,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stake `staked_sun` for `kind` on `address` (creates the account)
    pub async fn fund(&self, address: &str, kind: ResourceKind, staked_sun: u64) {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .entry(address.to_string())
            .or_insert_with(|| AccountResources {
                address: address.to_string(),
                ..Default::default()
            });
        account.get_mut(kind).staked = staked_sun as i64;
    }

    /// Overwrite the raw counters of one resource kind
    pub async fn set_usage(&self, address: &str, kind: ResourceKind, usage: ChainResourceUsage) {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .entry(address.to_string())
            .or_insert_with(|| AccountResources {
                address: address.to_string(),
                ..Default::default()
            });
        *account.get_mut(kind) = usage;
    }

    /// Pin the "can delegate now" figure, regardless of balances
    pub async fn set_delegatable(&self, address: &str, kind: ResourceKind, sun: i64) {
        self.state
            .write()
            .await
            .delegatable_override
            .insert((address.to_string(), kind), sun);
    }

    /// Remove a pinned delegatable figure
    pub async fn clear_delegatable(&self, address: &str, kind: ResourceKind) {
        self.state
            .write()
            .await
            .delegatable_override
            .remove(&(address.to_string(), kind));
    }

    /// Fail the next `times` reads for `address`
    pub async fn fail_reads(&self, address: &str, times: u32) {
        self.state
            .write()
            .await
            .failing_reads
            .insert(address.to_string(), times);
    }

    /// Fail the next `times` submissions with a network error
    pub async fn fail_submissions(&self, times: u32) {
        self.state.write().await.failing_submissions = times;
    }

    /// Reject the next delegation from `address` with `reason`
    pub async fn reject_next(&self, address: &str, reason: &str) {
        self.state
            .write()
            .await
            .rejections
            .entry(address.to_string())
            .or_default()
            .push_back(reason.to_string());
    }

    /// All delegations recorded so far
    pub async fn delegations(&self) -> Vec<DelegationRecord> {
        self.state.read().await.delegations.clone()
    }

    /// Active (not undelegated) SUN delegated to `to`
    pub async fn delegated_to(&self, to: &str, kind: ResourceKind) -> u64 {
        self.state
            .read()
            .await
            .delegations
            .iter()
            .filter(|d| d.to == to && d.kind == kind && !d.undelegated)
            .map(|d| d.amount_sun)
            .sum()
    }

    /// Submission calls that reached the ledger (including duplicates)
    pub async fn submission_count(&self) -> u64 {
        self.state.read().await.submissions
    }

    fn tx_id(intent_id: &Uuid, op: Op) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(intent_id.as_bytes());
        hasher.update(match op {
            Op::Delegate => b"delegate".as_slice(),
            Op::Undelegate => b"undelegate".as_slice(),
        });
        hasher.finalize().into()
    }

    async fn submit(
        &self,
        op: Op,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome> {
        if signer.address() != request.from {
            return Err(PoolError::invariant(format!(
                "signer for {} used to submit from {}",
                signer.address(),
                request.from
            )));
        }

        let mut state = self.state.write().await;
        state.submissions += 1;
        state.take_submit_failure()?;

        if let Some(receipt) = state.receipts.get(&(request.intent_id, op)) {
            return Ok(SubmitOutcome::Accepted(receipt.clone()));
        }

        if op == Op::Delegate {
            if let Some(reason) = state
                .rejections
                .get_mut(&request.from)
                .and_then(|queue| queue.pop_front())
            {
                return Ok(SubmitOutcome::Rejected { reason });
            }
        }

        let txid = Self::tx_id(&request.intent_id, op);
        signer.sign_txid(&txid)?;
        let receipt = TxReceipt {
            tx_id: hex::encode(txid),
        };
        let amount = request.amount_sun as i64;

        match op {
            Op::Delegate => {
                if state.delegatable(&request.from, request.kind)? < amount {
                    return Ok(SubmitOutcome::Rejected {
                        reason: "delegateBalance must be less than or equal to available FreezeV2 balance"
                            .to_string(),
                    });
                }
                if let Some(pinned) = state
                    .delegatable_override
                    .get_mut(&(request.from.clone(), request.kind))
                {
                    *pinned -= amount;
                }
                if let Some(account) = state.accounts.get_mut(&request.from) {
                    account.get_mut(request.kind).delegated_out += amount;
                }
                let receiver = state
                    .accounts
                    .entry(request.to.clone())
                    .or_insert_with(|| AccountResources {
                        address: request.to.clone(),
                        ..Default::default()
                    });
                receiver.get_mut(request.kind).delegated_in += amount;

                state.delegations.push(DelegationRecord {
                    intent_id: request.intent_id,
                    from: request.from.clone(),
                    to: request.to.clone(),
                    kind: request.kind,
                    amount_sun: request.amount_sun,
                    tx_id: receipt.tx_id.clone(),
                    undelegated: false,
                });
            }
            Op::Undelegate => {
                let record = state.delegations.iter_mut().find(|d| {
                    d.intent_id == request.intent_id && d.to == request.to && !d.undelegated
                });
                match record {
                    Some(record) => record.undelegated = true,
                    None => {
                        return Ok(SubmitOutcome::Rejected {
                            reason: "no delegated resource to reclaim".to_string(),
                        })
                    }
                }
                if let Some(pinned) = state
                    .delegatable_override
                    .get_mut(&(request.from.clone(), request.kind))
                {
                    *pinned += amount;
                }
                if let Some(account) = state.accounts.get_mut(&request.from) {
                    account.get_mut(request.kind).delegated_out -= amount;
                }
                if let Some(receiver) = state.accounts.get_mut(&request.to) {
                    receiver.get_mut(request.kind).delegated_in -= amount;
                }
            }
        }

        state
            .receipts
            .insert((request.intent_id, op), receipt.clone());
        Ok(SubmitOutcome::Accepted(receipt))
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn resource_usage(&self, address: &str) -> PoolResult<AccountResources> {
        let mut state = self.state.write().await;
        state.take_read_failure(address)?;
        state
            .accounts
            .get(address)
            .cloned()
            .ok_or_else(|| PoolError::ChainAccountNotFound(address.to_string()))
    }

    async fn delegatable(&self, address: &str, kind: ResourceKind) -> PoolResult<u64> {
        let mut state = self.state.write().await;
        state.take_read_failure(address)?;
        Ok(state.delegatable(address, kind)?.max(0) as u64)
    }

    async fn submit_delegation(
        &self,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome> {
        self.submit(Op::Delegate, signer, request).await
    }

    async fn submit_undelegation(
        &self,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome> {
        self.submit(Op::Undelegate, signer, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeyVaultConfig;
    use crate::keys::KeyVault;
    use crate::types::{AccountClass, AccountId, AccountStatus, PoolAccount};
    use chrono::Utc;
    use rust_decimal::Decimal;

    const POOL: &str = "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7";
    const USER: &str = "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf";

    fn signer() -> ScopedSigner {
        let vault = KeyVault::new(&KeyVaultConfig {
            master_key_hex: "33".repeat(32),
        })
        .unwrap();
        let key = vault.encrypt_key(&"07".repeat(32)).unwrap();
        let account = PoolAccount {
            id: AccountId(1),
            address: POOL.to_string(),
            name: "pool".to_string(),
            encrypted_key: key,
            status: AccountStatus::Active,
            priority: 1,
            cost_per_unit: Decimal::ZERO,
            class: AccountClass::Own,
            daily_cap: None,
            monthly_cap: None,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        vault.activate(&account).unwrap()
    }

    fn request(amount_sun: u64) -> DelegationRequest {
        DelegationRequest {
            intent_id: Uuid::new_v4(),
            from: POOL.to_string(),
            to: USER.to_string(),
            amount_sun,
            kind: ResourceKind::Energy,
            lock: false,
            lock_period: None,
        }
    }

    #[tokio::test]
    async fn test_delegation_moves_balance() {
        let chain = InMemoryChain::new();
        chain.fund(POOL, ResourceKind::Energy, 1_000).await;
        let signer = signer();

        let outcome = chain.submit_delegation(&signer, &request(400)).await.unwrap();
        assert!(outcome.tx_id().is_some());
        assert_eq!(chain.delegatable(POOL, ResourceKind::Energy).await.unwrap(), 600);
        assert_eq!(chain.delegated_to(USER, ResourceKind::Energy).await, 400);

        let usage = chain.resource_usage(USER).await.unwrap();
        assert_eq!(usage.energy.delegated_in, 400);
    }

    #[tokio::test]
    async fn test_duplicate_intent_delegates_once() {
        let chain = InMemoryChain::new();
        chain.fund(POOL, ResourceKind::Energy, 1_000).await;
        let signer = signer();
        let req = request(400);

        let first = chain.submit_delegation(&signer, &req).await.unwrap();
        let second = chain.submit_delegation(&signer, &req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(chain.delegations().await.len(), 1);
        assert_eq!(chain.submission_count().await, 2);
        assert_eq!(chain.delegatable(POOL, ResourceKind::Energy).await.unwrap(), 600);
    }

    #[tokio::test]
    async fn test_over_delegation_rejected() {
        let chain = InMemoryChain::new();
        chain.fund(POOL, ResourceKind::Energy, 100).await;
        let outcome = chain.submit_delegation(&signer(), &request(101)).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let chain = InMemoryChain::new();
        chain.fund(POOL, ResourceKind::Energy, 1_000).await;
        chain.fail_reads(POOL, 1).await;
        assert!(chain.resource_usage(POOL).await.is_err());
        assert!(chain.resource_usage(POOL).await.is_ok());

        chain.reject_next(POOL, "claimable balance insufficient").await;
        let outcome = chain.submit_delegation(&signer(), &request(10)).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected {
                reason: "claimable balance insufficient".to_string()
            }
        );

        chain.fail_submissions(1).await;
        assert!(chain.submit_delegation(&signer(), &request(10)).await.is_err());
        assert!(chain.submit_delegation(&signer(), &request(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_undelegation_restores_balance() {
        let chain = InMemoryChain::new();
        chain.fund(POOL, ResourceKind::Energy, 1_000).await;
        let signer = signer();
        let req = request(300);

        chain.submit_delegation(&signer, &req).await.unwrap();
        let outcome = chain.submit_undelegation(&signer, &req).await.unwrap();
        assert!(outcome.tx_id().is_some());
        assert_eq!(chain.delegatable(POOL, ResourceKind::Energy).await.unwrap(), 1_000);
        assert_eq!(chain.delegated_to(USER, ResourceKind::Energy).await, 0);

        let unknown = chain.submit_undelegation(&signer, &request(1)).await.unwrap();
        assert!(matches!(unknown, SubmitOutcome::Rejected { .. }));
    }
}
