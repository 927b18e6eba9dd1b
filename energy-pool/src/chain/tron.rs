//! TRON Full-Node HTTP Client
//!
//! Speaks the `/wallet/*` HTTP API with base58 (`visible: true`) addresses.
//! Responses are decoded into fixed structs; error payloads and malformed
//! bodies are rejected here instead of leaking loosely-typed JSON into the
//! engine.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ChainClient, DelegationRequest, SubmitOutcome, TxReceipt};
use crate::config::ChainConfig;
use crate::error::{PoolError, PoolResult};
use crate::keys::ScopedSigner;
use crate::types::{AccountResources, ChainResourceUsage, ResourceKind};

/// Broadcast codes that mean "try again", not "refused"
const TRANSIENT_BROADCAST_CODES: &[&str] =
    &["SERVER_BUSY", "NOT_ENOUGH_EFFECTIVE_CONNECTION", "NO_CONNECTION"];

/// TRON HTTP client
pub struct TronHttpClient {
    client: Client,
    config: ChainConfig,
    /// (intent_id, endpoint) -> receipt already broadcast by this process
    intents: Mutex<HashMap<(Uuid, &'static str), TxReceipt>>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountResourceResponse {
    #[serde(rename = "NetUsed", default)]
    net_used: i64,
    #[serde(rename = "NetLimit", default)]
    net_limit: i64,
    #[serde(rename = "EnergyUsed", default)]
    energy_used: i64,
    #[serde(rename = "EnergyLimit", default)]
    energy_limit: i64,
    #[serde(rename = "Error")]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FrozenV2 {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    amount: i64,
}

#[derive(Debug, Default, Deserialize)]
#[allow(non_snake_case)]
struct AccountResourceField {
    #[serde(default)]
    delegated_frozenV2_balance_for_energy: i64,
    #[serde(default)]
    acquired_delegated_frozenV2_balance_for_energy: i64,
}

#[derive(Debug, Default, Deserialize)]
#[allow(non_snake_case)]
struct AccountResponse {
    address: Option<String>,
    #[serde(default)]
    frozenV2: Vec<FrozenV2>,
    #[serde(default)]
    delegated_frozenV2_balance_for_bandwidth: i64,
    #[serde(default)]
    acquired_delegated_frozenV2_balance_for_bandwidth: i64,
    #[serde(default)]
    account_resource: AccountResourceField,
    #[serde(rename = "Error")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MaxSizeResponse {
    #[serde(default)]
    max_size: i64,
    #[serde(rename = "Error")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    result: bool,
    txid: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

impl TronHttpClient {
    /// Create a new client
    pub fn new(config: ChainConfig) -> PoolResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PoolError::ChainConnection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            intents: Mutex::new(HashMap::new()),
        })
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> PoolResult<T> {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("TRON-PRO-API-KEY", key);
        }

        debug!("TRON HTTP call: {}", path);

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PoolError::ChainResponse(format!(
                "{}: HTTP {} - {}",
                path, status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| PoolError::ChainResponse(format!("malformed {} response: {}", path, e)))
    }

    async fn build_and_broadcast(
        &self,
        path: &'static str,
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

        if let Some(receipt) = self.intents.lock().await.get(&(request.intent_id, path)) {
            info!(intent_id = %request.intent_id, tx_id = %receipt.tx_id, "Intent already submitted");
            return Ok(SubmitOutcome::Accepted(receipt.clone()));
        }

        let mut body = json!({
            "owner_address": request.from,
            "receiver_address": request.to,
            "balance": request.amount_sun,
            "resource": request.kind.as_str(),
            "visible": true,
        });
        if request.lock {
            body["lock"] = json!(true);
            if let Some(period) = request.lock_period {
                body["lock_period"] = json!(period);
            }
        }

        let mut transaction: serde_json::Value = self.post(path, body).await?;
        if let Some(error) = transaction.get("Error").and_then(|v| v.as_str()) {
            return Ok(SubmitOutcome::Rejected {
                reason: clean_node_error(error),
            });
        }

        let tx_id = transaction
            .get("txID")
            .and_then(|v| v.as_str())
            .ok_or_else(|| PoolError::ChainResponse(format!("{}: missing txID", path)))?
            .to_string();
        let txid_bytes = hex::decode(&tx_id)?;
        let signature = signer.sign_txid(&txid_bytes)?;
        transaction["signature"] = json!([hex::encode(signature)]);

        let response: BroadcastResponse = self
            .post("/wallet/broadcasttransaction", transaction)
            .await?;
        let outcome = classify_broadcast(&tx_id, response)?;

        if let SubmitOutcome::Accepted(receipt) = &outcome {
            self.intents
                .lock()
                .await
                .insert((request.intent_id, path), receipt.clone());
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ChainClient for TronHttpClient {
    async fn resource_usage(&self, address: &str) -> PoolResult<AccountResources> {
        let resources: AccountResourceResponse = self
            .post(
                "/wallet/getaccountresource",
                json!({ "address": address, "visible": true }),
            )
            .await?;
        let account: AccountResponse = self
            .post(
                "/wallet/getaccount",
                json!({ "address": address, "visible": true }),
            )
            .await?;

        parse_resources(address, resources, account)
    }

    async fn delegatable(&self, address: &str, kind: ResourceKind) -> PoolResult<u64> {
        let response: MaxSizeResponse = self
            .post(
                "/wallet/getcandelegatedmaxsize",
                json!({ "owner_address": address, "type": kind.tag(), "visible": true }),
            )
            .await?;
        if let Some(error) = response.error {
            return Err(PoolError::ChainResponse(clean_node_error(&error)));
        }
        if response.max_size < 0 {
            warn!(address, max_size = response.max_size, "Negative delegatable size clamped to zero");
        }
        Ok(response.max_size.max(0) as u64)
    }

    async fn submit_delegation(
        &self,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome> {
        self.build_and_broadcast("/wallet/delegateresource", signer, request)
            .await
    }

    async fn submit_undelegation(
        &self,
        signer: &ScopedSigner,
        request: &DelegationRequest,
    ) -> PoolResult<SubmitOutcome> {
        self.build_and_broadcast("/wallet/undelegateresource", signer, request)
            .await
    }
}

fn parse_resources(
    address: &str,
    resources: AccountResourceResponse,
    account: AccountResponse,
) -> PoolResult<AccountResources> {
    if let Some(error) = resources.error.or(account.error) {
        return Err(PoolError::ChainResponse(clean_node_error(&error)));
    }
    if account.address.is_none() {
        return Err(PoolError::ChainAccountNotFound(address.to_string()));
    }

    let mut staked_energy = 0i64;
    let mut staked_bandwidth = 0i64;
    for frozen in &account.frozenV2 {
        match frozen.kind.as_deref() {
            None | Some("BANDWIDTH") => staked_bandwidth += frozen.amount,
            Some("ENERGY") => staked_energy += frozen.amount,
            _ => {}
        }
    }

    Ok(AccountResources {
        address: address.to_string(),
        energy: ChainResourceUsage {
            limit: resources.energy_limit,
            used: resources.energy_used,
            staked: staked_energy,
            delegated_out: account
                .account_resource
                .delegated_frozenV2_balance_for_energy,
            delegated_in: account
                .account_resource
                .acquired_delegated_frozenV2_balance_for_energy,
        },
        bandwidth: ChainResourceUsage {
            limit: resources.net_limit,
            used: resources.net_used,
            staked: staked_bandwidth,
            delegated_out: account.delegated_frozenV2_balance_for_bandwidth,
            delegated_in: account.acquired_delegated_frozenV2_balance_for_bandwidth,
        },
    })
}

fn classify_broadcast(tx_id: &str, response: BroadcastResponse) -> PoolResult<SubmitOutcome> {
    if response.result {
        let tx_id = response.txid.unwrap_or_else(|| tx_id.to_string());
        info!(tx_id = %tx_id, "Broadcast transaction");
        return Ok(SubmitOutcome::Accepted(TxReceipt { tx_id }));
    }

    let code = response.code.unwrap_or_else(|| "UNKNOWN".to_string());
    let message = response
        .message
        .map(|m| decode_message(&m))
        .unwrap_or_default();

    if code == "DUP_TRANSACTION_ERROR" {
        return Ok(SubmitOutcome::Accepted(TxReceipt {
            tx_id: tx_id.to_string(),
        }));
    }
    if TRANSIENT_BROADCAST_CODES.contains(&code.as_str()) {
        return Err(PoolError::ChainResponse(format!("{}: {}", code, message)));
    }
    Ok(SubmitOutcome::Rejected {
        reason: format!("{}: {}", code, message),
    })
}

/// Broadcast messages are hex-encoded ASCII
fn decode_message(message: &str) -> String {
    hex::decode(message)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| message.to_string())
}

/// Strip the Java exception class prefix from node errors
fn clean_node_error(error: &str) -> String {
    match error.split_once(" : ") {
        Some((prefix, rest)) if prefix.starts_with("class ") => rest.trim().to_string(),
        _ => error.trim().to_string(),
    }
}
