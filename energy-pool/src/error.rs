//! Energy Pool Error Types
//!
//! Error definitions for allocation, reservation and delegation operations.
//!
//! Every variant belongs to exactly one [`ErrorClass`]; the class decides
//! whether a caller may retry and what the customer-facing reason reads.

use thiserror::Error;

use crate::types::{AccountId, ResourceKind};

/// Error taxonomy used for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed or ineligible input, never retried
    Validation,
    /// Pool cannot satisfy the request right now, retried after backoff
    Capacity,
    /// Chain or network failure, retried with bounded attempts
    ExternalService,
    /// Duplicate address / order, never retried
    Conflict,
    /// Broken integrity invariant, operation aborted
    InvariantViolation,
    /// Unexpected local failure (storage, serialization)
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Capacity => write!(f, "capacity"),
            Self::ExternalService => write!(f, "external_service"),
            Self::Conflict => write!(f, "conflict"),
            Self::InvariantViolation => write!(f, "invariant_violation"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Energy pool error
#[derive(Error, Debug)]
pub enum PoolError {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid chain address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Payment cannot be turned into an order
    #[error("Payment invalid: {0}")]
    InvalidPayment(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No active accounts in the pool
    #[error("No active accounts available")]
    NoActiveAccounts,

    /// Pool capacity cannot cover the request
    #[error("Insufficient {kind} capacity: requested {requested}, shortfall {shortfall}")]
    InsufficientCapacity {
        kind: ResourceKind,
        requested: u64,
        shortfall: u64,
    },

    /// Reservation would exceed what the account was last observed to hold
    #[error("Reservation on account {account_id} exceeds claimable capacity: held {held}, requested {requested}, observed {observed}")]
    CapacityExceeded {
        account_id: AccountId,
        held: u64,
        requested: u64,
        observed: u64,
    },

    /// Reservation would push the account past its daily or monthly cap
    #[error("Reservation on account {account_id} exceeds {window} cap {cap}: committed {committed}, requested {requested}")]
    CapExceeded {
        account_id: AccountId,
        window: String,
        cap: u64,
        committed: u64,
        requested: u64,
    },

    /// Snapshot for every candidate account failed
    #[error("Resource snapshot unavailable for account {0}")]
    SnapshotUnavailable(AccountId),

    /// Chain RPC connection error
    #[error("Chain RPC connection failed: {0}")]
    ChainConnection(String),

    /// Chain returned an error or a malformed payload
    #[error("Chain response error: {0}")]
    ChainResponse(String),

    /// Chain account does not exist
    #[error("Chain account not found: {0}")]
    ChainAccountNotFound(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Suspension point exceeded its deadline
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    /// Retry exhausted
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// Duplicate account address
    #[error("Account address already registered: {address} (account {existing})")]
    DuplicateAddress { address: String, existing: AccountId },

    /// Duplicate payment reference
    #[error("Duplicate payment reference {external_ref}: order {order_id} already {status}")]
    DuplicateOrder {
        external_ref: String,
        order_id: String,
        status: String,
    },

    /// Concurrent writer won the race on a versioned row
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Account still referenced by open reservations
    #[error("Account {account_id} has {open} open reservations")]
    AccountInUse { account_id: AccountId, open: usize },

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Reservation not found
    #[error("Reservation not found: {0}")]
    ReservationNotFound(String),

    /// Order not found
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// State transition error
    #[error("State transition error: {0}")]
    StateTransition(String),

    /// Signing key could not be decrypted or used
    #[error("Signing key error: {0}")]
    SigningKey(String),

    /// Integrity invariant broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Energy pool result type
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Class of this error in the retry/reporting taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            PoolError::InvalidInput(_)
            | PoolError::InvalidAddress(_)
            | PoolError::InvalidPayment(_)
            | PoolError::Configuration(_)
            | PoolError::AccountNotFound(_)
            | PoolError::ReservationNotFound(_)
            | PoolError::OrderNotFound(_)
            | PoolError::StateTransition(_) => ErrorClass::Validation,

            PoolError::NoActiveAccounts
            | PoolError::InsufficientCapacity { .. }
            | PoolError::CapacityExceeded { .. }
            | PoolError::CapExceeded { .. }
            | PoolError::SnapshotUnavailable(_) => ErrorClass::Capacity,

            PoolError::ChainConnection(_)
            | PoolError::ChainResponse(_)
            | PoolError::ChainAccountNotFound(_)
            | PoolError::Network(_)
            | PoolError::Timeout { .. }
            | PoolError::RetryExhausted { .. } => ErrorClass::ExternalService,

            PoolError::DuplicateAddress { .. }
            | PoolError::DuplicateOrder { .. }
            | PoolError::ConcurrentModification(_)
            | PoolError::AccountInUse { .. } => ErrorClass::Conflict,

            PoolError::InvariantViolation(_) => ErrorClass::InvariantViolation,

            PoolError::SigningKey(_) | PoolError::Storage(_) | PoolError::Serialization(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether a caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        match self {
            // exhaustion is final even though it wraps an external failure
            PoolError::RetryExhausted { .. } => false,
            _ => matches!(
                self.class(),
                ErrorClass::Capacity | ErrorClass::ExternalService
            ),
        }
    }

    /// Customer-facing reason persisted on failed orders
    pub fn user_reason(&self) -> String {
        match self.class() {
            ErrorClass::Capacity => "no capacity available right now".to_string(),
            ErrorClass::Validation => match self {
                PoolError::InvalidPayment(msg) => format!("payment invalid: {}", msg),
                other => format!("request invalid: {}", other),
            },
            ErrorClass::Conflict => format!("duplicate request: {}", self),
            ErrorClass::ExternalService => {
                "blockchain temporarily unavailable, please retry later".to_string()
            }
            ErrorClass::InvariantViolation | ErrorClass::Internal => {
                "internal error - contact support".to_string()
            }
        }
    }

    /// Build an invariant violation and raise the integrity alert
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(alert = "integrity", "Invariant violation: {}", message);
        PoolError::InvariantViolation(message)
    }
}

impl From<sled::Error> for PoolError {
    fn from(e: sled::Error) -> Self {
        PoolError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PoolError::Timeout {
                operation: "chain http request".to_string(),
                millis: 0,
            }
        } else if e.is_connect() {
            PoolError::ChainConnection(e.to_string())
        } else {
            PoolError::Network(e.to_string())
        }
    }
}

impl From<hex::FromHexError> for PoolError {
    fn from(e: hex::FromHexError) -> Self {
        PoolError::Serialization(format!("Hex decode error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            PoolError::InvalidPayment("zero amount".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            PoolError::InsufficientCapacity {
                kind: ResourceKind::Energy,
                requested: 10,
                shortfall: 1
            }
            .class(),
            ErrorClass::Capacity
        );
        assert_eq!(
            PoolError::Network("reset".into()).class(),
            ErrorClass::ExternalService
        );
        assert_eq!(
            PoolError::DuplicateAddress {
                address: "T".into(),
                existing: AccountId(1)
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            PoolError::InvariantViolation("negative".into()).class(),
            ErrorClass::InvariantViolation
        );
    }

    #[test]
    fn test_retryable() {
        assert!(PoolError::Network("reset".into()).is_retryable());
        assert!(PoolError::NoActiveAccounts.is_retryable());
        assert!(!PoolError::InvalidInput("x".into()).is_retryable());
        assert!(!PoolError::RetryExhausted {
            attempts: 3,
            last_error: "timeout".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_user_reasons_are_distinct() {
        let capacity = PoolError::NoActiveAccounts.user_reason();
        let payment = PoolError::InvalidPayment("amount is zero".into()).user_reason();
        let internal = PoolError::Storage("disk".into()).user_reason();

        assert_eq!(capacity, "no capacity available right now");
        assert!(payment.starts_with("payment invalid"));
        assert!(internal.contains("contact support"));
    }
}
