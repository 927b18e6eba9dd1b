//! Signing Key Vault
//!
//! Pool account keys are stored AES-256-GCM encrypted (`nonce || ciphertext`,
//! hex encoded). A key is only ever decrypted into a [`ScopedSigner`] bound to
//! a single delegation call; dropping the signer wipes the key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use k256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::KeyVaultConfig;
use crate::error::{PoolError, PoolResult};
use crate::types::{AccountId, PoolAccount};

const NONCE_LEN: usize = 12;

/// Encrypts account keys at rest and hands out scoped signers
pub struct KeyVault {
    master: Zeroizing<[u8; 32]>,
}

impl KeyVault {
    /// Create a vault from the configured master key
    pub fn new(config: &KeyVaultConfig) -> PoolResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(config.master_key_hex.trim())
                .map_err(|e| PoolError::Configuration(format!("master key: {}", e)))?,
        );
        let master: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            PoolError::Configuration(format!(
                "master key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self {
            master: Zeroizing::new(master),
        })
    }

    /// Encrypt a hex private key for storage
    ///
    /// The key is checked to be a valid secp256k1 scalar before encryption.
    pub fn encrypt_key(&self, private_key_hex: &str) -> PoolResult<String> {
        let secret = parse_secret(private_key_hex)?;

        let cipher = Aes256Gcm::new_from_slice(self.master.as_slice())
            .map_err(|e| PoolError::SigningKey(format!("cipher init failed: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, secret.as_slice())
            .map_err(|e| PoolError::SigningKey(format!("encrypt failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    /// Decrypt an account key into a signer scoped to the caller
    pub fn activate(&self, account: &PoolAccount) -> PoolResult<ScopedSigner> {
        let secret = self.decrypt(&account.encrypted_key)?;
        debug!(account_id = %account.id, "Signer activated");
        Ok(ScopedSigner {
            account_id: account.id,
            address: account.address.clone(),
            secret,
        })
    }

    fn decrypt(&self, encrypted_hex: &str) -> PoolResult<Zeroizing<[u8; 32]>> {
        let blob = hex::decode(encrypted_hex)?;
        if blob.len() <= NONCE_LEN {
            return Err(PoolError::SigningKey("encrypted key too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(self.master.as_slice())
            .map_err(|e| PoolError::SigningKey(format!("cipher init failed: {}", e)))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| PoolError::SigningKey("decrypt failed (wrong master key?)".to_string()))?,
        );

        let secret: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| PoolError::SigningKey("decrypted key has wrong length".to_string()))?;
        Ok(Zeroizing::new(secret))
    }
}

fn parse_secret(private_key_hex: &str) -> PoolResult<Zeroizing<[u8; 32]>> {
    let trimmed = private_key_hex.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = Zeroizing::new(
        hex::decode(trimmed).map_err(|e| PoolError::InvalidInput(format!("private key: {}", e)))?,
    );
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| PoolError::InvalidInput("private key must be 32 bytes".to_string()))?;
    SigningKey::from_slice(&secret)
        .map_err(|_| PoolError::InvalidInput("private key is not a valid secp256k1 scalar".to_string()))?;
    Ok(Zeroizing::new(secret))
}

/// Signing capability bound to one pool account for one call
///
/// Not `Clone`. The decrypted key lives in zeroizing memory and is wiped
/// when the signer goes out of scope, on every exit path.
pub struct ScopedSigner {
    account_id: AccountId,
    address: String,
    secret: Zeroizing<[u8; 32]>,
}

impl ScopedSigner {
    pub fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Address of the account this signer acts for
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign a 32-byte transaction id
    ///
    /// Returns `r || s || v` (65 bytes) as expected by TRON nodes.
    pub fn sign_txid(&self, txid: &[u8]) -> PoolResult<[u8; 65]> {
        if txid.len() != 32 {
            return Err(PoolError::InvalidInput(format!(
                "txid must be 32 bytes, got {}",
                txid.len()
            )));
        }
        let key = SigningKey::from_slice(self.secret.as_slice())
            .map_err(|e| PoolError::SigningKey(e.to_string()))?;
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(txid)
            .map_err(|e| PoolError::SigningKey(e.to_string()))?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }
}

impl Drop for ScopedSigner {
    fn drop(&mut self) {
        debug!(account_id = %self.account_id, "Signer deactivated");
    }
}

impl fmt::Debug for ScopedSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSigner")
            .field("account_id", &self.account_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountClass, AccountStatus};
    use chrono::Utc;
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
    use rust_decimal::Decimal;

    const KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

    fn vault() -> KeyVault {
        KeyVault::new(&KeyVaultConfig {
            master_key_hex: "11".repeat(32),
        })
        .unwrap()
    }

    fn account(encrypted_key: String) -> PoolAccount {
        PoolAccount {
            id: AccountId(7),
            address: "TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7".to_string(),
            name: "a".to_string(),
            encrypted_key,
            status: AccountStatus::Active,
            priority: 1,
            cost_per_unit: Decimal::ZERO,
            class: AccountClass::Own,
            daily_cap: None,
            monthly_cap: None,
            description: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let vault = vault();
        let a = vault.encrypt_key(KEY).unwrap();
        let b = vault.encrypt_key(KEY).unwrap();
        assert_ne!(a, b);
        assert!(!a.contains(KEY));
    }

    #[test]
    fn test_signature_recovers_to_key() {
        let vault = vault();
        let signer = vault.activate(&account(vault.encrypt_key(KEY).unwrap())).unwrap();
        assert_eq!(signer.account_id(), AccountId(7));

        let txid = [0x42u8; 32];
        let sig = signer.sign_txid(&txid).unwrap();

        let signature = Signature::from_slice(&sig[..64]).unwrap();
        let recovery_id = RecoveryId::from_byte(sig[64]).unwrap();
        let recovered = VerifyingKey::recover_from_prehash(&txid, &signature, recovery_id).unwrap();

        let expected = SigningKey::from_slice(&hex::decode(KEY).unwrap()).unwrap();
        assert_eq!(&recovered, expected.verifying_key());
    }

    #[test]
    fn test_wrong_master_key_fails() {
        let encrypted = vault().encrypt_key(KEY).unwrap();
        let other = KeyVault::new(&KeyVaultConfig {
            master_key_hex: "22".repeat(32),
        })
        .unwrap();
        assert!(matches!(
            other.activate(&account(encrypted)),
            Err(PoolError::SigningKey(_))
        ));
    }

    #[test]
    fn test_invalid_private_key_rejected() {
        let vault = vault();
        assert!(vault.encrypt_key("abcd").is_err());
        assert!(vault.encrypt_key(&"00".repeat(32)).is_err());
        assert!(vault.encrypt_key(&format!("0x{}", KEY)).is_ok());
    }

    #[test]
    fn test_txid_length_checked() {
        let vault = vault();
        let signer = vault.activate(&account(vault.encrypt_key(KEY).unwrap())).unwrap();
        assert!(signer.sign_txid(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let vault = vault();
        let signer = vault.activate(&account(vault.encrypt_key(KEY).unwrap())).unwrap();
        let debug = format!("{:?}", signer);
        assert!(!debug.contains("0f1e2d"));
    }
}
