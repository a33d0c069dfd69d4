//! Argus Credential Vault - Token signing and secret encryption
//!
//! Bearer tokens are HS256-signed with a deployment secret; third-party API
//! keys are encrypted at rest with AES-256-GCM. Both keys come from the
//! environment or the config store; the encryption key is generated and
//! persisted on first use, the JWT secret is not.

use aes::Aes256;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Nonce};
use anyhow::anyhow;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use jwt_simple::prelude::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use crate::config_cache::{ConfigCache, ConfigKey};
use crate::errors::ApiError;

/// AES-256-GCM parameterized with the 128-bit nonce this deployment
/// prefixes to every ciphertext.
type VaultCipher = AesGcm<Aes256, U16>;

const NONCE_LEN: usize = 16;
const MIN_JWT_SECRET_LEN: usize = 32;

/// Verified identity carried by a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthClaims {
    pub user_id: Uuid,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenExtras {
    #[serde(default)]
    admin: bool,
}

pub struct CredentialVault {
    config: Arc<ConfigCache>,
    token_ttl_hours: u64,
    jwt_secret: OnceCell<Vec<u8>>,
    encryption_key: OnceCell<[u8; 32]>,
}

impl CredentialVault {
    pub fn new(config: Arc<ConfigCache>, token_ttl_hours: u64) -> Self {
        Self {
            config,
            token_ttl_hours,
            jwt_secret: OnceCell::new(),
            encryption_key: OnceCell::new(),
        }
    }

    // Token operations

    pub async fn sign(&self, user_id: Uuid, is_admin: bool) -> Result<String, ApiError> {
        let key = HS256Key::from_bytes(self.jwt_secret().await?);
        let claims = Claims::with_custom_claims(
            TokenExtras { admin: is_admin },
            Duration::from_hours(self.token_ttl_hours),
        )
        .with_subject(user_id.to_string());

        key.authenticate(claims)
            .map_err(|e| ApiError::Internal(anyhow!("token signing failed: {e}")))
    }

    pub async fn verify(&self, token: &str) -> Result<AuthClaims, ApiError> {
        let key = HS256Key::from_bytes(self.jwt_secret().await?);
        let claims = key
            .verify_token::<TokenExtras>(token, None)
            .map_err(|_| ApiError::Unauthenticated)?;

        let subject = claims.subject.ok_or(ApiError::Unauthenticated)?;
        let user_id = Uuid::parse_str(&subject).map_err(|_| ApiError::Unauthenticated)?;

        Ok(AuthClaims {
            user_id,
            is_admin: claims.custom.admin,
        })
    }

    async fn jwt_secret(&self) -> Result<&[u8], ApiError> {
        let secret = self
            .jwt_secret
            .get_or_try_init(|| async {
                let secret = match std::env::var("JWT_SECRET") {
                    Ok(value) if !value.is_empty() => value,
                    _ => self
                        .config
                        .get_string(ConfigKey::JwtSecret)
                        .await?
                        .ok_or_else(|| {
                            ApiError::Internal(anyhow!("JWT secret is not configured"))
                        })?,
                };
                if secret.len() < MIN_JWT_SECRET_LEN {
                    return Err(ApiError::Internal(anyhow!(
                        "JWT secret must be at least {MIN_JWT_SECRET_LEN} bytes"
                    )));
                }
                Ok::<Vec<u8>, ApiError>(secret.into_bytes())
            })
            .await?;
        Ok(secret.as_slice())
    }

    // Secret encryption

    /// Encrypt an opaque secret. Output is base64 of `nonce || ciphertext`
    /// with a fresh 128-bit nonce per call.
    pub async fn encrypt(&self, plaintext: &str) -> Result<String, ApiError> {
        let key = self.encryption_key().await?;
        let cipher = VaultCipher::new_from_slice(key)
            .map_err(|e| ApiError::Internal(anyhow!("cipher init failed: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<U16>::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| ApiError::Internal(anyhow!("encryption failed")))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub async fn decrypt(&self, encoded: &str) -> Result<String, ApiError> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|_| ApiError::Internal(anyhow!("corrupt ciphertext")))?;
        if blob.len() <= NONCE_LEN {
            return Err(ApiError::Internal(anyhow!("corrupt ciphertext")));
        }

        let key = self.encryption_key().await?;
        let cipher = VaultCipher::new_from_slice(key)
            .map_err(|e| ApiError::Internal(anyhow!("cipher init failed: {e}")))?;

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::<U16>::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| ApiError::Internal(anyhow!("corrupt ciphertext")))?;

        String::from_utf8(plaintext).map_err(|_| ApiError::Internal(anyhow!("corrupt ciphertext")))
    }

    async fn encryption_key(&self) -> Result<&[u8; 32], ApiError> {
        self.encryption_key
            .get_or_try_init(|| async {
                if let Ok(value) = std::env::var("ENCRYPTION_KEY") {
                    if !value.is_empty() {
                        return decode_key(&value);
                    }
                }
                if let Some(stored) = self.config.get_string(ConfigKey::EncryptionKey).await? {
                    return decode_key(&stored);
                }

                // First use: generate and persist a fresh 256-bit key.
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                self.config
                    .set(ConfigKey::EncryptionKey, json!(hex::encode(key)))
                    .await?;
                info!("Generated encryption key");
                Ok(key)
            })
            .await
    }

    // Password operations

    pub fn hash_password(&self, plaintext: &str) -> Result<String, ApiError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ApiError::Internal(anyhow!("password hashing failed: {e}")))
    }

    /// Returns `(ok, needs_rehash)`. Legacy bcrypt verifiers still pass but
    /// are flagged so callers can rehash opportunistically.
    pub fn verify_password(&self, plaintext: &str, stored: &str) -> (bool, bool) {
        if stored.starts_with("$2") {
            let ok = bcrypt::verify(plaintext, stored).unwrap_or(false);
            return (ok, ok);
        }
        match PasswordHash::new(stored) {
            Ok(parsed) => {
                let ok = Argon2::default()
                    .verify_password(plaintext.as_bytes(), &parsed)
                    .is_ok();
                (ok, false)
            }
            Err(_) => (false, false),
        }
    }

    // Refresh tokens

    /// Opaque refresh token plus the digest stored server-side.
    pub fn generate_refresh_token(&self) -> (String, String) {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let hash = Self::hash_refresh_token(&token);
        (token, hash)
    }

    pub fn hash_refresh_token(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    pub fn generate_secret(len: usize) -> String {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

fn decode_key(raw: &str) -> Result<[u8; 32], ApiError> {
    let bytes = hex::decode(raw.trim())
        .map_err(|_| ApiError::Internal(anyhow!("encryption key must be hex")))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ApiError::Internal(anyhow!("encryption key must be 32 bytes")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ArgusStorage;

    async fn vault_with_storage() -> (CredentialVault, Arc<ArgusStorage>) {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        storage
            .set_config(
                ConfigKey::JwtSecret.as_str(),
                &json!(CredentialVault::generate_secret(32)),
            )
            .await
            .unwrap();
        let cache = Arc::new(ConfigCache::new(storage.clone()));
        (CredentialVault::new(cache, 24), storage)
    }

    #[tokio::test]
    async fn test_token_round_trip() {
        let (vault, _storage) = vault_with_storage().await;
        let user_id = Uuid::new_v4();

        let token = vault.sign(user_id, true).await.unwrap();
        let claims = vault.verify(&token).await.unwrap();
        assert_eq!(claims.user_id, user_id);
        assert!(claims.is_admin);
    }

    #[tokio::test]
    async fn test_tampered_token_is_unauthenticated() {
        let (vault, _storage) = vault_with_storage().await;
        let token = vault.sign(Uuid::new_v4(), false).await.unwrap();

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(
            vault.verify(&tampered).await.unwrap_err(),
            ApiError::Unauthenticated
        ));
        assert!(matches!(
            vault.verify("not-a-token").await.unwrap_err(),
            ApiError::Unauthenticated
        ));
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_identity() {
        let (vault, _storage) = vault_with_storage().await;

        let long = "x".repeat(4096);
        for plaintext in ["", "k", "a third-party api key", long.as_str()] {
            let encrypted = vault.encrypt(plaintext).await.unwrap();
            assert_ne!(encrypted, plaintext);
            assert_eq!(vault.decrypt(&encrypted).await.unwrap(), plaintext);
        }
    }

    #[tokio::test]
    async fn test_fresh_nonce_per_encryption() {
        let (vault, _storage) = vault_with_storage().await;
        let a = vault.encrypt("same input").await.unwrap();
        let b = vault.encrypt("same input").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_generated_key_is_persisted() {
        let (vault, storage) = vault_with_storage().await;
        let encrypted = vault.encrypt("survives restarts").await.unwrap();

        // A second vault over the same store must decrypt the blob.
        let cache = Arc::new(ConfigCache::new(storage));
        let second = CredentialVault::new(cache, 24);
        assert_eq!(second.decrypt(&encrypted).await.unwrap(), "survives restarts");
    }

    #[tokio::test]
    async fn test_corrupt_ciphertext_fails() {
        let (vault, _storage) = vault_with_storage().await;
        let encrypted = vault.encrypt("payload").await.unwrap();

        let mut blob = BASE64.decode(&encrypted).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(vault.decrypt(&BASE64.encode(blob)).await.is_err());
        assert!(vault.decrypt("@@not-base64@@").await.is_err());
    }

    #[tokio::test]
    async fn test_password_verify_and_legacy_rehash_flag() {
        let (vault, _storage) = vault_with_storage().await;

        let hash = vault.hash_password("hunter2").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert_eq!(vault.verify_password("hunter2", &hash), (true, false));
        assert_eq!(vault.verify_password("wrong", &hash), (false, false));

        let legacy = bcrypt::hash("hunter2", 4).unwrap();
        assert_eq!(vault.verify_password("hunter2", &legacy), (true, true));
        assert_eq!(vault.verify_password("wrong", &legacy), (false, false));
    }

    #[tokio::test]
    async fn test_missing_jwt_secret_is_fatal() {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        let cache = Arc::new(ConfigCache::new(storage));
        let vault = CredentialVault::new(cache, 24);

        if std::env::var("JWT_SECRET").is_ok() {
            return; // environment already provides one
        }
        assert!(vault.sign(Uuid::new_v4(), false).await.is_err());
    }
}
