use crate::store::{self, KvStore, StoreError};
use data_encoding::BASE64URL_NOPAD;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::{Arc, OnceLock};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_EXPIRATION_SECONDS: u64 = 60 * 60;

/// KV key the shared signing secret is ensured under.
const SIGNING_SECRET_KEY: &str = "signing_secret";

/// 20 alphanumeric characters. Session-token signing material only, not a
/// long-term trust root.
const SECRET_LENGTH: usize = 20;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("signing secret not initialized")]
    MissingSecret,
    #[error("could not read signing secret: {0}")]
    Secret(#[from] StoreError),
}

/// Claims binding a user identity to a single file for the duration of an
/// editing session. Carried by the editor server as a bearer credential in
/// the callback URL; never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub user_id: String,
    pub file_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

pub fn current_time_epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

fn generate_secret() -> Vec<u8> {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(SECRET_LENGTH)
        .collect()
}

fn sign(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Owns the signing-secret lifecycle and the HMAC-SHA256 token codec.
///
/// The secret is established once, cluster-wide, via [`store::ensure_once`];
/// every instance in a fleet converges on the same value. If the shared
/// store is unreachable at startup the freshly generated candidate becomes a
/// process-local fallback: tokens then validate only against the instance
/// that minted them.
pub struct Authenticator {
    store: Arc<dyn KvStore>,
    fallback_secret: OnceLock<Vec<u8>>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            fallback_secret: OnceLock::new(),
        }
    }

    /// Called once at startup. Generates a candidate secret and ensures one
    /// shared value exists in the KV store, falling back to the candidate if
    /// the store cannot be reached. The fallback is all-or-nothing: once set
    /// it is authoritative for the rest of the process lifetime.
    pub async fn ensure_secret(&self) {
        let candidate = generate_secret();
        if let Err(err) = store::ensure_once(self.store.as_ref(), SIGNING_SECRET_KEY, &candidate).await
        {
            tracing::error!(
                %err,
                "cannot persist signing secret, using a process-local fallback; \
                 tokens will only validate against this instance"
            );
            let _ = self.fallback_secret.set(candidate);
        }
    }

    /// The secret is re-read from the store on every call (never cached), so
    /// an operator-rotated secret takes effect without a restart. In
    /// fallback mode the local value is authoritative instead.
    async fn current_secret(&self) -> Result<Vec<u8>, AuthError> {
        if let Some(secret) = self.fallback_secret.get() {
            return Ok(secret.clone());
        }
        match self.store.get(SIGNING_SECRET_KEY).await? {
            Some(secret) => Ok(secret),
            None => Err(AuthError::MissingSecret),
        }
    }

    /// Mint a signed token pairing `user_id` with `file_id`, valid for
    /// [`DEFAULT_EXPIRATION_SECONDS`].
    pub async fn encode_token(&self, user_id: &str, file_id: &str) -> Result<String, AuthError> {
        let now = current_time_epoch_millis();
        self.encode_token_expiring(user_id, file_id, now + DEFAULT_EXPIRATION_SECONDS * 1000)
            .await
    }

    pub async fn encode_token_expiring(
        &self,
        user_id: &str,
        file_id: &str,
        expires_at: u64,
    ) -> Result<String, AuthError> {
        let claims = AccessToken {
            user_id: user_id.to_string(),
            file_id: file_id.to_string(),
            issued_at: current_time_epoch_millis(),
            expires_at,
        };
        let secret = self.current_secret().await?;
        let payload = serde_json::to_vec(&claims).map_err(|_| AuthError::InvalidToken)?;
        let body = BASE64URL_NOPAD.encode(&payload);
        let signature = BASE64URL_NOPAD.encode(&sign(&secret, body.as_bytes()));
        Ok(format!("{body}.{signature}"))
    }

    /// Verify authenticity and expiry of a token string and return its
    /// claims. This proves only that the claims are genuine; binding the
    /// `file_id` claim to the request path is the protocol handler's job.
    pub async fn decode_token(&self, token: &str) -> Result<AccessToken, AuthError> {
        let secret = self.current_secret().await?;
        let (body, signature) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let signature = BASE64URL_NOPAD
            .decode(signature.as_bytes())
            .map_err(|_| AuthError::InvalidToken)?;

        let mut mac = HmacSha256::new_from_slice(&secret).expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let payload = BASE64URL_NOPAD
            .decode(body.as_bytes())
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: AccessToken =
            serde_json::from_slice(&payload).map_err(|_| AuthError::InvalidToken)?;

        if claims.expires_at < current_time_epoch_millis() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use async_trait::async_trait;

    async fn test_authenticator() -> (Arc<MemoryKv>, Authenticator) {
        let kv = Arc::new(MemoryKv::new());
        let authenticator = Authenticator::new(kv.clone());
        authenticator.ensure_secret().await;
        (kv, authenticator)
    }

    #[tokio::test]
    async fn token_round_trip() {
        let (_, authenticator) = test_authenticator().await;

        let token = authenticator.encode_token("user-1", "file-1").await.unwrap();
        let claims = authenticator.decode_token(&token).await.unwrap();

        assert_eq!(claims.user_id, "user-1");
        assert_eq!(claims.file_id, "file-1");
        assert!(claims.expires_at > claims.issued_at);
    }

    #[tokio::test]
    async fn flipped_signature_bit_is_rejected() {
        let (_, authenticator) = test_authenticator().await;

        let token = authenticator.encode_token("user-1", "file-1").await.unwrap();
        let dot = token.find('.').unwrap();
        let mut bytes = BASE64URL_NOPAD
            .decode(token[dot + 1..].as_bytes())
            .unwrap();
        bytes[0] ^= 0x01;
        let tampered = format!("{}.{}", &token[..dot], BASE64URL_NOPAD.encode(&bytes));

        let err = authenticator.decode_token(&tampered).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
    }

    #[tokio::test]
    async fn malformed_tokens_are_rejected() {
        let (_, authenticator) = test_authenticator().await;

        for garbage in ["", "no-dot", "a.b.c", "not base64.!!!!", "%%%.%%%"] {
            assert!(
                authenticator.decode_token(garbage).await.is_err(),
                "accepted: {garbage:?}"
            );
        }
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let (_, authenticator) = test_authenticator().await;

        let token = authenticator
            .encode_token_expiring("user-1", "file-1", current_time_epoch_millis() - 1)
            .await
            .unwrap();
        let err = authenticator.decode_token(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn rotated_secret_invalidates_old_tokens() {
        let (kv, authenticator) = test_authenticator().await;

        let token = authenticator.encode_token("user-1", "file-1").await.unwrap();
        kv.insert(SIGNING_SECRET_KEY, b"rotated-secret-value");

        let err = authenticator.decode_token(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));

        // New tokens are signed with the rotated secret, no restart needed.
        let fresh = authenticator.encode_token("user-1", "file-1").await.unwrap();
        assert!(authenticator.decode_token(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn fallback_secret_serves_tokens_when_store_is_down() {
        struct DeadKv;

        #[async_trait]
        impl KvStore for DeadKv {
            async fn get(&self, _key: &str) -> store::Result<Option<Vec<u8>>> {
                Err(StoreError::Backend("store unreachable".into()))
            }

            async fn set_if_absent(&self, _key: &str, _value: &[u8]) -> store::Result<bool> {
                Err(StoreError::Backend("store unreachable".into()))
            }
        }

        let authenticator = Authenticator::new(Arc::new(DeadKv));
        authenticator.ensure_secret().await;

        let token = authenticator.encode_token("user-1", "file-1").await.unwrap();
        let claims = authenticator.decode_token(&token).await.unwrap();
        assert_eq!(claims.file_id, "file-1");
    }

    #[tokio::test]
    async fn fallback_is_all_or_nothing() {
        // Store errors at startup but recovers later: the fallback must stay
        // authoritative, never mixing local and shared secrets.
        struct LateKv {
            inner: MemoryKv,
            failed_once: std::sync::atomic::AtomicBool,
        }

        #[async_trait]
        impl KvStore for LateKv {
            async fn get(&self, key: &str) -> store::Result<Option<Vec<u8>>> {
                if !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    return Err(StoreError::Backend("store unreachable".into()));
                }
                self.inner.get(key).await
            }

            async fn set_if_absent(&self, key: &str, value: &[u8]) -> store::Result<bool> {
                self.inner.set_if_absent(key, value).await
            }
        }

        let kv = LateKv {
            inner: MemoryKv::new(),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        };
        kv.inner.insert(SIGNING_SECRET_KEY, b"shared-secret");

        let authenticator = Authenticator::new(Arc::new(kv));
        authenticator.ensure_secret().await;

        let token = authenticator.encode_token("user-1", "file-1").await.unwrap();
        // Decoding uses the fallback even though the store now answers.
        assert!(authenticator.decode_token(&token).await.is_ok());
    }
}
