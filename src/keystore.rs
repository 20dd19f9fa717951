//! Key store (spec.md §4.2). Read-only at runtime, re-read on each
//! validation so hot-rotation is supported (spec.md §5).

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use ed25519_dalek::VerifyingKey;

use crate::error::{Reason, WardenError};
use crate::model::{KeyFile, TrustedKey};

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("keyId \"default\" is forbidden")]
    DefaultKeyIdForbidden,
    #[error("invalid base64 public key for keyId {0}")]
    InvalidPublicKeyEncoding(String),
    #[error("public key for keyId {0} is not a valid Ed25519 point")]
    InvalidPublicKey(String),
    #[error(transparent)]
    Warden(#[from] WardenError),
}

pub struct KeyStore {
    keys: BTreeMap<String, TrustedKey>,
}

impl KeyStore {
    /// Parse and validate a `config/keys.json` document. `"default"` as a
    /// `keyId` is refused here, at load time, not deferred to lookup.
    pub fn load(path: &Path) -> Result<Self, KeyStoreError> {
        let bytes = crate::fsutil::read_optional(path)
            .map_err(KeyStoreError::Warden)?
            .ok_or_else(|| {
                KeyStoreError::Warden(WardenError::Io {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "keys file missing"),
                })
            })?;
        let file: KeyFile = serde_json::from_slice(&bytes).map_err(|e| {
            KeyStoreError::Warden(WardenError::Parse {
                what: "keys.json".into(),
                source: e,
            })
        })?;

        let mut keys = BTreeMap::new();
        for key in file.keys {
            if key.key_id == "default" {
                return Err(KeyStoreError::DefaultKeyIdForbidden);
            }
            // Fail fast on a malformed key rather than at first use.
            decode_verifying_key(&key)?;
            keys.insert(key.key_id.clone(), key);
        }
        Ok(KeyStore { keys })
    }

    pub fn from_keys(keys: Vec<TrustedKey>) -> Result<Self, KeyStoreError> {
        let mut map = BTreeMap::new();
        for key in keys {
            if key.key_id == "default" {
                return Err(KeyStoreError::DefaultKeyIdForbidden);
            }
            decode_verifying_key(&key)?;
            map.insert(key.key_id.clone(), key);
        }
        Ok(KeyStore { keys: map })
    }

    pub fn get(&self, key_id: &str) -> Option<&TrustedKey> {
        self.keys.get(key_id)
    }

    /// Resolve `key_id` and apply every lifecycle/authorization check in
    /// spec.md §4.2, in the order specified.
    pub fn resolve(
        &self,
        key_id: &str,
        requester_id: &str,
        now: i64,
    ) -> Result<(&TrustedKey, VerifyingKey), Reason> {
        let key = self.keys.get(key_id).ok_or(Reason::KeyIdInvalid)?;
        if now < key.not_before {
            return Err(Reason::KeyNotYetValid);
        }
        if now > key.expires_at {
            return Err(Reason::KeyExpired);
        }
        if let Some(allowed) = &key.trusted_requesters {
            if !allowed.contains(requester_id) {
                return Err(Reason::KeyNotAuthorizedForRequester);
            }
        }
        let vk = decode_verifying_key(key).map_err(|_| Reason::KeyIdInvalid)?;
        Ok((key, vk))
    }
}

fn decode_verifying_key(key: &TrustedKey) -> Result<VerifyingKey, KeyStoreError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&key.public_key)
        .map_err(|_| KeyStoreError::InvalidPublicKeyEncoding(key.key_id.clone()))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyStoreError::InvalidPublicKey(key.key_id.clone()))?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyStoreError::InvalidPublicKey(key.key_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::collections::BTreeSet;

    fn make_key(key_id: &str, not_before: i64, expires_at: i64) -> (TrustedKey, SigningKey) {
        let sk = SigningKey::generate(&mut OsRng);
        let pk = base64::engine::general_purpose::STANDARD.encode(sk.verifying_key().as_bytes());
        (
            TrustedKey {
                key_id: key_id.to_string(),
                public_key: pk,
                not_before,
                expires_at,
                trusted_requesters: None,
            },
            sk,
        )
    }

    #[test]
    fn rejects_default_key_id_at_load_time() {
        let (mut key, _sk) = make_key("default", 0, 10_000_000_000);
        key.key_id = "default".into();
        let err = KeyStore::from_keys(vec![key]).unwrap_err();
        assert!(matches!(err, KeyStoreError::DefaultKeyIdForbidden));
    }

    #[test]
    fn resolve_unknown_key_id() {
        let store = KeyStore::from_keys(vec![]).unwrap();
        assert_eq!(
            store.resolve("nope", "agent:gpt", 1000).unwrap_err(),
            Reason::KeyIdInvalid
        );
    }

    #[test]
    fn resolve_not_yet_valid() {
        let (key, _sk) = make_key("k1", 5000, 10_000);
        let store = KeyStore::from_keys(vec![key]).unwrap();
        assert_eq!(
            store.resolve("k1", "agent:gpt", 1000).unwrap_err(),
            Reason::KeyNotYetValid
        );
    }

    #[test]
    fn resolve_expired() {
        let (key, _sk) = make_key("k1", 0, 1000);
        let store = KeyStore::from_keys(vec![key]).unwrap();
        assert_eq!(
            store.resolve("k1", "agent:gpt", 5000).unwrap_err(),
            Reason::KeyExpired
        );
    }

    #[test]
    fn resolve_not_authorized_for_requester() {
        let (mut key, _sk) = make_key("k1", 0, 10_000_000_000);
        key.trusted_requesters = Some(BTreeSet::from(["agent:claude".to_string()]));
        let store = KeyStore::from_keys(vec![key]).unwrap();
        assert_eq!(
            store.resolve("k1", "agent:gpt", 1000).unwrap_err(),
            Reason::KeyNotAuthorizedForRequester
        );
    }

    #[test]
    fn resolve_succeeds_within_lifecycle_and_allowlist() {
        let (mut key, _sk) = make_key("k1", 0, 10_000_000_000);
        key.trusted_requesters = Some(BTreeSet::from(["agent:gpt".to_string()]));
        let store = KeyStore::from_keys(vec![key]).unwrap();
        assert!(store.resolve("k1", "agent:gpt", 1000).is_ok());
    }
}
