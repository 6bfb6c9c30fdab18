// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Local AES-256-GCM Keyring
//!
//! In-process [`KeyedCipher`] holding one or more 32-byte key versions.
//! The newest version wraps; any retained version unwraps, so ciphertexts
//! written before a rotation stay readable.
//!
//! Ciphertext layout:
//!
//! ```text
//! | version (u32, BE) | nonce (12 bytes) | AES-GCM ciphertext + tag |
//! ```
//!
//! The version bytes are also bound as associated data, so a ciphertext
//! cannot be replayed under another version's header.
//!
//! The keyring is also a [`DerivationKey`]: HKDF-SHA256 over a pinned key
//! version, the oldest one loaded. Rotation adds wrap keys but never moves
//! the derivation key, so session credentials can be re-derived for as long
//! as the keyring lives. That version cannot be retired.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::domain::broker_config::{resolve_secret_value, EncryptionConfig};
use crate::domain::crypto::{CryptoError, DerivationKey, KeyedCipher};

pub const KEY_LEN: usize = 32;
const VERSION_LEN: usize = 4;
const NONCE_LEN: usize = 12;

type KeyMaterial = Zeroizing<[u8; KEY_LEN]>;

struct Versions {
    keys: BTreeMap<u32, KeyMaterial>,
    current: u32,
    derivation: u32,
}

impl Versions {
    fn current(&self) -> Result<(u32, &KeyMaterial), CryptoError> {
        self.keys
            .get(&self.current)
            .map(|key| (self.current, key))
            .ok_or(CryptoError::UnknownKeyVersion(self.current))
    }

    fn derivation(&self) -> Result<&KeyMaterial, CryptoError> {
        self.keys
            .get(&self.derivation)
            .ok_or(CryptoError::UnknownKeyVersion(self.derivation))
    }
}

pub struct LocalKeyring {
    name: String,
    versions: RwLock<Versions>,
}

impl LocalKeyring {
    /// Keyring with a single key version.
    pub fn new(name: impl Into<String>, version: u32, material: [u8; KEY_LEN]) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, Zeroizing::new(material));
        Self {
            name: name.into(),
            versions: RwLock::new(Versions {
                keys,
                current: version,
                derivation: version,
            }),
        }
    }

    /// Keyring with a fresh random version 1 key.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(name, 1, random_key())
    }

    /// Build from `spec.encryption` with `provider: local`.
    pub fn from_config(config: &EncryptionConfig) -> anyhow::Result<Self> {
        let EncryptionConfig::Local { key_name, keys } = config else {
            anyhow::bail!("local keyring requires provider 'local'");
        };

        let mut versions = BTreeMap::new();
        for entry in keys {
            versions.insert(entry.version, decode_key(entry.version, &entry.material)?);
        }

        let (Some(&derivation), Some(&current)) = (versions.keys().next(), versions.keys().next_back())
        else {
            anyhow::bail!("local keyring '{}' has no keys", key_name);
        };

        tracing::info!(
            key_name = %key_name,
            versions = versions.len(),
            current,
            derivation,
            "Loaded local session keyring"
        );

        Ok(Self {
            name: key_name.clone(),
            versions: RwLock::new(Versions {
                keys: versions,
                current,
                derivation,
            }),
        })
    }

    /// Single-version keyring from base64 material (`env:VAR` allowed).
    pub fn from_material(name: impl Into<String>, raw: &str) -> anyhow::Result<Self> {
        let key = decode_key(1, raw)?;
        Ok(Self::new(name, 1, *key))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_version(&self) -> u32 {
        self.read().current
    }

    /// Key version session keys are derived from.
    pub fn derivation_version(&self) -> u32 {
        self.read().derivation
    }

    /// Add a random key version and make it current. Older versions are kept.
    pub fn rotate(&self) -> u32 {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        let next = versions.keys.keys().next_back().map_or(1, |v| v + 1);
        versions.keys.insert(next, Zeroizing::new(random_key()));
        versions.current = next;
        tracing::info!(key_name = %self.name, version = next, "Rotated session keyring");
        next
    }

    /// Drop a key version that is neither current nor the derivation key.
    pub fn retire(&self, version: u32) -> Result<(), CryptoError> {
        let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
        if versions.current == version {
            return Err(CryptoError::Backend(format!(
                "cannot retire current key version {version}"
            )));
        }
        if versions.derivation == version {
            return Err(CryptoError::Backend(format!(
                "cannot retire derivation key version {version}"
            )));
        }
        versions
            .keys
            .remove(&version)
            .map(|_| ())
            .ok_or(CryptoError::UnknownKeyVersion(version))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Versions> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let versions = self.read();
        let (version, key) = versions.current()?;
        let header = version.to_be_bytes();

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| CryptoError::Wrap(format!("AES-GCM encrypt: {e}")))?;

        let mut out = Vec::with_capacity(VERSION_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < VERSION_LEN + NONCE_LEN {
            return Err(CryptoError::Unwrap("ciphertext too short".to_string()));
        }
        let (header, rest) = sealed.split_at(VERSION_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let mut version_bytes = [0u8; VERSION_LEN];
        version_bytes.copy_from_slice(header);
        let version = u32::from_be_bytes(version_bytes);

        let versions = self.read();
        let key = versions
            .keys
            .get(&version)
            .ok_or(CryptoError::UnknownKeyVersion(version))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|e| CryptoError::Unwrap(format!("AES-GCM decrypt: {e}")))
    }
}

impl std::fmt::Debug for LocalKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let versions = self.read();
        f.debug_struct("LocalKeyring")
            .field("name", &self.name)
            .field("versions", &versions.keys.keys().collect::<Vec<_>>())
            .field("current", &versions.current)
            .field("derivation", &versions.derivation)
            .finish()
    }
}

#[async_trait]
impl KeyedCipher for LocalKeyring {
    fn key_id(&self) -> String {
        format!("{}:v{}", self.name, self.current_version())
    }

    /// Read from the version header; falls back to the current key for
    /// anything too short to carry one.
    fn key_id_of(&self, ciphertext: &[u8]) -> String {
        match ciphertext.get(..VERSION_LEN) {
            Some(header) => {
                let mut version_bytes = [0u8; VERSION_LEN];
                version_bytes.copy_from_slice(header);
                format!("{}:v{}", self.name, u32::from_be_bytes(version_bytes))
            }
            None => self.key_id(),
        }
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.seal(plaintext)
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.open(ciphertext)
    }
}

impl DerivationKey for LocalKeyring {
    fn derive(&self, salt: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError> {
        let versions = self.read();
        let key = versions.derivation()?;
        Hkdf::<Sha256>::new(Some(salt), key.as_slice())
            .expand(info, okm)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }
}

fn decode_key(version: u32, raw: &str) -> anyhow::Result<KeyMaterial> {
    let material = Zeroizing::new(resolve_secret_value(raw)?);
    let decoded = Zeroizing::new(
        base64::engine::general_purpose::STANDARD
            .decode(material.trim())
            .map_err(|e| anyhow::anyhow!("key version {}: invalid base64: {}", version, e))?,
    );
    let key: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!(
            "key version {}: expected {} bytes, got {}",
            version,
            KEY_LEN,
            decoded.len()
        )
    })?;
    Ok(Zeroizing::new(key))
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}
