// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Transit Engine Cipher (Vault / OpenBao)
//!
//! [`KeyedCipher`] backed by the transit secrets engine: encryption as a
//! service, no key material ever leaves the vault. The controller
//! authenticates with a token (`spec.encryption.token`, usually
//! `env:VAULT_TOKEN`).
//!
//! Transit ciphertexts are self-describing (`vault:v<N>:<base64>`), so
//! unwrap needs no version lookup and [`KeyedCipher::key_id_of`] reads the
//! version straight from the ciphertext it is given. [`KeyedCipher::key_id`]
//! only reports the newest version seen so far, and carries no version
//! before the first wrap.
//!
//! Network failures and 5xx responses map to [`CryptoError::Unavailable`]
//! (the caller may retry); everything else is a hard [`CryptoError::Backend`].

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use base64::Engine;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;

use crate::domain::broker_config::{resolve_secret_value, EncryptionConfig};
use crate::domain::crypto::{CryptoError, KeyedCipher};

pub struct TransitCipher {
    client: VaultClient,
    mount: String,
    key_name: String,
    latest_version: AtomicU32,
}

impl TransitCipher {
    pub fn new(address: &str, token: &str, mount: &str, key_name: &str) -> anyhow::Result<Self> {
        if !(address.starts_with("http://") || address.starts_with("https://")) {
            anyhow::bail!("transit address must be an http(s) URL, got '{}'", address);
        }
        let settings = VaultClientSettingsBuilder::default()
            .address(address)
            .token(token)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid transit client settings: {}", e))?;
        let client = VaultClient::new(settings)?;

        Ok(Self {
            client,
            mount: mount.to_string(),
            key_name: key_name.to_string(),
            latest_version: AtomicU32::new(0),
        })
    }

    /// Build from `spec.encryption` with `provider: transit`.
    pub fn from_config(config: &EncryptionConfig) -> anyhow::Result<Self> {
        let EncryptionConfig::Transit {
            address,
            token,
            mount,
            key_name,
            ..
        } = config
        else {
            anyhow::bail!("transit cipher requires provider 'transit'");
        };
        let token = resolve_secret_value(token)?;
        tracing::info!(address = %address, mount = %mount, key_name = %key_name, "Configured transit session cipher");
        Self::new(address, &token, mount, key_name)
    }

    fn versioned_key_id(&self, version: u32) -> String {
        format!("transit:{}/{}:v{}", self.mount, self.key_name, version)
    }

    fn record_version(&self, ciphertext: &str) {
        if let Some(version) = parse_key_version(ciphertext) {
            self.latest_version.fetch_max(version, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl KeyedCipher for TransitCipher {
    fn key_id(&self) -> String {
        match self.latest_version.load(Ordering::Relaxed) {
            0 => format!("transit:{}/{}", self.mount, self.key_name),
            version => self.versioned_key_id(version),
        }
    }

    fn key_id_of(&self, ciphertext: &[u8]) -> String {
        std::str::from_utf8(ciphertext)
            .ok()
            .and_then(parse_key_version)
            .map_or_else(|| self.key_id(), |version| self.versioned_key_id(version))
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(plaintext);
        let response = vaultrs::transit::data::encrypt(
            &self.client,
            &self.mount,
            &self.key_name,
            &encoded,
            None,
        )
        .await
        .map_err(|e| classify(e, CryptoError::Wrap))?;

        self.record_version(&response.ciphertext);
        Ok(response.ciphertext.into_bytes())
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|_| CryptoError::Unwrap("transit ciphertext is not UTF-8".to_string()))?;
        if parse_key_version(ciphertext).is_none() {
            return Err(CryptoError::Unwrap("not a transit ciphertext".to_string()));
        }

        let response = vaultrs::transit::data::decrypt(
            &self.client,
            &self.mount,
            &self.key_name,
            ciphertext,
            None,
        )
        .await
        .map_err(|e| classify(e, CryptoError::Unwrap))?;

        base64::engine::general_purpose::STANDARD
            .decode(response.plaintext)
            .map_err(|e| CryptoError::Unwrap(format!("transit plaintext is not base64: {e}")))
    }
}

/// `vault:v7:...` -> `Some(7)`
fn parse_key_version(ciphertext: &str) -> Option<u32> {
    let mut parts = ciphertext.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("vault"), Some(version), Some(_)) => version.strip_prefix('v')?.parse().ok(),
        _ => None,
    }
}

fn classify(err: ClientError, rejected: fn(String) -> CryptoError) -> CryptoError {
    match err {
        ClientError::APIError { code, errors } if code >= 500 => {
            CryptoError::Unavailable(format!("transit returned {code}: {}", errors.join("; ")))
        }
        ClientError::APIError { code: 400, errors } => {
            rejected(format!("transit rejected request: {}", errors.join("; ")))
        }
        other @ ClientError::RestClientError { .. } => CryptoError::Unavailable(other.to_string()),
        other => CryptoError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transit_config() -> EncryptionConfig {
        EncryptionConfig::Transit {
            address: "http://127.0.0.1:8200".to_string(),
            token: "root".to_string(),
            mount: "transit".to_string(),
            key_name: "sessions".to_string(),
            derivation_key: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string(),
        }
    }

    #[test]
    fn test_parse_key_version() {
        assert_eq!(parse_key_version("vault:v1:abcd"), Some(1));
        assert_eq!(parse_key_version("vault:v12:ab:cd"), Some(12));
        assert_eq!(parse_key_version("vault:1:abcd"), None);
        assert_eq!(parse_key_version("local:v1:abcd"), None);
        assert_eq!(parse_key_version("vault:v1"), None);
    }

    #[test]
    fn test_key_id_tracks_latest_version() {
        let cipher = TransitCipher::from_config(&transit_config()).unwrap();
        assert_eq!(cipher.key_id(), "transit:transit/sessions");

        cipher.record_version("vault:v3:Zm9v");
        cipher.record_version("vault:v2:Zm9v");
        assert_eq!(cipher.key_id(), "transit:transit/sessions:v3");
    }

    #[test]
    fn test_key_id_of_reads_the_ciphertext_not_the_latest_wrap() {
        let cipher = TransitCipher::from_config(&transit_config()).unwrap();
        cipher.record_version("vault:v5:Zm9v");

        assert_eq!(cipher.key_id_of(b"vault:v4:Zm9v"), "transit:transit/sessions:v4");
        assert_eq!(cipher.key_id_of(b"not-transit"), "transit:transit/sessions:v5");
    }

    #[test]
    fn test_from_config_rejects_local_provider() {
        let config = EncryptionConfig::Local {
            key_name: "sessions".to_string(),
            keys: Vec::new(),
        };
        assert!(TransitCipher::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_unwrap_rejects_foreign_ciphertext_without_network() {
        let cipher = TransitCipher::from_config(&transit_config()).unwrap();
        assert!(matches!(
            cipher.unwrap(b"\x00\x00\x00\x01garbage").await,
            Err(CryptoError::Unwrap(_))
        ));
        assert!(matches!(cipher.unwrap(&[0xff, 0xfe]).await, Err(CryptoError::Unwrap(_))));
    }

    #[test]
    fn test_classify_server_errors_as_transient() {
        let err = classify(
            ClientError::APIError {
                code: 503,
                errors: vec!["sealed".to_string()],
            },
            CryptoError::Wrap,
        );
        assert!(err.is_transient());

        let err = classify(
            ClientError::APIError {
                code: 400,
                errors: vec!["invalid ciphertext".to_string()],
            },
            CryptoError::Unwrap,
        );
        assert!(matches!(err, CryptoError::Unwrap(_)));

        let err = classify(
            ClientError::APIError {
                code: 403,
                errors: vec!["permission denied".to_string()],
            },
            CryptoError::Unwrap,
        );
        assert!(matches!(err, CryptoError::Backend(_)));
    }
}
