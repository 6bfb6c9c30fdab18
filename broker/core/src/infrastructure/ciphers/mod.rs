// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod local_keyring;

pub use local_keyring::LocalKeyring;

use std::sync::Arc;

use crate::domain::broker_config::EncryptionConfig;
use crate::domain::crypto::{DerivationKey, KeyedCipher};
use crate::infrastructure::secrets_manager::TransitCipher;

/// Cipher and derivation source selected by `spec.encryption`.
pub struct CipherSet {
    pub cipher: Arc<dyn KeyedCipher>,
    pub derivation: Arc<dyn DerivationKey>,
}

/// Build the configured cipher.
///
/// The local keyring is its own derivation source. The transit backend
/// keeps wrap/unwrap remote and derives session keys from the configured
/// `derivation_key`.
pub fn from_config(config: &EncryptionConfig) -> anyhow::Result<CipherSet> {
    match config {
        EncryptionConfig::Local { .. } => {
            let keyring = Arc::new(LocalKeyring::from_config(config)?);
            Ok(CipherSet {
                cipher: keyring.clone(),
                derivation: keyring,
            })
        }
        EncryptionConfig::Transit {
            key_name,
            derivation_key,
            ..
        } => {
            let transit = TransitCipher::from_config(config)?;
            let derivation = LocalKeyring::from_material(key_name.clone(), derivation_key)?;
            Ok(CipherSet {
                cipher: Arc::new(transit),
                derivation: Arc::new(derivation),
            })
        }
    }
}
