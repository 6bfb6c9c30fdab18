// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Envelope Encryption Adapter
//!
//! Moves session secrets between their plaintext and ciphertext halves
//! through an external [`KeyedCipher`]. The pairs come from
//! [`Session::secret_fields_mut`]; the adapter knows nothing about which
//! fields are secret.
//!
//! - `encrypt_session` is all-or-nothing: every field is wrapped into a
//!   staging buffer first and the session is only touched once every wrap
//!   succeeded. `key_id` names the key that produced the stored ciphertext;
//!   a session with no ciphertext at all records the cipher's current key.
//! - `decrypt_session` fails closed: on any unwrap error every plaintext
//!   half is cleared before the error is returned.
//!
//! Cipher calls run under the caller's [`CryptoContext`] and are never
//! retried here.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::domain::crypto::{CryptoContext, CryptoError, KeyedCipher};
use crate::domain::error::SessionError;
use crate::domain::session::{Session, SessionField, SessionId};
use crate::infrastructure::telemetry;

const ENCRYPT_OP: &str = "encrypt session";
const DECRYPT_OP: &str = "decrypt session";

pub async fn encrypt_session(
    ctx: &CryptoContext,
    cipher: &dyn KeyedCipher,
    session: &mut Session,
) -> Result<(), SessionError> {
    let public_id = session.public_id.clone();
    let mut staged: Vec<Option<Vec<u8>>> = Vec::new();
    let mut sealed_key_id = None;
    let mut had_ciphertext = false;
    for field in session.secret_fields_mut() {
        had_ciphertext |= field.ciphertext.is_some();
        let sealed = match field.plaintext.as_ref() {
            Some(plaintext) => {
                let ciphertext = ctx
                    .run(cipher.wrap(plaintext))
                    .await
                    .map_err(|source| crypto_failure(ENCRYPT_OP, &public_id, field.name, source))?;
                sealed_key_id = Some(cipher.key_id_of(&ciphertext));
                Some(ciphertext)
            }
            None => None,
        };
        staged.push(sealed);
    }

    for (field, sealed) in session.secret_fields_mut().into_iter().zip(staged) {
        if let Some(ciphertext) = sealed {
            *field.ciphertext = Some(ciphertext);
        }
    }
    // Existing ciphertext keeps the key id that produced it.
    match sealed_key_id {
        Some(key_id) => session.key_id = key_id,
        None if !had_ciphertext => session.key_id = cipher.key_id(),
        None => {}
    }

    debug!(public_id = %session.public_id, key_id = %session.key_id, "Encrypted session secrets");
    Ok(())
}

pub async fn decrypt_session(
    ctx: &CryptoContext,
    cipher: &dyn KeyedCipher,
    session: &mut Session,
) -> Result<(), SessionError> {
    let public_id = session.public_id.clone();
    let mut failure = None;
    for field in session.secret_fields_mut() {
        let Some(ciphertext) = field.ciphertext.as_deref() else {
            *field.plaintext = None;
            continue;
        };
        match ctx.run(cipher.unwrap(ciphertext)).await {
            Ok(plaintext) => *field.plaintext = Some(Zeroizing::new(plaintext)),
            Err(source) => {
                failure = Some(crypto_failure(DECRYPT_OP, &public_id, field.name, source));
                break;
            }
        }
    }

    if let Some(err) = failure {
        for field in session.secret_fields_mut() {
            *field.plaintext = None;
        }
        warn!(public_id = %session.public_id, key_id = %session.key_id, "Session secrets cleared after failed decrypt");
        return Err(err);
    }

    debug!(public_id = %session.public_id, key_id = %session.key_id, "Decrypted session secrets");
    Ok(())
}

fn crypto_failure(
    op: &'static str,
    public_id: &SessionId,
    field: SessionField,
    source: CryptoError,
) -> SessionError {
    telemetry::record_crypto_failure(op);
    warn!(
        public_id = %public_id,
        field = %field,
        error = %source,
        retryable = source.is_transient(),
        "{} failed",
        op
    );
    SessionError::Crypto { op, source }
}
