// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Session Credential Issuer
//!
//! Each session gets an Ed25519 keypair and a self-signed X.509 certificate.
//! The keypair is derived, not generated: HKDF-SHA256 over the controller's
//! derivation key with `salt = user_id` and `info = job_id` produces the
//! 32-byte seed. A worker holding the same derivation key can therefore
//! re-derive the private key from the session's identity, and the controller
//! never needs to store it.
//!
//! The certificate carries the job id as both common name and DNS SAN, is
//! valid from one minute in the past until the session expiration, and is
//! marked as a CA so the worker can anchor a TLS handshake on it directly.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use time::OffsetDateTime;
use zeroize::Zeroizing;

use crate::domain::crypto::{CryptoContext, CryptoError, DerivationKey};
use crate::domain::error::SessionError;
use crate::domain::session::SessionField;

const ISSUE_OP: &str = "issue credential";
const DERIVE_OP: &str = "derive session key";

/// Clock skew allowance on the certificate's NotBefore.
const NOT_BEFORE_SKEW_SECS: i64 = 60;

/// A freshly issued session credential.
///
/// The signing key is zeroized on drop. Callers keep only `certificate_der`.
pub struct IssuedCredential {
    pub signing_key: SigningKey,
    pub certificate_der: Vec<u8>,
}

impl IssuedCredential {
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("verifying_key", &self.signing_key.verifying_key())
            .field("certificate_len", &self.certificate_der.len())
            .finish_non_exhaustive()
    }
}

/// Issue the Ed25519 keypair and self-signed certificate for a session.
pub fn issue_credential(
    ctx: &CryptoContext,
    key: &dyn DerivationKey,
    user_id: &str,
    job_id: &str,
    expiration: DateTime<Utc>,
) -> Result<IssuedCredential, SessionError> {
    if user_id.is_empty() {
        return Err(SessionError::missing(ISSUE_OP, SessionField::UserId));
    }
    if job_id.is_empty() {
        return Err(SessionError::missing(ISSUE_OP, SessionField::PublicId));
    }
    let crypto = |source: CryptoError| SessionError::Crypto {
        op: ISSUE_OP,
        source,
    };

    ctx.ensure_live().map_err(crypto)?;
    let signing_key = derive_signing_key(key, user_id, job_id)?;

    ctx.ensure_live().map_err(crypto)?;
    let not_before = Utc::now() - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    let certificate_der =
        self_signed_certificate(&signing_key, job_id, not_before, expiration).map_err(crypto)?;

    Ok(IssuedCredential {
        signing_key,
        certificate_der,
    })
}

/// Deterministic per-session signing key. Same inputs, same key.
pub fn derive_signing_key(
    key: &dyn DerivationKey,
    user_id: &str,
    job_id: &str,
) -> Result<SigningKey, SessionError> {
    if user_id.is_empty() {
        return Err(SessionError::missing(DERIVE_OP, SessionField::UserId));
    }
    if job_id.is_empty() {
        return Err(SessionError::missing(DERIVE_OP, SessionField::PublicId));
    }

    let mut seed = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
    key.derive(user_id.as_bytes(), job_id.as_bytes(), &mut seed[..])
        .map_err(|source| SessionError::Crypto {
            op: DERIVE_OP,
            source,
        })?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Public half of [`derive_signing_key`]; what a worker checks the certificate against.
pub fn derive_verifying_key(
    key: &dyn DerivationKey,
    user_id: &str,
    job_id: &str,
) -> Result<VerifyingKey, SessionError> {
    derive_signing_key(key, user_id, job_id).map(|signing_key| signing_key.verifying_key())
}

fn self_signed_certificate(
    signing_key: &SigningKey,
    job_id: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<Vec<u8>, CryptoError> {
    let cert_err = |e: rcgen::Error| CryptoError::Certificate(e.to_string());

    let pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let key_pair = KeyPair::from_pem(&pem).map_err(cert_err)?;

    let mut params = CertificateParams::new(vec![job_id.to_string()]).map_err(cert_err)?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, job_id);
    params.distinguished_name = distinguished_name;
    params.serial_number = Some(SerialNumber::from_slice(&random_serial()?.to_be_bytes()));
    params.not_before = to_offset_date_time(not_before)?;
    params.not_after = to_offset_date_time(not_after)?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyAgreement,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let certificate = params.self_signed(&key_pair).map_err(cert_err)?;
    Ok(certificate.der().to_vec())
}

/// Positive 63-bit serial. Uniqueness, not unpredictability, is what matters here.
fn random_serial() -> Result<u64, CryptoError> {
    let mut rng =
        SmallRng::from_rng(rand::thread_rng()).map_err(|e| CryptoError::Entropy(e.to_string()))?;
    Ok((rng.gen::<u64>() >> 1).max(1))
}

fn to_offset_date_time(t: DateTime<Utc>) -> Result<OffsetDateTime, CryptoError> {
    OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| CryptoError::Certificate(format!("timestamp out of range: {e}")))
}
