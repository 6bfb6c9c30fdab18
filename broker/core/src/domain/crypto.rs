// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Cryptographic Collaborator Contracts
//!
//! The session core never owns key material. It talks to two seams:
//!
//! | Trait | Used by | Purpose |
//! |-------|---------|---------|
//! | [`KeyedCipher`] | envelope encryption adapter | wrap / unwrap secret fields, report the key version |
//! | [`DerivationKey`] | credential issuer | deterministic per-session key derivation |
//!
//! Implementations live in `crate::infrastructure::ciphers` and
//! `crate::infrastructure::secrets_manager`.
//!
//! Every call that may leave the process runs under a [`CryptoContext`]:
//! a cancellation token plus an optional deadline. Cancellation and timeout
//! surface as [`CryptoError`] and are never retried here; retry policy
//! belongs to the caller.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("certificate construction failed: {0}")]
    Certificate(String),

    #[error("wrap failed: {0}")]
    Wrap(String),

    #[error("unwrap failed: {0}")]
    Unwrap(String),

    #[error("no key material for key version {0}")]
    UnknownKeyVersion(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The remote cipher could not be reached; the caller may retry.
    #[error("cipher backend unavailable: {0}")]
    Unavailable(String),

    #[error("cipher backend error: {0}")]
    Backend(String),

    #[error("entropy source failure: {0}")]
    Entropy(String),
}

impl CryptoError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// External keyed cipher used for field-level envelope encryption.
#[async_trait]
pub trait KeyedCipher: Send + Sync {
    /// Identifier of the key version used by the next `wrap`.
    fn key_id(&self) -> String;

    /// Identifier of the key version that produced `ciphertext`.
    ///
    /// Ciphers whose ciphertexts name their key version override this, so a
    /// rotation racing a wrap cannot mislabel the result.
    fn key_id_of(&self, _ciphertext: &[u8]) -> String {
        self.key_id()
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Secret material a credential issuer can derive session keys from.
///
/// Implementations must be deterministic: the same `(salt, info)` pair yields
/// the same output for as long as the underlying key is unchanged.
pub trait DerivationKey: Send + Sync {
    fn derive(&self, salt: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), CryptoError>;
}

/// Cancellation and deadline scope for cryptographic calls.
#[derive(Debug, Clone, Default)]
pub struct CryptoContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CryptoContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Tie this context to a caller-owned token (e.g. a request scope).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails fast if the context is already cancelled or past its deadline.
    pub fn ensure_live(&self) -> Result<(), CryptoError> {
        if self.cancellation.is_cancelled() {
            return Err(CryptoError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CryptoError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, CryptoError>
    where
        F: Future<Output = Result<T, CryptoError>>,
    {
        self.ensure_live()?;

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => Err(CryptoError::Cancelled),
                result = fut => result,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .map_err(|_| CryptoError::DeadlineExceeded)?,
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_live() {
        assert!(CryptoContext::new().ensure_live().is_ok());
    }

    #[test]
    fn test_cancelled_context_is_rejected() {
        let ctx = CryptoContext::new();
        ctx.cancellation_token().cancel();
        assert!(matches!(ctx.ensure_live(), Err(CryptoError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let ctx = CryptoContext::with_timeout(Duration::from_millis(10));
        let result: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CryptoError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = CryptoContext::new().with_cancellation(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let result: Result<(), _> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(CryptoError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_passes_through_result() {
        let ctx = CryptoContext::with_timeout(Duration::from_secs(5));
        let value = ctx.run(async { Ok::<_, CryptoError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(CryptoError::Unavailable("io".into()).is_transient());
        assert!(!CryptoError::Unwrap("tag".into()).is_transient());
        assert!(!CryptoError::DeadlineExceeded.is_transient());
    }
}
