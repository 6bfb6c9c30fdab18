// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Session Application Service
//!
//! Orchestrates the session write path coordinating:
//! - Domain layer: Session aggregate, LifecyclePolicy, PublicIdAllocator
//! - Infrastructure layer: credential issuer, envelope encryption, SessionRepository
//!
//! Every cipher call runs under a [`CryptoContext`]. Callers that have their
//! own request scope pass it in; otherwise [`SessionService::context`] gives
//! one bounded by `spec.crypto.timeout_ms`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::broker_config::BrokerConfigManifest;
use crate::domain::crypto::{CryptoContext, DerivationKey, KeyedCipher};
use crate::domain::error::SessionError;
use crate::domain::lifecycle::{LifecyclePolicy, SessionView};
use crate::domain::repository::{RepositoryError, SessionRepository};
use crate::domain::session::{
    ComposedOf, PrefixedIdAllocator, PublicIdAllocator, Session, SessionField, SessionId,
    SessionUpdate,
};
use crate::domain::vetting::WritePathValidator;
use crate::infrastructure::ciphers::{self, CipherSet};
use crate::infrastructure::credentials::{issue_credential, IssuedCredential};
use crate::infrastructure::db::Database;
use crate::infrastructure::encryption::{decrypt_session, encrypt_session};
use crate::infrastructure::telemetry;
use crate::application::repository_factory::create_session_repository;

const TOFU_OP: &str = "trust on first use";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} has expired")]
    Expired(SessionId),

    #[error("session {0}: presented tofu token does not match")]
    TofuMismatch(SessionId),
}

impl ServiceError {
    /// A concurrent writer won; re-read and try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Repository(err) if err.is_conflict())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Session(err) => err.is_retryable(),
            Self::Repository(RepositoryError::Vet(err)) => err.is_retryable(),
            other => other.is_conflict(),
        }
    }
}

/// A persisted session plus the credential issued for it.
///
/// The signing key exists only here; storage holds the certificate alone.
#[derive(Debug)]
pub struct CreatedSession {
    pub session: Session,
    pub credential: IssuedCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofuOutcome {
    /// No token was stored; the presented one is now trusted.
    FirstUse,
    /// The presented token equals the stored one.
    Matched,
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait SessionService: Send + Sync {
    /// Compose, credential, encrypt and persist a new session
    async fn create_session(
        &self,
        ctx: &CryptoContext,
        composed: ComposedOf,
    ) -> Result<CreatedSession, ServiceError>;

    /// Load a session with its secret fields decrypted
    async fn get_session(&self, ctx: &CryptoContext, id: &SessionId) -> Result<Session, ServiceError>;

    /// Session joined with its latest state
    async fn get_view(&self, id: &SessionId) -> Result<SessionView, ServiceError>;

    /// Record the worker proxying the session and mark it active
    async fn assign_worker(
        &self,
        id: &SessionId,
        server_id: &str,
        server_type: &str,
    ) -> Result<Session, ServiceError>;

    /// Store the first presented token, compare every later one against it
    async fn trust_on_first_use(
        &self,
        ctx: &CryptoContext,
        id: &SessionId,
        presented: &[u8],
    ) -> Result<TofuOutcome, ServiceError>;

    /// Close the session with a policy-approved reason
    async fn terminate(&self, id: &SessionId, reason: &str) -> Result<SessionView, ServiceError>;

    /// Fresh context bounded by the configured crypto timeout
    fn context(&self) -> CryptoContext;
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct StandardSessionService {
    repository: Arc<dyn SessionRepository>,
    cipher: Arc<dyn KeyedCipher>,
    derivation: Arc<dyn DerivationKey>,
    ids: Arc<dyn PublicIdAllocator>,
    policy: Arc<LifecyclePolicy>,
    crypto_timeout: Duration,
}

impl StandardSessionService {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        ciphers: CipherSet,
        ids: Arc<dyn PublicIdAllocator>,
        policy: Arc<LifecyclePolicy>,
        crypto_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            cipher: ciphers.cipher,
            derivation: ciphers.derivation,
            ids,
            policy,
            crypto_timeout,
        }
    }

    /// Wire the service from a loaded manifest. `database` selects Postgres storage.
    pub fn from_config(
        config: &BrokerConfigManifest,
        database: Option<&Database>,
    ) -> anyhow::Result<Self> {
        let policy = Arc::new(config.lifecycle_policy()?);
        let repository = create_session_repository(database, WritePathValidator::new(policy.clone()));
        let ciphers = ciphers::from_config(&config.spec.encryption)?;

        info!(
            controller = %config.metadata.name,
            key_id = %ciphers.cipher.key_id(),
            "Session service configured"
        );

        Ok(Self::new(
            repository,
            ciphers,
            Arc::new(PrefixedIdAllocator::default()),
            policy,
            config.spec.crypto.timeout(),
        ))
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    async fn load(&self, id: &SessionId) -> Result<Session, ServiceError> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    /// Closed and expired sessions accept no worker or token.
    fn ensure_open(session: &Session) -> Result<(), ServiceError> {
        if session.is_closed() {
            return Err(SessionError::SessionClosed(session.public_id.clone()).into());
        }
        if session.is_expired_at(Utc::now()) {
            return Err(ServiceError::Expired(session.public_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionService for StandardSessionService {
    async fn create_session(
        &self,
        ctx: &CryptoContext,
        composed: ComposedOf,
    ) -> Result<CreatedSession, ServiceError> {
        let mut session = Session::new(composed)?;
        session.public_id = self.ids.allocate();

        let credential = issue_credential(
            ctx,
            self.derivation.as_ref(),
            &session.user_id,
            session.public_id.as_str(),
            session.expiration_time,
        )?;
        session.certificate = credential.certificate_der.clone();

        encrypt_session(ctx, self.cipher.as_ref(), &mut session).await?;
        let stored = self.repository.create(&session).await?;

        telemetry::record_session_created();
        info!(
            public_id = %stored.public_id,
            user_id = %stored.user_id,
            target_id = %stored.target_id,
            expiration_time = %stored.expiration_time,
            "Session created"
        );

        Ok(CreatedSession {
            session: stored,
            credential,
        })
    }

    async fn get_session(&self, ctx: &CryptoContext, id: &SessionId) -> Result<Session, ServiceError> {
        let mut session = self.load(id).await?;
        decrypt_session(ctx, self.cipher.as_ref(), &mut session).await?;
        Ok(session)
    }

    async fn get_view(&self, id: &SessionId) -> Result<SessionView, ServiceError> {
        self.repository
            .find_view(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.clone()))
    }

    async fn assign_worker(
        &self,
        id: &SessionId,
        server_id: &str,
        server_type: &str,
    ) -> Result<Session, ServiceError> {
        let current = self.load(id).await?;
        Self::ensure_open(&current)?;

        let update = SessionUpdate::new(id.clone(), current.version).assign_worker(server_id, server_type);
        let assigned = self
            .repository
            .transition(&update, self.policy.active_status())
            .await?;

        info!(public_id = %id, server_id, server_type, "Worker assigned to session");
        Ok(assigned)
    }

    async fn trust_on_first_use(
        &self,
        ctx: &CryptoContext,
        id: &SessionId,
        presented: &[u8],
    ) -> Result<TofuOutcome, ServiceError> {
        if presented.is_empty() {
            return Err(SessionError::missing(TOFU_OP, SessionField::TofuToken).into());
        }

        let mut session = self.load(id).await?;
        Self::ensure_open(&session)?;

        if session.ct_tofu_token().is_some() {
            decrypt_session(ctx, self.cipher.as_ref(), &mut session).await?;
            let matched: bool = session
                .tofu_token()
                .is_some_and(|stored| bool::from(stored.ct_eq(presented)));
            session.clear_tofu_token();

            if !matched {
                warn!(public_id = %id, "Presented tofu token does not match the stored token");
                return Err(ServiceError::TofuMismatch(id.clone()));
            }
            debug!(public_id = %id, "Tofu token matched");
            return Ok(TofuOutcome::Matched);
        }

        session.set_tofu_token(presented.to_vec());
        let update = match encrypt_session(ctx, self.cipher.as_ref(), &mut session).await {
            Ok(()) => SessionUpdate::new(id.clone(), session.version).seal_tofu_token(&session),
            Err(err) => Err(err),
        };
        session.clear_tofu_token();
        self.repository.update(&update?).await?;

        info!(public_id = %id, key_id = %session.key_id, "Tofu token recorded on first use");
        Ok(TofuOutcome::FirstUse)
    }

    async fn terminate(&self, id: &SessionId, reason: &str) -> Result<SessionView, ServiceError> {
        let reason = self.policy.termination_reason(reason)?;
        let current = self.load(id).await?;
        if current.is_closed() {
            return Err(SessionError::SessionClosed(id.clone()).into());
        }

        let update = SessionUpdate::new(id.clone(), current.version).terminate(reason.clone());
        let closed = self
            .repository
            .transition(&update, self.policy.terminal_status())
            .await?;

        info!(public_id = %id, reason = %reason, "Session terminated");
        Ok(SessionView::project(&closed, closed.states()))
    }

    fn context(&self) -> CryptoContext {
        CryptoContext::with_timeout(self.crypto_timeout)
    }
}
