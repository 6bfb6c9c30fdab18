// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Write-Path Validator
//!
//! Storage collaborators call [`WritePathValidator::vet_create`] before the
//! first persist and [`WritePathValidator::vet_update`] before every later
//! write. Both are pure: they read the session and the field mask and either
//! pass or name the first offending field.

use std::sync::Arc;

use tracing::warn;

use crate::domain::error::SessionError;
use crate::domain::lifecycle::LifecyclePolicy;
use crate::domain::session::{Session, SessionField};

const VET_CREATE_OP: &str = "vet create session";
const VET_UPDATE_OP: &str = "vet update session";

#[derive(Debug, Clone)]
pub struct WritePathValidator {
    policy: Arc<LifecyclePolicy>,
}

impl WritePathValidator {
    pub fn new(policy: Arc<LifecyclePolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// A session about to be persisted for the first time.
    pub fn vet_create(&self, session: &Session) -> Result<(), SessionError> {
        let result = self.check_create(session);
        if let Err(err) = &result {
            warn!(public_id = %session.public_id, kind = err.kind(), "create rejected: {}", err);
        }
        result
    }

    fn check_create(&self, session: &Session) -> Result<(), SessionError> {
        if session.public_id.is_empty() {
            return Err(SessionError::missing(VET_CREATE_OP, SessionField::PublicId));
        }
        session.validate_new_session(VET_CREATE_OP)?;
        if session.certificate.is_empty() {
            return Err(SessionError::missing(VET_CREATE_OP, SessionField::Certificate));
        }
        Ok(())
    }

    /// `session` is the state after the update; `changed` is the field mask.
    ///
    /// Immutable fields are reported in mask order, first one wins.
    pub fn vet_update(&self, session: &Session, changed: &[SessionField]) -> Result<(), SessionError> {
        let result = self.check_update(session, changed);
        if let Err(err) = &result {
            warn!(public_id = %session.public_id, kind = err.kind(), "update rejected: {}", err);
        }
        result
    }

    fn check_update(&self, session: &Session, changed: &[SessionField]) -> Result<(), SessionError> {
        if session.public_id.is_empty() {
            return Err(SessionError::missing(VET_UPDATE_OP, SessionField::PublicId));
        }

        if let Some(field) = changed.iter().copied().find(|field| field.is_immutable()) {
            return Err(SessionError::ImmutableField {
                op: VET_UPDATE_OP,
                field,
            });
        }

        if changed.contains(&SessionField::TerminationReason) {
            let reason = session
                .termination_reason
                .as_ref()
                .map_or("", |reason| reason.as_str());
            if !self.policy.is_legal_termination_reason(reason) {
                return Err(SessionError::InvalidTerminationReason {
                    op: VET_UPDATE_OP,
                    reason: reason.to_string(),
                });
            }
        }

        Ok(())
    }
}
