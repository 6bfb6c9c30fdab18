// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Session domain errors.
//!
//! Every variant carries the operation name and the offending field or value
//! so callers can log it without a backtrace.

use thiserror::Error;

use crate::domain::crypto::CryptoError;
use crate::domain::session::{SessionField, SessionId};

#[derive(Debug, Error)]
pub enum SessionError {
    /// A required field is missing, or a field that must be empty is set.
    #[error("{op}: {field} {problem}")]
    InvalidParameter {
        op: &'static str,
        field: SessionField,
        problem: &'static str,
    },

    /// An update touched a field that is fixed after creation.
    #[error("{op}: {field} is immutable")]
    ImmutableField {
        op: &'static str,
        field: SessionField,
    },

    #[error("{op}: termination reason '{reason}' is invalid")]
    InvalidTerminationReason { op: &'static str, reason: String },

    #[error("{op}: status '{status}' is not a known lifecycle status")]
    InvalidStatus { op: &'static str, status: String },

    /// The session carries a termination reason; no further transitions apply.
    #[error("session {0} is closed")]
    SessionClosed(SessionId),

    /// Key derivation, certificate construction, or wrap/unwrap failed.
    #[error("{op}: {source}")]
    Crypto {
        op: &'static str,
        #[source]
        source: CryptoError,
    },
}

impl SessionError {
    pub(crate) fn missing(op: &'static str, field: SessionField) -> Self {
        Self::InvalidParameter {
            op,
            field,
            problem: "is missing",
        }
    }

    pub(crate) fn must_be_empty(op: &'static str, field: SessionField) -> Self {
        Self::InvalidParameter {
            op,
            field,
            problem: "must be empty",
        }
    }

    /// Stable label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::ImmutableField { .. } => "immutable_field",
            Self::InvalidTerminationReason { .. } => "invalid_termination_reason",
            Self::InvalidStatus { .. } => "invalid_status",
            Self::SessionClosed(_) => "session_closed",
            Self::Crypto { .. } => "crypto_failure",
        }
    }

    /// Only a cipher error that explicitly says so is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Crypto { source, .. } if source.is_transient())
    }
}
