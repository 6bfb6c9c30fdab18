// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Session Aggregate
//!
//! A [`Session`] is a time-boxed grant for one user to reach one target
//! through a worker. It is built from a [`ComposedOf`] value, receives its
//! [`SessionId`] from a [`PublicIdAllocator`], gets a certificate from the
//! credential issuer and is then handed to a
//! [`crate::domain::repository::SessionRepository`].
//!
//! ## Session Lifecycle
//!
//! ```text
//! Session::new(composed)                 ← construction invariants
//!   └─ public_id = allocator.allocate()
//!   └─ certificate = issue_credential(..) ← infrastructure::credentials
//!   └─ repository.create(&session)       ← vet_create, version = 1, initial state row
//!         └─ repository.update(&SessionUpdate) ← vet_update, version + 1
//!         └─ repository.append_state(..)       ← append-only status history
//! ```
//!
//! ## Invariants
//!
//! - Identity fields (user, host, target, host set, auth token, scope,
//!   endpoint, expiration) are non-empty for every persisted session.
//! - `server_id`, `server_type`, `termination_reason` and both halves of the
//!   TOFU token are empty at construction.
//! - The TOFU plaintext is never part of a [`SessionRecord`]; only the
//!   ciphertext and the `key_id` that produced it are.
//! - Mutations after creation go through [`SessionUpdate`], which can only
//!   express the whitelisted fields.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::domain::error::SessionError;
use crate::domain::lifecycle::{self, State, TerminationReason};

const NEW_SESSION_OP: &str = "new session";

/// Public identifier of a session, assigned before the first persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supplies public ids for new sessions.
pub trait PublicIdAllocator: Send + Sync {
    fn allocate(&self) -> SessionId;
}

/// `<prefix>_<10 alphanumerics>`, e.g. `s_Xk29fPq0Lm`.
#[derive(Debug, Clone)]
pub struct PrefixedIdAllocator {
    prefix: String,
}

impl PrefixedIdAllocator {
    pub const DEFAULT_PREFIX: &'static str = "s";
    const SUFFIX_LEN: usize = 10;

    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for PrefixedIdAllocator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

impl PublicIdAllocator for PrefixedIdAllocator {
    fn allocate(&self) -> SessionId {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::SUFFIX_LEN)
            .map(char::from)
            .collect();
        SessionId(format!("{}_{}", self.prefix, suffix))
    }
}

/// Every attribute of a session, as named in update masks and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionField {
    PublicId,
    UserId,
    HostId,
    TargetId,
    HostSetId,
    AuthTokenId,
    ScopeId,
    ServerId,
    ServerType,
    Certificate,
    ExpirationTime,
    CtTofuToken,
    TofuToken,
    TerminationReason,
    CreateTime,
    UpdateTime,
    Version,
    Endpoint,
    ConnectionLimit,
    KeyId,
}

impl SessionField {
    pub const ALL: [SessionField; 20] = [
        Self::PublicId,
        Self::UserId,
        Self::HostId,
        Self::TargetId,
        Self::HostSetId,
        Self::AuthTokenId,
        Self::ScopeId,
        Self::ServerId,
        Self::ServerType,
        Self::Certificate,
        Self::ExpirationTime,
        Self::CtTofuToken,
        Self::TofuToken,
        Self::TerminationReason,
        Self::CreateTime,
        Self::UpdateTime,
        Self::Version,
        Self::Endpoint,
        Self::ConnectionLimit,
        Self::KeyId,
    ];

    /// Fields fixed once the session has been created.
    pub fn is_immutable(self) -> bool {
        matches!(
            self,
            Self::PublicId
                | Self::UserId
                | Self::HostId
                | Self::TargetId
                | Self::HostSetId
                | Self::AuthTokenId
                | Self::Certificate
                | Self::CreateTime
                | Self::UpdateTime
                | Self::Endpoint
                | Self::ExpirationTime
                | Self::ConnectionLimit
        )
    }

    /// Field-mask path spelling, e.g. `HostSetId`.
    pub fn mask_path(self) -> &'static str {
        match self {
            Self::PublicId => "PublicId",
            Self::UserId => "UserId",
            Self::HostId => "HostId",
            Self::TargetId => "TargetId",
            Self::HostSetId => "HostSetId",
            Self::AuthTokenId => "AuthTokenId",
            Self::ScopeId => "ScopeId",
            Self::ServerId => "ServerId",
            Self::ServerType => "ServerType",
            Self::Certificate => "Certificate",
            Self::ExpirationTime => "ExpirationTime",
            Self::CtTofuToken => "CtTofuToken",
            Self::TofuToken => "TofuToken",
            Self::TerminationReason => "TerminationReason",
            Self::CreateTime => "CreateTime",
            Self::UpdateTime => "UpdateTime",
            Self::Version => "Version",
            Self::Endpoint => "Endpoint",
            Self::ConnectionLimit => "ConnectionLimit",
            Self::KeyId => "KeyId",
        }
    }

    /// Column spelling, e.g. `host_set_id`.
    pub fn column(self) -> &'static str {
        match self {
            Self::PublicId => "public_id",
            Self::UserId => "user_id",
            Self::HostId => "host_id",
            Self::TargetId => "target_id",
            Self::HostSetId => "host_set_id",
            Self::AuthTokenId => "auth_token_id",
            Self::ScopeId => "scope_id",
            Self::ServerId => "server_id",
            Self::ServerType => "server_type",
            Self::Certificate => "certificate",
            Self::ExpirationTime => "expiration_time",
            Self::CtTofuToken => "ct_tofu_token",
            Self::TofuToken => "tofu_token",
            Self::TerminationReason => "termination_reason",
            Self::CreateTime => "create_time",
            Self::UpdateTime => "update_time",
            Self::Version => "version",
            Self::Endpoint => "endpoint",
            Self::ConnectionLimit => "connection_limit",
            Self::KeyId => "key_id",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::PublicId => "public id",
            Self::UserId => "user id",
            Self::HostId => "host id",
            Self::TargetId => "target id",
            Self::HostSetId => "host set id",
            Self::AuthTokenId => "auth token id",
            Self::ScopeId => "scope id",
            Self::ServerId => "server id",
            Self::ServerType => "server type",
            Self::Certificate => "certificate",
            Self::ExpirationTime => "expiration time",
            Self::CtTofuToken => "tofu token ciphertext",
            Self::TofuToken => "tofu token",
            Self::TerminationReason => "termination reason",
            Self::CreateTime => "create time",
            Self::UpdateTime => "update time",
            Self::Version => "version",
            Self::Endpoint => "endpoint",
            Self::ConnectionLimit => "connection limit",
            Self::KeyId => "key id",
        }
    }
}

impl fmt::Display for SessionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown session field '{0}'")]
pub struct UnknownSessionField(pub String);

/// Parses mask paths (`HostSetId`) or column names (`host_set_id`),
/// ignoring ASCII case.
impl FromStr for SessionField {
    type Err = UnknownSessionField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|field| {
                field.mask_path().eq_ignore_ascii_case(s) || field.column().eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| UnknownSessionField(s.to_string()))
    }
}

/// Parameters a caller supplies to compose a new session. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedOf {
    pub user_id: String,
    pub host_id: String,
    pub target_id: String,
    pub host_set_id: String,
    pub auth_token_id: String,
    pub scope_id: String,
    /// Resolved by the target and round-tripped to the worker; never re-resolved here.
    pub endpoint: String,
    pub expiration_time: Option<DateTime<Utc>>,
    pub connection_limit: i32,
}

/// Aggregate root for a user's session with a target.
///
/// `Clone` is a deep value copy: the certificate, both halves of the TOFU
/// token, the state history and every timestamp are owned by the clone.
/// Clone before handing a session to another task; a single instance must
/// not be mutated from two places at once.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub public_id: SessionId,
    pub user_id: String,
    pub host_id: String,
    /// Worker that proxies the session; set after creation.
    pub server_id: Option<String>,
    pub server_type: Option<String>,
    pub target_id: String,
    pub host_set_id: String,
    pub auth_token_id: String,
    pub scope_id: String,
    /// Raw DER. The matching private key is never stored.
    pub certificate: Vec<u8>,
    pub expiration_time: DateTime<Utc>,
    pub termination_reason: Option<TerminationReason>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub version: u32,
    pub endpoint: String,
    pub connection_limit: i32,
    /// Key version that produced `ct_tofu_token`.
    pub key_id: String,
    tofu_token: Option<Zeroizing<Vec<u8>>>,
    ct_tofu_token: Option<Vec<u8>>,
    states: Vec<State>,
}

/// One plaintext/ciphertext pair handled by the envelope encryption adapter.
pub struct SecretField<'a> {
    pub name: SessionField,
    pub plaintext: &'a mut Option<Zeroizing<Vec<u8>>>,
    pub ciphertext: &'a mut Option<Vec<u8>>,
}

impl Session {
    /// Build an unpersisted session. The public id is left empty for the allocator.
    pub fn new(composed: ComposedOf) -> Result<Self, SessionError> {
        let session = Self {
            public_id: SessionId::default(),
            user_id: composed.user_id,
            host_id: composed.host_id,
            server_id: None,
            server_type: None,
            target_id: composed.target_id,
            host_set_id: composed.host_set_id,
            auth_token_id: composed.auth_token_id,
            scope_id: composed.scope_id,
            certificate: Vec::new(),
            expiration_time: composed.expiration_time.unwrap_or_default(),
            termination_reason: None,
            create_time: None,
            update_time: None,
            version: 0,
            endpoint: composed.endpoint,
            connection_limit: composed.connection_limit,
            key_id: String::new(),
            tofu_token: None,
            ct_tofu_token: None,
            states: Vec::new(),
        };
        session.validate_new_session(NEW_SESSION_OP)?;
        Ok(session)
    }

    /// Checks every construction invariant except the public id.
    pub(crate) fn validate_new_session(&self, op: &'static str) -> Result<(), SessionError> {
        let required = [
            (SessionField::UserId, self.user_id.is_empty()),
            (SessionField::HostId, self.host_id.is_empty()),
            (SessionField::TargetId, self.target_id.is_empty()),
            (SessionField::HostSetId, self.host_set_id.is_empty()),
            (SessionField::AuthTokenId, self.auth_token_id.is_empty()),
            (SessionField::ScopeId, self.scope_id.is_empty()),
            (SessionField::Endpoint, self.endpoint.is_empty()),
            (SessionField::ExpirationTime, is_unset(&self.expiration_time)),
        ];
        if let Some((field, _)) = required.into_iter().find(|(_, missing)| *missing) {
            return Err(SessionError::missing(op, field));
        }

        let must_be_empty = [
            (SessionField::TerminationReason, self.termination_reason.is_some()),
            (SessionField::ServerId, has_value(&self.server_id)),
            (SessionField::ServerType, has_value(&self.server_type)),
            (SessionField::TofuToken, self.tofu_token.is_some()),
            (SessionField::CtTofuToken, self.ct_tofu_token.is_some()),
        ];
        if let Some((field, _)) = must_be_empty.into_iter().find(|(_, set)| *set) {
            return Err(SessionError::must_be_empty(op, field));
        }
        Ok(())
    }

    pub fn tofu_token(&self) -> Option<&[u8]> {
        self.tofu_token.as_deref().map(Vec::as_slice)
    }

    pub fn set_tofu_token(&mut self, token: Vec<u8>) {
        self.tofu_token = Some(Zeroizing::new(token));
    }

    pub fn clear_tofu_token(&mut self) {
        self.tofu_token = None;
    }

    pub fn ct_tofu_token(&self) -> Option<&[u8]> {
        self.ct_tofu_token.as_deref()
    }

    /// Secret/ciphertext pairs, in a fixed order.
    pub fn secret_fields_mut(&mut self) -> [SecretField<'_>; 1] {
        [SecretField {
            name: SessionField::TofuToken,
            plaintext: &mut self.tofu_token,
            ciphertext: &mut self.ct_tofu_token,
        }]
    }

    /// State history ordered by start time.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn attach_states(&mut self, mut states: Vec<State>) {
        states.sort_by_key(|state| state.start_time);
        self.states = states;
    }

    /// The state with the latest start time that has not ended.
    pub fn current_state(&self) -> Option<&State> {
        lifecycle::current_state(&self.states)
    }

    pub fn is_closed(&self) -> bool {
        self.termination_reason.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration_time
    }

    /// Persistable shape: ciphertext only, no state history.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            public_id: self.public_id.as_str().to_string(),
            user_id: self.user_id.clone(),
            host_id: self.host_id.clone(),
            server_id: self.server_id.clone(),
            server_type: self.server_type.clone(),
            target_id: self.target_id.clone(),
            host_set_id: self.host_set_id.clone(),
            auth_token_id: self.auth_token_id.clone(),
            scope_id: self.scope_id.clone(),
            certificate: self.certificate.clone(),
            expiration_time: self.expiration_time,
            create_time: self.create_time,
            update_time: self.update_time,
            tofu_token: self.ct_tofu_token.clone(),
            termination_reason: self
                .termination_reason
                .as_ref()
                .map(|reason| reason.as_str().to_string()),
            version: self.version,
            endpoint: self.endpoint.clone(),
            connection_limit: self.connection_limit,
            key_id: self.key_id.clone(),
        }
    }

    /// Rehydrate from storage. The plaintext token is always absent.
    pub fn from_record(record: SessionRecord) -> Self {
        Self {
            public_id: SessionId(record.public_id),
            user_id: record.user_id,
            host_id: record.host_id,
            server_id: record.server_id,
            server_type: record.server_type,
            target_id: record.target_id,
            host_set_id: record.host_set_id,
            auth_token_id: record.auth_token_id,
            scope_id: record.scope_id,
            certificate: record.certificate,
            expiration_time: record.expiration_time,
            termination_reason: record.termination_reason.map(TerminationReason::new),
            create_time: record.create_time,
            update_time: record.update_time,
            version: record.version,
            endpoint: record.endpoint,
            connection_limit: record.connection_limit,
            key_id: record.key_id,
            tofu_token: None,
            ct_tofu_token: record.tofu_token,
            states: Vec::new(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("public_id", &self.public_id)
            .field("user_id", &self.user_id)
            .field("host_id", &self.host_id)
            .field("server_id", &self.server_id)
            .field("server_type", &self.server_type)
            .field("target_id", &self.target_id)
            .field("host_set_id", &self.host_set_id)
            .field("auth_token_id", &self.auth_token_id)
            .field("scope_id", &self.scope_id)
            .field("certificate_len", &self.certificate.len())
            .field("expiration_time", &self.expiration_time)
            .field("termination_reason", &self.termination_reason)
            .field("create_time", &self.create_time)
            .field("update_time", &self.update_time)
            .field("version", &self.version)
            .field("endpoint", &self.endpoint)
            .field("connection_limit", &self.connection_limit)
            .field("key_id", &self.key_id)
            .field("tofu_token", &self.tofu_token.as_ref().map(|_| "<redacted>"))
            .field("ct_tofu_token_len", &self.ct_tofu_token.as_ref().map(Vec::len))
            .field("states", &self.states)
            .finish()
    }
}

/// Row shape of the `session` table. `tofu_token` holds ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub public_id: String,
    pub user_id: String,
    pub host_id: String,
    pub server_id: Option<String>,
    pub server_type: Option<String>,
    pub target_id: String,
    pub host_set_id: String,
    pub auth_token_id: String,
    pub scope_id: String,
    pub certificate: Vec<u8>,
    pub expiration_time: DateTime<Utc>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub tofu_token: Option<Vec<u8>>,
    pub termination_reason: Option<String>,
    pub version: u32,
    pub endpoint: String,
    pub connection_limit: i32,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    pub server_id: String,
    pub server_type: String,
}

/// Ciphertext plus the key version that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
}

/// Update command carrying only the fields a persisted session may change.
///
/// Storage rejects the command if `expected_version` is stale. The version
/// bump itself is done by storage, never by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub public_id: SessionId,
    pub expected_version: u32,
    worker: Option<WorkerAssignment>,
    termination_reason: Option<TerminationReason>,
    tofu_token: Option<SealedSecret>,
}

impl SessionUpdate {
    pub fn new(public_id: SessionId, expected_version: u32) -> Self {
        Self {
            public_id,
            expected_version,
            worker: None,
            termination_reason: None,
            tofu_token: None,
        }
    }

    pub fn assign_worker(mut self, server_id: impl Into<String>, server_type: impl Into<String>) -> Self {
        self.worker = Some(WorkerAssignment {
            server_id: server_id.into(),
            server_type: server_type.into(),
        });
        self
    }

    pub fn terminate(mut self, reason: TerminationReason) -> Self {
        self.termination_reason = Some(reason);
        self
    }

    /// Take the TOFU ciphertext and key id from an already encrypted session.
    pub fn seal_tofu_token(mut self, session: &Session) -> Result<Self, SessionError> {
        const OP: &str = "seal tofu token";
        let ciphertext = session
            .ct_tofu_token()
            .ok_or_else(|| SessionError::missing(OP, SessionField::CtTofuToken))?;
        if session.key_id.is_empty() {
            return Err(SessionError::missing(OP, SessionField::KeyId));
        }
        self.tofu_token = Some(SealedSecret {
            ciphertext: ciphertext.to_vec(),
            key_id: session.key_id.clone(),
        });
        Ok(self)
    }

    pub fn worker(&self) -> Option<&WorkerAssignment> {
        self.worker.as_ref()
    }

    pub fn termination_reason(&self) -> Option<&TerminationReason> {
        self.termination_reason.as_ref()
    }

    pub fn sealed_tofu_token(&self) -> Option<&SealedSecret> {
        self.tofu_token.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.worker.is_none() && self.termination_reason.is_none() && self.tofu_token.is_none()
    }

    /// The field mask this command writes, including the version bump.
    pub fn changed_fields(&self) -> Vec<SessionField> {
        let mut fields = Vec::with_capacity(6);
        if self.worker.is_some() {
            fields.extend([SessionField::ServerId, SessionField::ServerType]);
        }
        if self.termination_reason.is_some() {
            fields.push(SessionField::TerminationReason);
        }
        if self.tofu_token.is_some() {
            fields.extend([SessionField::CtTofuToken, SessionField::KeyId]);
        }
        fields.push(SessionField::Version);
        fields
    }

    /// Write the command's fields onto `session`. Version and timestamps are left alone.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(worker) = &self.worker {
            session.server_id = Some(worker.server_id.clone());
            session.server_type = Some(worker.server_type.clone());
        }
        if let Some(reason) = &self.termination_reason {
            session.termination_reason = Some(reason.clone());
        }
        if let Some(sealed) = &self.tofu_token {
            session.ct_tofu_token = Some(sealed.ciphertext.clone());
            session.key_id = sealed.key_id.clone();
        }
    }
}

fn is_unset(t: &DateTime<Utc>) -> bool {
    *t == DateTime::<Utc>::default()
}

fn has_value(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_new_session_satisfies_construction_invariants() {
        let session = Session::new(composed()).unwrap();
        assert!(session.public_id.is_empty());
        assert_eq!(session.user_id, "u_1234567890");
        assert_eq!(session.endpoint, "tcp://10.0.0.7:22");
        assert_eq!(session.connection_limit, 4);
        assert!(session.server_id.is_none());
        assert!(session.server_type.is_none());
        assert!(session.termination_reason.is_none());
        assert!(session.tofu_token().is_none());
        assert!(session.ct_tofu_token().is_none());
        assert!(session.states().is_empty());
    }

    #[test]
    fn test_new_session_rejects_each_missing_field() {
        let cases: Vec<(SessionField, fn(&mut ComposedOf))> = vec![
            (SessionField::UserId, |c| c.user_id.clear()),
            (SessionField::HostId, |c| c.host_id.clear()),
            (SessionField::TargetId, |c| c.target_id.clear()),
            (SessionField::HostSetId, |c| c.host_set_id.clear()),
            (SessionField::AuthTokenId, |c| c.auth_token_id.clear()),
            (SessionField::ScopeId, |c| c.scope_id.clear()),
            (SessionField::Endpoint, |c| c.endpoint.clear()),
            (SessionField::ExpirationTime, |c| c.expiration_time = None),
            (SessionField::ExpirationTime, |c| c.expiration_time = Some(DateTime::<Utc>::default())),
        ];

        for (expected, mutate) in cases {
            let mut composed = composed();
            mutate(&mut composed);
            match Session::new(composed) {
                Err(SessionError::InvalidParameter { field, problem, .. }) => {
                    assert_eq!(field, expected);
                    assert_eq!(problem, "is missing");
                }
                other => panic!("expected missing {expected}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_validate_rejects_lifecycle_fields_set_early() {
        let cases: Vec<(SessionField, fn(&mut Session))> = vec![
            (SessionField::TerminationReason, |s| {
                s.termination_reason = Some(TerminationReason::new("closed by user"))
            }),
            (SessionField::ServerId, |s| s.server_id = Some("w_1".into())),
            (SessionField::ServerType, |s| s.server_type = Some("worker".into())),
            (SessionField::TofuToken, |s| s.set_tofu_token(b"tofu".to_vec())),
            (SessionField::CtTofuToken, |s| s.ct_tofu_token = Some(b"ct".to_vec())),
        ];

        for (expected, mutate) in cases {
            let mut session = Session::new(composed()).unwrap();
            mutate(&mut session);
            match session.validate_new_session("test") {
                Err(SessionError::InvalidParameter { field, problem, .. }) => {
                    assert_eq!(field, expected);
                    assert_eq!(problem, "must be empty");
                }
                other => panic!("expected {expected} must be empty, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_error_message_names_field() {
        let mut composed = composed();
        composed.host_set_id.clear();
        let err = Session::new(composed).unwrap_err();
        assert_eq!(err.to_string(), "new session: host set id is missing");
    }

    #[test]
    fn test_clone_owns_independent_buffers() {
        let mut original = persistable();
        original.set_tofu_token(b"first-use".to_vec());
        original.ct_tofu_token = Some(vec![1, 2, 3]);
        original.create_time = Some(Utc::now());

        let mut clone = original.clone();
        assert_eq!(clone, original);

        clone.certificate[0] = 0xff;
        clone.set_tofu_token(b"changed".to_vec());
        clone.ct_tofu_token.as_mut().unwrap()[0] = 9;
        clone.expiration_time = clone.expiration_time + chrono::Duration::hours(1);

        assert_eq!(original.certificate[0], 0x30);
        assert_eq!(original.tofu_token(), Some(&b"first-use"[..]));
        assert_eq!(original.ct_tofu_token(), Some(&[1u8, 2, 3][..]));
        assert_ne!(original.expiration_time, clone.expiration_time);
    }

    #[test]
    fn test_debug_redacts_tofu_token() {
        let mut session = persistable();
        session.set_tofu_token(b"super-secret-token".to_vec());
        let rendered = format!("{session:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("115, 117, 112"));
    }

    #[test]
    fn test_record_never_carries_plaintext() {
        let mut session = persistable();
        session.set_tofu_token(b"plain".to_vec());
        session.ct_tofu_token = Some(b"cipher".to_vec());
        session.key_id = "sessions:v1".to_string();

        let record = session.to_record();
        assert_eq!(record.tofu_token.as_deref(), Some(&b"cipher"[..]));

        let restored = Session::from_record(record);
        assert!(restored.tofu_token().is_none());
        assert_eq!(restored.ct_tofu_token(), Some(&b"cipher"[..]));
        assert_eq!(restored.key_id, "sessions:v1");
        assert_eq!(restored.public_id, session.public_id);
    }

    #[test]
    fn test_session_field_parses_case_insensitively() {
        assert_eq!("hostsetid".parse::<SessionField>().unwrap(), SessionField::HostSetId);
        assert_eq!("HOST_SET_ID".parse::<SessionField>().unwrap(), SessionField::HostSetId);
        assert_eq!(" Version ".parse::<SessionField>().unwrap(), SessionField::Version);
        assert!("HostSet".parse::<SessionField>().is_err());
    }

    #[test]
    fn test_immutable_field_set() {
        let immutable: Vec<_> = SessionField::ALL.into_iter().filter(|f| f.is_immutable()).collect();
        assert_eq!(immutable.len(), 12);
        for field in [
            SessionField::ServerId,
            SessionField::ServerType,
            SessionField::TerminationReason,
            SessionField::TofuToken,
            SessionField::CtTofuToken,
            SessionField::KeyId,
            SessionField::Version,
        ] {
            assert!(!field.is_immutable(), "{field} should be mutable");
        }
    }

    #[test]
    fn test_update_changed_fields_and_apply() {
        let mut sealed_source = persistable();
        sealed_source.ct_tofu_token = Some(vec![7, 7, 7]);
        sealed_source.key_id = "sessions:v2".to_string();

        let update = SessionUpdate::new(SessionId::new("s_1234567890"), 3)
            .assign_worker("w_1", "worker")
            .terminate(TerminationReason::new("closed by user"))
            .seal_tofu_token(&sealed_source)
            .unwrap();

        assert_eq!(
            update.changed_fields(),
            vec![
                SessionField::ServerId,
                SessionField::ServerType,
                SessionField::TerminationReason,
                SessionField::CtTofuToken,
                SessionField::KeyId,
                SessionField::Version,
            ]
        );

        let mut target = persistable();
        update.apply_to(&mut target);
        assert_eq!(target.server_id.as_deref(), Some("w_1"));
        assert_eq!(target.server_type.as_deref(), Some("worker"));
        assert_eq!(target.termination_reason.as_ref().map(|r| r.as_str()), Some("closed by user"));
        assert_eq!(target.ct_tofu_token(), Some(&[7u8, 7, 7][..]));
        assert_eq!(target.key_id, "sessions:v2");
        assert_eq!(target.version, 0);
    }

    #[test]
    fn test_seal_requires_ciphertext() {
        let session = persistable();
        let err = SessionUpdate::new(session.public_id.clone(), 1)
            .seal_tofu_token(&session)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidParameter { field: SessionField::CtTofuToken, .. }
        ));
    }

    #[test]
    fn test_prefixed_allocator_format() {
        let allocator = PrefixedIdAllocator::default();
        let id = allocator.allocate();
        assert!(id.as_str().starts_with("s_"));
        assert_eq!(id.as_str().len(), 12);
        assert_ne!(allocator.allocate(), id);
    }
}
