// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Session Lifecycle
//!
//! Status history is a list of append-only [`State`] rows rather than a
//! mutable field, so every transition stays auditable. The current phase is
//! derived, never stored twice.
//!
//! The vocabulary (status names, legal termination reasons) belongs to the
//! deployment and arrives through configuration as a [`LifecyclePolicy`].
//! Nothing here assumes a particular set of names beyond the three roles the
//! policy must fill: initial, active and terminal.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::broker_config::LifecycleConfig;
use crate::domain::error::SessionError;
use crate::domain::session::{Session, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionStatus(String);

impl SessionStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a session ended. Legality is decided by [`LifecyclePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminationReason(String);

impl TerminationReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("lifecycle policy declares no statuses")]
    NoStatuses,

    #[error("lifecycle policy declares no termination reasons")]
    NoTerminationReasons,

    #[error("{role} status '{status}' is not among the declared statuses")]
    UndeclaredStatus { role: &'static str, status: String },
}

/// Closed vocabulary of statuses and termination reasons for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    statuses: BTreeSet<String>,
    termination_reasons: BTreeSet<String>,
    initial: SessionStatus,
    active: SessionStatus,
    terminal: SessionStatus,
}

impl LifecyclePolicy {
    pub fn from_config(config: &LifecycleConfig) -> Result<Self, PolicyError> {
        let statuses: BTreeSet<String> = config.statuses.iter().cloned().collect();
        let termination_reasons: BTreeSet<String> =
            config.termination_reasons.iter().cloned().collect();

        if statuses.is_empty() {
            return Err(PolicyError::NoStatuses);
        }
        if termination_reasons.is_empty() {
            return Err(PolicyError::NoTerminationReasons);
        }
        for (role, status) in [
            ("initial", &config.initial_status),
            ("active", &config.active_status),
            ("terminal", &config.terminal_status),
        ] {
            if !statuses.contains(status) {
                return Err(PolicyError::UndeclaredStatus {
                    role,
                    status: status.clone(),
                });
            }
        }

        Ok(Self {
            statuses,
            termination_reasons,
            initial: SessionStatus::new(&config.initial_status),
            active: SessionStatus::new(&config.active_status),
            terminal: SessionStatus::new(&config.terminal_status),
        })
    }

    pub fn initial_status(&self) -> &SessionStatus {
        &self.initial
    }

    pub fn active_status(&self) -> &SessionStatus {
        &self.active
    }

    pub fn terminal_status(&self) -> &SessionStatus {
        &self.terminal
    }

    pub fn is_known_status(&self, status: &SessionStatus) -> bool {
        self.statuses.contains(status.as_str())
    }

    pub fn is_legal_termination_reason(&self, reason: &str) -> bool {
        self.termination_reasons.contains(reason)
    }

    pub fn status(&self, raw: &str) -> Result<SessionStatus, SessionError> {
        let status = SessionStatus::new(raw);
        if !self.is_known_status(&status) {
            return Err(SessionError::InvalidStatus {
                op: "parse status",
                status: raw.to_string(),
            });
        }
        Ok(status)
    }

    pub fn termination_reason(&self, raw: &str) -> Result<TerminationReason, SessionError> {
        if !self.is_legal_termination_reason(raw) {
            return Err(SessionError::InvalidTerminationReason {
                op: "parse termination reason",
                reason: raw.to_string(),
            });
        }
        Ok(TerminationReason::new(raw))
    }

    /// Decide whether `next` may be appended to a session's history.
    ///
    /// A terminated session accepts exactly one more row, the terminal
    /// status, and nothing after it.
    pub fn vet_transition(
        &self,
        session_id: &SessionId,
        terminated: bool,
        current: Option<&State>,
        next: &SessionStatus,
    ) -> Result<(), SessionError> {
        if !self.is_known_status(next) {
            return Err(SessionError::InvalidStatus {
                op: "append session state",
                status: next.to_string(),
            });
        }
        if current.is_some_and(|state| state.status == self.terminal) {
            return Err(SessionError::SessionClosed(session_id.clone()));
        }
        if terminated && *next != self.terminal {
            return Err(SessionError::SessionClosed(session_id.clone()));
        }
        Ok(())
    }
}

/// One row of a session's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub previous_end_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl State {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Latest-starting state that has not ended.
pub fn current_state(states: &[State]) -> Option<&State> {
    states
        .iter()
        .filter(|state| state.is_open())
        .max_by_key(|state| state.start_time)
}

/// Latest-starting state regardless of whether it ended.
pub fn latest_state(states: &[State]) -> Option<&State> {
    states.iter().max_by_key(|state| state.start_time)
}

/// Close the open row (if any) and append a new one starting at `now`.
///
/// Start times are kept strictly increasing even when two appends land in
/// the same clock tick.
pub fn push_state(
    states: &mut Vec<State>,
    session_id: &SessionId,
    status: SessionStatus,
    now: DateTime<Utc>,
) -> State {
    let start_time = match latest_state(states) {
        Some(latest) if latest.start_time >= now => latest.start_time + Duration::microseconds(1),
        _ => now,
    };

    let mut previous_end_time = None;
    for state in states.iter_mut().filter(|state| state.is_open()) {
        state.end_time = Some(start_time);
        previous_end_time = Some(start_time);
    }

    let state = State {
        session_id: session_id.clone(),
        status,
        previous_end_time,
        start_time,
        end_time: None,
    };
    states.push(state.clone());
    state
}

/// Read projection of a session joined with its latest state row.
///
/// Never carries the TOFU plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub public_id: SessionId,
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
    pub ct_tofu_token: Option<Vec<u8>>,
    pub termination_reason: Option<TerminationReason>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub version: u32,
    #[serde(skip)]
    pub endpoint: String,
    pub connection_limit: i32,
    pub key_id: String,

    pub status: Option<SessionStatus>,
    pub previous_end_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SessionView {
    pub fn project(session: &Session, states: &[State]) -> Self {
        let latest = latest_state(states);
        Self {
            public_id: session.public_id.clone(),
            user_id: session.user_id.clone(),
            host_id: session.host_id.clone(),
            server_id: session.server_id.clone(),
            server_type: session.server_type.clone(),
            target_id: session.target_id.clone(),
            host_set_id: session.host_set_id.clone(),
            auth_token_id: session.auth_token_id.clone(),
            scope_id: session.scope_id.clone(),
            certificate: session.certificate.clone(),
            expiration_time: session.expiration_time,
            ct_tofu_token: session.ct_tofu_token().map(<[u8]>::to_vec),
            termination_reason: session.termination_reason.clone(),
            create_time: session.create_time,
            update_time: session.update_time,
            version: session.version,
            endpoint: session.endpoint.clone(),
            connection_limit: session.connection_limit,
            key_id: session.key_id.clone(),
            status: latest.map(|state| state.status.clone()),
            previous_end_time: latest.and_then(|state| state.previous_end_time),
            start_time: latest.map(|state| state.start_time),
            end_time: latest.and_then(|state| state.end_time),
        }
    }

    pub fn is_terminated(&self, policy: &LifecyclePolicy) -> bool {
        self.status.as_ref() == Some(policy.terminal_status())
    }
}
