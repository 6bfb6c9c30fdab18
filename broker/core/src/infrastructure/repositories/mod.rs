// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Session Repository Implementations
//!
//! Infrastructure implementations of
//! [`SessionRepository`](crate::domain::repository::SessionRepository).
//!
//! - **PostgresSessionRepository** - `session` / `session_state` tables
//! - **InMemorySessionRepository** - HashMap-backed storage for tests and development
//!
//! Both run the same write path ([`stage_create`], [`stage_update`],
//! [`stage_transition`]): version check, closed-session check, vetting,
//! version bump. Only the compare-and-set differs: a write guard here,
//! `WHERE version = $n` in Postgres.

pub mod postgres_session;

pub use postgres_session::PostgresSessionRepository;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::error::SessionError;
use crate::domain::lifecycle::{self, SessionStatus, SessionView, State};
use crate::domain::repository::{RepositoryError, SessionRepository};
use crate::domain::session::{Session, SessionId, SessionUpdate};
use crate::domain::vetting::WritePathValidator;
use crate::infrastructure::telemetry;

/// Vet a new session and produce the copy storage will hold.
///
/// Vetting rejects a session that still carries a plaintext TOFU token.
pub(crate) fn stage_create(
    validator: &WritePathValidator,
    session: &Session,
    now: DateTime<Utc>,
) -> Result<Session, RepositoryError> {
    validator.vet_create(session).map_err(rejected)?;

    let mut stored = session.clone();
    stored.version = 1;
    stored.create_time = Some(now);
    stored.update_time = Some(now);
    Ok(stored)
}

/// Apply `update` to the stored `current` copy and vet the result.
pub(crate) fn stage_update(
    validator: &WritePathValidator,
    current: &Session,
    update: &SessionUpdate,
    now: DateTime<Utc>,
) -> Result<Session, RepositoryError> {
    if current.version != update.expected_version {
        telemetry::record_conflict();
        return Err(RepositoryError::ConcurrencyConflict {
            public_id: update.public_id.clone(),
            expected_version: update.expected_version,
        });
    }
    if current.is_closed() {
        return Err(rejected(SessionError::SessionClosed(current.public_id.clone())));
    }

    let mut next = current.clone();
    update.apply_to(&mut next);
    validator
        .vet_update(&next, &update.changed_fields())
        .map_err(rejected)?;

    next.version += 1;
    next.update_time = Some(now);
    Ok(next)
}

/// Vet a state append against the stored session.
pub(crate) fn stage_state(
    validator: &WritePathValidator,
    session: &Session,
    status: &SessionStatus,
) -> Result<(), RepositoryError> {
    validator
        .policy()
        .vet_transition(&session.public_id, session.is_closed(), session.current_state(), status)
        .map_err(rejected)
}

/// Update plus status change, staged together so storage can commit both or
/// neither. The state row is `None` when `status` is already current on the
/// stored copy.
pub(crate) fn stage_transition(
    validator: &WritePathValidator,
    current: &Session,
    update: &SessionUpdate,
    status: &SessionStatus,
    now: DateTime<Utc>,
) -> Result<(Session, Option<State>), RepositoryError> {
    let mut next = stage_update(validator, current, update, now)?;
    if next.current_state().is_some_and(|state| state.status == *status) {
        return Ok((next, None));
    }
    stage_state(validator, &next, status)?;

    let mut states = next.states().to_vec();
    let state = lifecycle::push_state(&mut states, &next.public_id, status.clone(), now);
    next.attach_states(states);
    Ok((next, Some(state)))
}

fn rejected(err: SessionError) -> RepositoryError {
    telemetry::record_vet_rejection(err.kind());
    RepositoryError::Vet(err)
}

/// HashMap-backed session storage. Compare-and-set happens under the write guard.
#[derive(Clone)]
pub struct InMemorySessionRepository {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
    validator: WritePathValidator,
}

impl InMemorySessionRepository {
    pub fn new(validator: WritePathValidator) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            validator,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<Session, RepositoryError> {
        let now = Utc::now();
        let mut stored = stage_create(&self.validator, session, now)?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&stored.public_id) {
            return Err(RepositoryError::AlreadyExists(stored.public_id.to_string()));
        }

        let mut states = Vec::new();
        lifecycle::push_state(
            &mut states,
            &stored.public_id,
            self.validator.policy().initial_status().clone(),
            now,
        );
        stored.attach_states(states);
        sessions.insert(stored.public_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, update: &SessionUpdate) -> Result<Session, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(&update.public_id)
            .ok_or_else(|| RepositoryError::NotFound(update.public_id.to_string()))?;

        let next = stage_update(&self.validator, current, update, Utc::now())?;
        sessions.insert(next.public_id.clone(), next.clone());
        Ok(next)
    }

    async fn transition(
        &self,
        update: &SessionUpdate,
        status: &SessionStatus,
    ) -> Result<Session, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(&update.public_id)
            .ok_or_else(|| RepositoryError::NotFound(update.public_id.to_string()))?;

        let (next, _) = stage_transition(&self.validator, current, update, status, Utc::now())?;
        sessions.insert(next.public_id.clone(), next.clone());
        Ok(next)
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).cloned())
    }

    async fn append_state(
        &self,
        id: &SessionId,
        status: &SessionStatus,
    ) -> Result<State, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stage_state(&self.validator, session, status)?;

        let mut states = session.states().to_vec();
        let state = lifecycle::push_state(&mut states, id, status.clone(), Utc::now());
        session.attach_states(states);
        Ok(state)
    }

    async fn list_states(&self, id: &SessionId) -> Result<Vec<State>, RepositoryError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|session| session.states().to_vec())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn find_view(&self, id: &SessionId) -> Result<Option<SessionView>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(id)
            .map(|session| SessionView::project(session, session.states())))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}
