// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Session Storage Contract
//!
//! The session core does not own persistence. It defines the contract here
//! and ships two implementations in `crate::infrastructure::repositories`:
//!
//! | Implementation | Backing store |
//! |----------------|---------------|
//! | `InMemorySessionRepository` | `tokio::sync::RwLock<HashMap<..>>`, development and tests |
//! | `PostgresSessionRepository` | `session` / `session_state` tables, `session_with_state` view |
//!
//! Every implementation must:
//! - run `vet_create` before the first write, set `version = 1` and append
//!   the policy's initial state row;
//! - reject an update whose `expected_version` is stale with
//!   [`RepositoryError::ConcurrencyConflict`], then `vet_update` the
//!   resulting session against the command's field mask, and bump the
//!   version exactly once;
//! - refuse updates and state appends on a closed session.

use async_trait::async_trait;

use crate::domain::error::SessionError;
use crate::domain::lifecycle::{SessionStatus, SessionView, State};
use crate::domain::session::{Session, SessionId, SessionUpdate};

/// Repository interface for Session aggregates
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session. Returns the stored copy (version, timestamps, states set).
    async fn create(&self, session: &Session) -> Result<Session, RepositoryError>;

    /// Apply a versioned update command. Returns the stored copy.
    async fn update(&self, update: &SessionUpdate) -> Result<Session, RepositoryError>;

    /// Apply a versioned update and move the session to `status` in one
    /// write: both land or neither does. No state row is added when `status`
    /// is already the stored session's current status.
    async fn transition(
        &self,
        update: &SessionUpdate,
        status: &SessionStatus,
    ) -> Result<Session, RepositoryError>;

    /// Find session by public id, with its state history attached
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    /// Close the open state row and append a new one
    async fn append_state(
        &self,
        id: &SessionId,
        status: &SessionStatus,
    ) -> Result<State, RepositoryError>;

    /// State history ordered by start time
    async fn list_states(&self, id: &SessionId) -> Result<Vec<State>, RepositoryError>;

    /// Session joined with its latest state row
    async fn find_view(&self, id: &SessionId) -> Result<Option<SessionView>, RepositoryError>;

    /// Delete session and its state history
    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    /// The stored version moved past the caller's expectation. Re-read and retry.
    #[error("Concurrent update of session {public_id}: expected version {expected_version}")]
    ConcurrencyConflict {
        public_id: SessionId,
        expected_version: u32,
    },

    #[error("Write rejected: {0}")]
    Vet(#[from] SessionError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                RepositoryError::AlreadyExists(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}
