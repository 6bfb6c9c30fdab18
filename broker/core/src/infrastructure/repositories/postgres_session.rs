// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Session
//!
//! Session storage on the `session` / `session_state` tables and the
//! `session_with_state` view (see `migrations/0001_session.sql`).
//!
//! Optimistic concurrency is enforced by the `UPDATE ... WHERE version = $n`
//! guard: a write that matches no row lost the race and surfaces as
//! `ConcurrencyConflict`. No row locks are taken. `transition` writes the
//! session row and its new state row in the same transaction.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::domain::lifecycle::{self, SessionStatus, SessionView, State};
use crate::domain::repository::{RepositoryError, SessionRepository};
use crate::domain::session::{Session, SessionId, SessionRecord, SessionUpdate};
use crate::domain::vetting::WritePathValidator;
use crate::infrastructure::repositories::{
    stage_create, stage_state, stage_transition, stage_update,
};
use crate::infrastructure::telemetry;

const SESSION_COLUMNS: &str = r#"
    public_id, user_id, host_id, server_id, server_type, target_id,
    host_set_id, auth_token_id, scope_id, certificate, expiration_time,
    create_time, update_time, tofu_token, termination_reason, version,
    endpoint, connection_limit, key_id
"#;

pub struct PostgresSessionRepository {
    pool: PgPool,
    validator: WritePathValidator,
}

impl PostgresSessionRepository {
    pub fn new(pool: PgPool, validator: WritePathValidator) -> Self {
        Self { pool, validator }
    }

    /// Postgres keeps microseconds; truncate so what we return is what we stored.
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    async fn load_session(
        tx: &mut Transaction<'_, Postgres>,
        id: &SessionId,
    ) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM session WHERE public_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut session = Session::from_record(parse_session_row(&row)?);

        let states = sqlx::query(
            r#"
            SELECT session_id, status, previous_end_time, start_time, end_time
            FROM session_state
            WHERE session_id = $1
            ORDER BY start_time
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;
        session.attach_states(states.iter().map(parse_state_row).collect::<Result<_, _>>()?);

        Ok(Some(session))
    }

    /// Versioned write of the mutable columns. Zero rows matched means a
    /// concurrent writer got there first.
    async fn write_update(
        tx: &mut Transaction<'_, Postgres>,
        next: &Session,
        update: &SessionUpdate,
    ) -> Result<(), RepositoryError> {
        let record = next.to_record();
        let result = sqlx::query(
            r#"
            UPDATE session
            SET server_id = $2,
                server_type = $3,
                termination_reason = $4,
                tofu_token = $5,
                key_id = $6,
                version = $7,
                update_time = $8
            WHERE public_id = $1 AND version = $9
            "#,
        )
        .bind(&record.public_id)
        .bind(&record.server_id)
        .bind(&record.server_type)
        .bind(&record.termination_reason)
        .bind(&record.tofu_token)
        .bind(&record.key_id)
        .bind(i64::from(record.version))
        .bind(record.update_time)
        .bind(i64::from(update.expected_version))
        .execute(&mut **tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to update session: {}", e)))?;

        if result.rows_affected() == 0 {
            telemetry::record_conflict();
            return Err(RepositoryError::ConcurrencyConflict {
                public_id: update.public_id.clone(),
                expected_version: update.expected_version,
            });
        }
        Ok(())
    }

    async fn insert_state(
        tx: &mut Transaction<'_, Postgres>,
        state: &State,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE session_state
            SET end_time = $2
            WHERE session_id = $1 AND end_time IS NULL
            "#,
        )
        .bind(state.session_id.as_str())
        .bind(state.start_time)
        .execute(&mut **tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to close session state: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO session_state (session_id, status, previous_end_time, start_time, end_time)
            VALUES ($1, $2, $3, $4, NULL)
            "#,
        )
        .bind(state.session_id.as_str())
        .bind(state.status.as_str())
        .bind(state.previous_end_time)
        .bind(state.start_time)
        .execute(&mut **tx)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to insert session state: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn create(&self, session: &Session) -> Result<Session, RepositoryError> {
        let now = Self::now();
        let mut stored = stage_create(&self.validator, session, now)?;
        let record = stored.to_record();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO session (
                public_id, user_id, host_id, server_id, server_type, target_id,
                host_set_id, auth_token_id, scope_id, certificate, expiration_time,
                create_time, update_time, tofu_token, termination_reason, version,
                endpoint, connection_limit, key_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&record.public_id)
        .bind(&record.user_id)
        .bind(&record.host_id)
        .bind(&record.server_id)
        .bind(&record.server_type)
        .bind(&record.target_id)
        .bind(&record.host_set_id)
        .bind(&record.auth_token_id)
        .bind(&record.scope_id)
        .bind(&record.certificate)
        .bind(record.expiration_time)
        .bind(record.create_time)
        .bind(record.update_time)
        .bind(&record.tofu_token)
        .bind(&record.termination_reason)
        .bind(i64::from(record.version))
        .bind(&record.endpoint)
        .bind(record.connection_limit)
        .bind(&record.key_id)
        .execute(&mut *tx)
        .await?;

        let mut states = Vec::new();
        let initial = lifecycle::push_state(
            &mut states,
            &stored.public_id,
            self.validator.policy().initial_status().clone(),
            now,
        );
        Self::insert_state(&mut tx, &initial).await?;
        tx.commit().await?;

        stored.attach_states(states);
        Ok(stored)
    }

    async fn update(&self, update: &SessionUpdate) -> Result<Session, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::load_session(&mut tx, &update.public_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(update.public_id.to_string()))?;

        let next = stage_update(&self.validator, &current, update, Self::now())?;
        Self::write_update(&mut tx, &next, update).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn transition(
        &self,
        update: &SessionUpdate,
        status: &SessionStatus,
    ) -> Result<Session, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::load_session(&mut tx, &update.public_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(update.public_id.to_string()))?;

        let (next, state) =
            stage_transition(&self.validator, &current, update, status, Self::now())?;
        Self::write_update(&mut tx, &next, update).await?;
        if let Some(state) = &state {
            Self::insert_state(&mut tx, state).await?;
        }
        tx.commit().await?;
        Ok(next)
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let session = Self::load_session(&mut tx, id).await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn append_state(
        &self,
        id: &SessionId,
        status: &SessionStatus,
    ) -> Result<State, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let session = Self::load_session(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stage_state(&self.validator, &session, status)?;

        let mut states = session.states().to_vec();
        let state = lifecycle::push_state(&mut states, id, status.clone(), Self::now());
        Self::insert_state(&mut tx, &state).await?;
        tx.commit().await?;
        Ok(state)
    }

    async fn list_states(&self, id: &SessionId) -> Result<Vec<State>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let session = Self::load_session(&mut tx, id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        tx.commit().await?;
        Ok(session.states().to_vec())
    }

    async fn find_view(&self, id: &SessionId) -> Result<Option<SessionView>, RepositoryError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SESSION_COLUMNS}, status, previous_end_time, start_time, end_time
            FROM session_with_state
            WHERE public_id = $1
            "#
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let session = Session::from_record(parse_session_row(&row)?);

        // The view carries at most the latest state row; absent when none exists yet.
        let status: Option<String> = row.try_get("status")?;
        let states = match status {
            Some(status) => vec![State {
                session_id: session.public_id.clone(),
                status: SessionStatus::new(status),
                previous_end_time: row.try_get("previous_end_time")?,
                start_time: row.try_get("start_time")?,
                end_time: row.try_get("end_time")?,
            }],
            None => Vec::new(),
        };

        Ok(Some(SessionView::project(&session, &states)))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM session WHERE public_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Failed to delete session: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

fn parse_session_row(row: &PgRow) -> Result<SessionRecord, RepositoryError> {
    let version: i64 = row.try_get("version")?;
    Ok(SessionRecord {
        public_id: row.try_get("public_id")?,
        user_id: row.try_get("user_id")?,
        host_id: row.try_get("host_id")?,
        server_id: row.try_get("server_id")?,
        server_type: row.try_get("server_type")?,
        target_id: row.try_get("target_id")?,
        host_set_id: row.try_get("host_set_id")?,
        auth_token_id: row.try_get("auth_token_id")?,
        scope_id: row.try_get("scope_id")?,
        certificate: row.try_get("certificate")?,
        expiration_time: row.try_get("expiration_time")?,
        create_time: row.try_get("create_time")?,
        update_time: row.try_get("update_time")?,
        tofu_token: row.try_get("tofu_token")?,
        termination_reason: row.try_get("termination_reason")?,
        version: u32::try_from(version)
            .map_err(|_| RepositoryError::Serialization(format!("session version {version} out of range")))?,
        endpoint: row.try_get("endpoint")?,
        connection_limit: row.try_get("connection_limit")?,
        key_id: row.try_get("key_id")?,
    })
}

fn parse_state_row(row: &PgRow) -> Result<State, RepositoryError> {
    let session_id: String = row.try_get("session_id")?;
    let status: String = row.try_get("status")?;
    Ok(State {
        session_id: SessionId::new(session_id),
        status: SessionStatus::new(status),
        previous_end_time: row.try_get("previous_end_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}
