// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory
//!
//! Picks the concrete [`SessionRepository`] for a deployment. Postgres when
//! `spec.database` produced a [`Database`], otherwise the in-memory store.

use std::sync::Arc;

use crate::domain::repository::SessionRepository;
use crate::domain::vetting::WritePathValidator;
use crate::infrastructure::db::Database;
use crate::infrastructure::repositories::{InMemorySessionRepository, PostgresSessionRepository};

/// Creates a SessionRepository implementation based on the configured backend
pub fn create_session_repository(
    database: Option<&Database>,
    validator: WritePathValidator,
) -> Arc<dyn SessionRepository> {
    match database {
        Some(db) => Arc::new(PostgresSessionRepository::new(db.get_pool().clone(), validator)),
        None => {
            tracing::warn!("No database configured; sessions are kept in memory only");
            Arc::new(InMemorySessionRepository::new(validator))
        }
    }
}
