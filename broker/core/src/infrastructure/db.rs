// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into [`PostgresSessionRepository`](crate::infrastructure::repositories::PostgresSessionRepository).
//! Only needed when `spec.database` is configured; the in-memory repository
//! needs none of this.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::domain::broker_config::{resolve_secret_value, DatabaseConfig};

const SESSION_SCHEMA: &str = include_str!("../../migrations/0001_session.sql");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_string)
            .await
            .context("Failed to connect to session database")?;

        Ok(Self { pool })
    }

    /// Connect using `spec.database`, resolving `env:` indirection in the URL.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        let url = resolve_secret_value(&config.url)?;
        Self::new(&url, config.max_connections).await
    }

    /// Create the session tables and view if they do not exist. Idempotent.
    pub async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SESSION_SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to apply session schema")?;
        tracing::info!("Session schema applied");
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}
