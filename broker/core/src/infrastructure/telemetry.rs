// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Tracing subscriber setup and the metric names emitted by the session core.
//!
//! Metrics go through the `metrics` facade; the embedding service installs
//! whichever recorder/exporter it runs. With no recorder installed every
//! counter is a no-op.

use anyhow::{Context, Result};

use crate::domain::broker_config::ObservabilityConfig;

pub const SESSIONS_CREATED_TOTAL: &str = "gatehouse_sessions_created_total";
pub const SESSION_VET_REJECTIONS_TOTAL: &str = "gatehouse_session_vet_rejections_total";
pub const CRYPTO_FAILURES_TOTAL: &str = "gatehouse_crypto_failures_total";
pub const SESSION_CONFLICTS_TOTAL: &str = "gatehouse_session_conflicts_total";

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `level` when set. `format` is `compact` or `json`.
pub fn init_tracing(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match format {
        "json" => builder.json().try_init(),
        _ => builder.compact().try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

pub fn init_from_config(config: &ObservabilityConfig) -> Result<()> {
    init_tracing(&config.log_level, &config.log_format)
}

pub(crate) fn record_session_created() {
    metrics::counter!(SESSIONS_CREATED_TOTAL).increment(1);
}

pub(crate) fn record_vet_rejection(kind: &'static str) {
    metrics::counter!(SESSION_VET_REJECTIONS_TOTAL, "kind" => kind).increment(1);
}

pub(crate) fn record_crypto_failure(op: &'static str) {
    metrics::counter!(CRYPTO_FAILURES_TOTAL, "op" => op).increment(1);
}

pub(crate) fn record_conflict() {
    metrics::counter!(SESSION_CONFLICTS_TOTAL).increment(1);
}
