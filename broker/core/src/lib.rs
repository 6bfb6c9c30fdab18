// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Gatehouse Core
//!
//! Session-credential core of the Gatehouse access broker: the session
//! aggregate, per-session certificate issuance, envelope encryption of
//! session secrets and the write-path validator that guards storage.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** `domain` holds the rules, `application` composes them into
//!   the session service, `infrastructure` supplies ciphers, storage and telemetry

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
