// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod ciphers;
pub mod credentials;
pub mod db;
pub mod encryption;
pub mod repositories;
pub mod secrets_manager;
pub mod telemetry;

pub use credentials::{issue_credential, IssuedCredential};
pub use encryption::{decrypt_session, encrypt_session};
