// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Session aggregate, lifecycle policy, write-path vetting and the
//! collaborator contracts (cipher, derivation key, repository) the core
//! depends on.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure session rules; no I/O beyond trait seams

pub mod broker_config;
pub mod crypto;
pub mod error;
pub mod lifecycle;
pub mod repository;
pub mod session;
pub mod vetting;
