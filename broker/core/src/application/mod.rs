// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod repository_factory;
pub mod session_service;

pub use session_service::{
    CreatedSession, ServiceError, SessionService, StandardSessionService, TofuOutcome,
};
