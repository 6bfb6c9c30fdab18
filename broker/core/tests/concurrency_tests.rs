// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Optimistic concurrency on the session write path.
//!
//! Racing writers that read the same version must resolve to exactly one
//! winner; every loser sees a conflict and nothing it wrote is stored.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use gatehouse_core::application::{ServiceError, SessionService, StandardSessionService, TofuOutcome};
use gatehouse_core::domain::broker_config::LifecycleConfig;
use gatehouse_core::domain::lifecycle::LifecyclePolicy;
use gatehouse_core::domain::repository::{RepositoryError, SessionRepository};
use gatehouse_core::domain::session::{
    ComposedOf, PrefixedIdAllocator, Session, SessionId, SessionUpdate,
};
use gatehouse_core::domain::vetting::WritePathValidator;
use gatehouse_core::infrastructure::ciphers::{CipherSet, LocalKeyring};
use gatehouse_core::infrastructure::repositories::InMemorySessionRepository;

const RACERS: usize = 8;

fn policy() -> Arc<LifecyclePolicy> {
    let config = LifecycleConfig {
        initial_status: "pending".to_string(),
        active_status: "active".to_string(),
        terminal_status: "terminated".to_string(),
        statuses: vec!["pending".into(), "active".into(), "terminated".into()],
        termination_reasons: vec!["canceled".into(), "timed out".into()],
    };
    Arc::new(LifecyclePolicy::from_config(&config).unwrap())
}

fn composed() -> ComposedOf {
    ComposedOf {
        user_id: "u_0000000001".to_string(),
        host_id: "h_0000000001".to_string(),
        target_id: "t_0000000001".to_string(),
        host_set_id: "hs_000000001".to_string(),
        auth_token_id: "at_000000001".to_string(),
        scope_id: "p_0000000001".to_string(),
        endpoint: "tcp://10.1.2.3:22".to_string(),
        expiration_time: Some(Utc::now() + chrono::Duration::hours(1)),
        connection_limit: 2,
    }
}

async fn seeded_repository() -> (Arc<InMemorySessionRepository>, SessionId) {
    let repo = Arc::new(InMemorySessionRepository::new(WritePathValidator::new(policy())));
    let mut session = Session::new(composed()).unwrap();
    session.public_id = SessionId::new("s_race000001");
    session.certificate = vec![0x30, 0x03, 0x02, 0x01, 0x01];
    let stored = repo.create(&session).await.unwrap();
    assert_eq!(stored.version, 1);
    (repo, stored.public_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_updates_have_exactly_one_winner() {
    let (repo, id) = seeded_repository().await;

    let tasks = (0..RACERS).map(|i| {
        let repo = repo.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let update = SessionUpdate::new(id, 1).assign_worker(format!("w_{i}"), "worker");
            repo.update(&update).await
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|err| matches!(err, RepositoryError::ConcurrencyConflict { expected_version: 1, .. })));

    let stored = repo.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.server_id, winners[0].server_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loser_can_retry_after_reload() {
    let (repo, id) = seeded_repository().await;

    let first = SessionUpdate::new(id.clone(), 1).assign_worker("w_a", "worker");
    let second = SessionUpdate::new(id.clone(), 1).assign_worker("w_b", "worker");
    let (a, b) = tokio::join!(repo.update(&first), repo.update(&second));
    assert!(a.is_ok() != b.is_ok());
    let err = a.err().or(b.err()).unwrap();
    assert!(err.is_conflict());

    let current = repo.find_by_id(&id).await.unwrap().unwrap();
    let retry = SessionUpdate::new(id.clone(), current.version).assign_worker("w_c", "worker");
    let stored = repo.update(&retry).await.unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.server_id.as_deref(), Some("w_c"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_trusts_one_token() {
    let policy = policy();
    let keyring = Arc::new(LocalKeyring::generate("sessions"));
    let repository = Arc::new(InMemorySessionRepository::new(WritePathValidator::new(policy.clone())));
    let service = Arc::new(StandardSessionService::new(
        repository,
        CipherSet {
            cipher: keyring.clone(),
            derivation: keyring,
        },
        Arc::new(PrefixedIdAllocator::default()),
        policy,
        Duration::from_secs(5),
    ));

    let ctx = service.context();
    let id = service.create_session(&ctx, composed()).await.unwrap().session.public_id;

    let tasks = (0..RACERS).map(|i| {
        let service = service.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let token = format!("token-{i}");
            let outcome = service
                .trust_on_first_use(&service.context(), &id, token.as_bytes())
                .await;
            (token, outcome)
        })
    });
    let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

    let trusted: Vec<_> = results
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Ok(TofuOutcome::FirstUse)))
        .map(|(token, _)| token.clone())
        .collect();
    assert_eq!(trusted.len(), 1);
    for (_, outcome) in &results {
        match outcome {
            Ok(TofuOutcome::FirstUse) => {}
            Err(ServiceError::TofuMismatch(_)) => {}
            Err(err) => assert!(err.is_conflict(), "unexpected error: {err}"),
            Ok(TofuOutcome::Matched) => panic!("distinct tokens cannot match"),
        }
    }

    let session = service.get_session(&ctx, &id).await.unwrap();
    assert_eq!(session.tofu_token(), Some(trusted[0].as_bytes()));
}
