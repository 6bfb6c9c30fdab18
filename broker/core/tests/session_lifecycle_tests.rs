// Copyright (c) 2026 Gatehouse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end session flow through the configured service.
//!
//! Builds the service from a manifest with a local keyring and no database,
//! then walks a session from creation through worker assignment, trust on
//! first use and termination. Certificates are inspected with x509-parser.

use chrono::{Duration, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use gatehouse_core::application::{ServiceError, SessionService, StandardSessionService, TofuOutcome};
use gatehouse_core::domain::broker_config::BrokerConfigManifest;
use gatehouse_core::domain::error::SessionError;
use gatehouse_core::domain::session::{ComposedOf, SessionId};
use gatehouse_core::infrastructure::ciphers::LocalKeyring;
use gatehouse_core::infrastructure::credentials::derive_verifying_key;

const MANIFEST: &str = r#"
apiVersion: gatehouse.dev/v1
kind: BrokerConfig
metadata:
  name: controller-test
spec:
  lifecycle:
    initial_status: pending
    active_status: active
    terminal_status: terminated
    statuses: [pending, active, canceling, terminated]
    termination_reasons: [timed out, closed by user, connection limit, canceled]
  encryption:
    provider: local
    key_name: sessions
    keys:
      - version: 1
        material: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="
  crypto:
    timeout_ms: 2000
"#;

fn service() -> StandardSessionService {
    let config = BrokerConfigManifest::from_yaml_str(MANIFEST).unwrap();
    config.validate().unwrap();
    StandardSessionService::from_config(&config, None).unwrap()
}

fn composed(user_id: &str) -> ComposedOf {
    ComposedOf {
        user_id: user_id.to_string(),
        host_id: "h_0000000001".to_string(),
        target_id: "t_0000000001".to_string(),
        host_set_id: "hs_000000001".to_string(),
        auth_token_id: "at_000000001".to_string(),
        scope_id: "p_0000000001".to_string(),
        endpoint: "tcp://db.internal:5432".to_string(),
        expiration_time: Some(Utc::now() + Duration::hours(1)),
        connection_limit: 1,
    }
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let service = service();
    let ctx = service.context();

    let created = service.create_session(&ctx, composed("u_alice00001")).await.unwrap();
    let id = created.session.public_id.clone();
    assert!(id.as_str().starts_with("s_"));
    assert_eq!(created.session.key_id, "sessions:v1");

    let view = service.get_view(&id).await.unwrap();
    assert_eq!(view.status.as_ref().unwrap().as_str(), "pending");
    assert!(view.server_id.is_none());

    let session = service.assign_worker(&id, "w_0000000001", "worker").await.unwrap();
    assert_eq!(session.current_state().unwrap().status.as_str(), "active");

    let outcome = service.trust_on_first_use(&ctx, &id, b"worker-nonce").await.unwrap();
    assert_eq!(outcome, TofuOutcome::FirstUse);
    let outcome = service.trust_on_first_use(&ctx, &id, b"worker-nonce").await.unwrap();
    assert_eq!(outcome, TofuOutcome::Matched);

    let view = service.terminate(&id, "connection limit").await.unwrap();
    assert_eq!(view.status.as_ref().unwrap().as_str(), "terminated");
    assert_eq!(view.termination_reason.as_ref().unwrap().as_str(), "connection limit");
    assert_eq!(view.server_id.as_deref(), Some("w_0000000001"));
    assert_eq!(view.version, 4);
    assert!(view.end_time.is_none());
    assert!(view.previous_end_time.is_some());
}

#[tokio::test]
async fn test_certificate_binds_session_identity() {
    let service = service();
    let ctx = service.context();
    let composed = composed("u_bob0000001");
    let expiration = composed.expiration_time.unwrap();

    let created = service.create_session(&ctx, composed).await.unwrap();
    let id = created.session.public_id.as_str();

    let (_, cert) = X509Certificate::from_der(&created.session.certificate).unwrap();
    let cn = cert.subject().iter_common_name().next().unwrap().as_str().unwrap();
    assert_eq!(cn, id);
    assert_eq!(cert.validity().not_after.timestamp(), expiration.timestamp());
    cert.verify_signature(None).unwrap();

    // A worker holding the same derivation key re-derives the session key.
    let config = BrokerConfigManifest::from_yaml_str(MANIFEST).unwrap();
    let keyring = LocalKeyring::from_config(&config.spec.encryption).unwrap();
    let worker_key = derive_verifying_key(&keyring, "u_bob0000001", id).unwrap();
    assert_eq!(
        cert.public_key().subject_public_key.data.to_vec(),
        worker_key.to_bytes().to_vec()
    );
}

#[tokio::test]
async fn test_view_never_exposes_tofu_plaintext() {
    let service = service();
    let ctx = service.context();
    let id = service
        .create_session(&ctx, composed("u_carol00001"))
        .await
        .unwrap()
        .session
        .public_id;
    service.trust_on_first_use(&ctx, &id, b"plaintext-marker").await.unwrap();

    let view = service.get_view(&id).await.unwrap();
    let json = serde_json::to_string(&view).unwrap();
    assert!(!json.contains("plaintext-marker"));
    assert!(!json.contains("db.internal"));
    assert_ne!(view.ct_tofu_token.as_deref(), Some(&b"plaintext-marker"[..]));

    let session = service.get_session(&ctx, &id).await.unwrap();
    assert_eq!(session.tofu_token(), Some(&b"plaintext-marker"[..]));
    assert!(!format!("{session:?}").contains("plaintext-marker"));
}

#[tokio::test]
async fn test_expired_session_refuses_worker_but_can_terminate() {
    let service = service();
    let ctx = service.context();
    let mut composed = composed("u_dave000001");
    composed.expiration_time = Some(Utc::now() + Duration::milliseconds(50));

    let id = service.create_session(&ctx, composed).await.unwrap().session.public_id;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let err = service.assign_worker(&id, "w_0000000001", "worker").await.unwrap_err();
    assert!(matches!(err, ServiceError::Expired(_)));

    let view = service.terminate(&id, "timed out").await.unwrap();
    assert_eq!(view.termination_reason.as_ref().unwrap().as_str(), "timed out");
}

#[tokio::test]
async fn test_terminated_session_stays_closed() {
    let service = service();
    let ctx = service.context();
    let id = service
        .create_session(&ctx, composed("u_erin000001"))
        .await
        .unwrap()
        .session
        .public_id;

    service.terminate(&id, "canceled").await.unwrap();
    let err = service.terminate(&id, "timed out").await.unwrap_err();
    assert!(matches!(err, ServiceError::Session(SessionError::SessionClosed(_))));

    let view = service.get_view(&id).await.unwrap();
    assert_eq!(view.termination_reason.as_ref().unwrap().as_str(), "canceled");
}

#[tokio::test]
async fn test_unknown_session() {
    let service = service();
    let id = SessionId::new("s_doesnotexist");
    assert!(matches!(service.get_view(&id).await, Err(ServiceError::NotFound(_))));
    assert!(matches!(
        service.terminate(&id, "canceled").await,
        Err(ServiceError::NotFound(_))
    ));
}
