mod common;

use chrono::Duration;
use common::{scopes, TestApp};
use identity_service::services::Clock;
use identity_service::IdentityError;
use service_core::error::AppError;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

#[tokio::test]
async fn test_issue_and_validate_round_trip() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;

    let issued = tokens
        .issue(
            "u1",
            &scopes(&["read", "write"]),
            &scopes(&["read", "write", "admin"]),
            None,
        )
        .await
        .unwrap();

    let identity = tokens.validate(&issued.plaintext).await.unwrap();
    assert_eq!(identity.token_id, issued.token_id);
    assert_eq!(identity.user_id, "u1");
    assert_eq!(identity.scopes, scopes(&["read", "write"]));
}

#[tokio::test]
async fn test_token_expires_after_ttl() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;

    let issued = tokens
        .issue(
            "u1",
            &scopes(&["read"]),
            &scopes(&["read"]),
            Some(Duration::hours(1)),
        )
        .await
        .unwrap();

    app.clock.advance(Duration::minutes(59));
    let identity = tokens.validate(&issued.plaintext).await.unwrap();
    assert_eq!(identity.user_id, "u1");
    assert_eq!(identity.scopes, scopes(&["read"]));

    app.clock.advance(Duration::minutes(2));
    assert!(matches!(
        tokens.validate(&issued.plaintext).await,
        Err(IdentityError::Expired)
    ));
}

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let issued = tokens
        .issue("u1", &scopes(&["read"]), &scopes(&["read"]), None)
        .await
        .unwrap();

    assert_ok!(tokens.revoke(issued.token_id).await);
    let first = tokens.get(issued.token_id).await.unwrap().revoked_at;

    app.clock.advance(Duration::minutes(5));
    assert_ok!(tokens.revoke(issued.token_id).await);
    let second = tokens.get(issued.token_id).await.unwrap().revoked_at;

    assert!(first.is_some());
    assert_eq!(first, second);

    for _ in 0..3 {
        assert!(matches!(
            tokens.validate(&issued.plaintext).await,
            Err(IdentityError::Revoked)
        ));
    }
}

#[tokio::test]
async fn test_revoked_wins_over_expired() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let issued = tokens
        .issue(
            "u1",
            &scopes(&["read"]),
            &scopes(&["read"]),
            Some(Duration::minutes(10)),
        )
        .await
        .unwrap();

    tokens.revoke(issued.token_id).await.unwrap();
    app.clock.advance(Duration::hours(1));

    assert!(matches!(
        tokens.validate(&issued.plaintext).await,
        Err(IdentityError::Revoked)
    ));
}

#[tokio::test]
async fn test_revoke_unknown_token() {
    let app = TestApp::spawn();
    assert!(matches!(
        app.registry.access_tokens.revoke(Uuid::new_v4()).await,
        Err(IdentityError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_and_tampered_tokens_are_unauthenticated() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let issued = tokens
        .issue("u1", &scopes(&["read"]), &scopes(&["read"]), None)
        .await
        .unwrap();

    let mut tampered = issued.plaintext.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == '0' { '1' } else { '0' });

    assert!(matches!(
        tokens.validate(&tampered).await,
        Err(IdentityError::Unauthenticated)
    ));
    assert!(matches!(
        tokens.validate("ist_deadbeef").await,
        Err(IdentityError::Unauthenticated)
    ));
}

#[tokio::test]
async fn test_auth_failures_are_indistinguishable_to_callers() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let issued = tokens
        .issue("u1", &scopes(&["read"]), &scopes(&["read"]), None)
        .await
        .unwrap();
    tokens.revoke(issued.token_id).await.unwrap();

    let unknown = AppError::from(tokens.validate("ist_unknown").await.unwrap_err());
    let revoked = AppError::from(tokens.validate(&issued.plaintext).await.unwrap_err());

    assert_eq!(unknown.to_response().error, revoked.to_response().error);
    assert_eq!(unknown.status_code(), revoked.status_code());
}

#[tokio::test]
async fn test_scope_outside_permitted_set_is_rejected() {
    let app = TestApp::spawn();
    let result = app
        .registry
        .access_tokens
        .issue("u1", &scopes(&["read", "admin"]), &scopes(&["read"]), None)
        .await;

    assert!(matches!(result, Err(IdentityError::InvalidScope(scope)) if scope == "admin"));
    assert!(app.gateway.is_empty());
}

#[tokio::test]
async fn test_validate_scope() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let issued = tokens
        .issue("u1", &scopes(&["read"]), &scopes(&["read", "write"]), None)
        .await
        .unwrap();

    assert_ok!(tokens.validate_scope(&issued.plaintext, "read").await);
    assert!(matches!(
        tokens.validate_scope(&issued.plaintext, "write").await,
        Err(IdentityError::Forbidden(_))
    ));
}

#[tokio::test]
async fn test_list_returns_metadata_in_issue_order() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let permitted = scopes(&["read"]);

    let first = tokens
        .issue_with_note("u1", &permitted, &permitted, None, "laptop")
        .await
        .unwrap();
    app.clock.advance(Duration::seconds(1));
    let second = tokens
        .issue_with_note("u1", &permitted, &permitted, None, "ci")
        .await
        .unwrap();
    tokens
        .issue("u2", &permitted, &permitted, None)
        .await
        .unwrap();
    tokens.revoke(first.token_id).await.unwrap();

    let listed = tokens.list("u1").await.unwrap();
    let ids: Vec<Uuid> = listed.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first.token_id, second.token_id]);
    assert_eq!(listed[0].note, "laptop");
    assert!(listed[0].revoked_at.is_some());

    let rendered = serde_json::to_string(&listed).unwrap();
    assert!(!rendered.contains(&first.plaintext));
    assert!(!rendered.contains("secret_hash"));
}

#[tokio::test]
async fn test_default_ttl_from_config() {
    let mut config = identity_service::IdentityConfig::default();
    config.tokens.default_ttl_minutes = Some(30);
    let app = TestApp::spawn_with_config(config);
    let tokens = &app.registry.access_tokens;

    let issued = tokens
        .issue("u1", &scopes(&["read"]), &scopes(&["read"]), None)
        .await
        .unwrap();
    let metadata = tokens.get(issued.token_id).await.unwrap();
    assert_eq!(metadata.expires_at, Some(app.clock.now() + Duration::minutes(30)));
}

#[tokio::test]
async fn test_storage_outage_is_surfaced() {
    let app = TestApp::spawn();
    let tokens = &app.registry.access_tokens;
    let issued = tokens
        .issue("u1", &scopes(&["read"]), &scopes(&["read"]), None)
        .await
        .unwrap();

    app.gateway.set_unavailable(true);
    let result = tokens.validate(&issued.plaintext).await;
    assert!(matches!(result, Err(IdentityError::Storage(_))));
    assert_err!(tokens.revoke(issued.token_id).await);

    app.gateway.set_unavailable(false);
    assert_ok!(tokens.validate(&issued.plaintext).await);
}
