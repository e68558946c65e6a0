mod common;

use chrono::{Duration, Utc};
use common::TestWorld;
use developer_key_service::models::developer_key::DEFAULT_KEY_NAME;
use developer_key_service::models::{
    AccessToken, BindingState, ClientType, KeyWorkflowState, NewDeveloperKey, ToolWorkflowState,
};
use developer_key_service::services::cache::{developer_key_cache_key, vendor_code_cache_key};
use developer_key_service::services::store::{BindingStore, DeveloperKeyStore};
use developer_key_service::services::ServiceError;

#[tokio::test]
async fn test_find_cached_reads_through_and_save_evicts() {
    let world = TestWorld::new();
    let mut key = world
        .create_key(NewDeveloperKey {
            name: Some("Reporting".to_string()),
            ..Default::default()
        })
        .await;
    let cache_key = developer_key_cache_key(key.global_id());

    assert!(!world.backend.contains(&cache_key));
    let by_global = world
        .state
        .developer_keys
        .find_cached(key.global_id())
        .await
        .unwrap();
    assert_eq!(by_global.id, key.id);
    assert!(world.backend.contains(&cache_key));

    let by_local = world.state.developer_keys.find_cached(key.id).await.unwrap();
    assert_eq!(by_local.name.as_deref(), Some("Reporting"));

    key.name = Some("Reporting v2".to_string());
    world.state.developer_keys.save(&mut key).await.unwrap();
    assert!(!world.backend.contains(&cache_key));

    let refreshed = world.state.developer_keys.find_cached(key.id).await.unwrap();
    assert_eq!(refreshed.name.as_deref(), Some("Reporting v2"));

    let missing = world.state.developer_keys.find_cached(9_999).await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_vendor_code_change_evicts_both_codes() {
    let world = TestWorld::new();
    let developer_keys = &world.state.developer_keys;
    let vendor = |code: &str| NewDeveloperKey {
        vendor_code: Some(code.to_string()),
        ..Default::default()
    };

    let mut first = world.create_key(vendor("acme")).await;
    world.create_key(vendor("acme")).await;

    assert_eq!(developer_keys.by_cached_vendor_code("acme").await.unwrap().len(), 2);
    assert!(developer_keys.by_cached_vendor_code("globex").await.unwrap().is_empty());
    assert!(world.backend.contains(&vendor_code_cache_key("acme")));
    assert!(world.backend.contains(&vendor_code_cache_key("globex")));

    first.vendor_code = Some("globex".to_string());
    developer_keys.save(&mut first).await.unwrap();
    assert!(!world.backend.contains(&vendor_code_cache_key("acme")));
    assert!(!world.backend.contains(&vendor_code_cache_key("globex")));

    assert_eq!(developer_keys.by_cached_vendor_code("acme").await.unwrap().len(), 1);
    let globex = developer_keys.by_cached_vendor_code("globex").await.unwrap();
    assert_eq!(globex[0].id, first.id);
}

#[tokio::test]
async fn test_default_key_is_created_once_and_protected() {
    let world = TestWorld::new();
    let developer_keys = &world.state.developer_keys;

    assert!(developer_keys.default_key(false).await.unwrap().is_none());

    let mut default = developer_keys.default_key(true).await.unwrap().unwrap();
    assert_eq!(default.name.as_deref(), Some(DEFAULT_KEY_NAME));
    assert!(!default.auto_expire_tokens);
    assert!(world
        .state
        .authorizer
        .usable_in_context(
            &default,
            &developer_key_service::models::Context::Account(world.school.clone())
        )
        .await
        .unwrap());

    let again = developer_keys.default_key(true).await.unwrap().unwrap();
    assert_eq!(again.id, default.id);

    let deactivated = developer_keys.deactivate(&mut default).await;
    assert!(matches!(deactivated, Err(ServiceError::ProtectedKey)));
    let mut stored = world.store.find_key(default.id).await.unwrap().unwrap();
    assert!(stored.is_active());

    let destroyed = developer_keys.destroy(&mut stored).await;
    assert!(matches!(destroyed, Err(ServiceError::ProtectedKey)));
    assert_eq!(
        world.store.bindings_for_key(default.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_destroying_owned_lti_key() {
    let world = TestWorld::new();
    let mut key = world.create_lti_key(Some(&world.university)).await;
    assert!(key.visible);
    assert_eq!(key.root_account_id, Some(world.university.id));

    world
        .state
        .developer_keys
        .set_binding_state(&key, &world.department, BindingState::On)
        .await
        .unwrap();
    let department_tool = world.install_tool(&key, &world.department).await;
    let college_tool = world.install_tool(&key, &world.college).await;
    world.store.insert_access_token(
        AccessToken::new(key.id, 42).used_at(Utc::now() - Duration::minutes(5)),
    );
    world.drain_jobs().await;

    assert!(world.state.developer_keys.destroy(&mut key).await.unwrap());
    world.drain_jobs().await;

    let stored = world.store.find_key(key.id).await.unwrap().unwrap();
    assert_eq!(stored.workflow_state, KeyWorkflowState::Deleted);
    assert!(stored.tool_configuration.is_none());
    assert!(world.store.bindings_for_key(key.id).await.unwrap().is_empty());

    // Destroy is scoped to the owning root account.
    assert_eq!(
        world.tool_state(&department_tool).await,
        ToolWorkflowState::Deleted
    );
    assert!(world.tool_state(&college_tool).await.is_active());

    // Scopes were not touched, so tokens survive the soft delete.
    assert_eq!(world.store.access_token_count(key.id), 1);
    assert!(world
        .state
        .developer_keys
        .last_used_at(&key)
        .await
        .unwrap()
        .is_some());

    // Deleting again is a no-op.
    let jobs_before = world.state.jobs.stats().enqueued;
    assert!(world.state.developer_keys.destroy(&mut key).await.unwrap());
    assert_eq!(world.state.jobs.stats().enqueued, jobs_before);
}

#[tokio::test]
async fn test_removing_scopes_invalidates_tokens() {
    let world = TestWorld::new();
    let courses = "url:GET|/api/v1/courses".to_string();
    let accounts = "url:GET|/api/v1/accounts".to_string();
    let mut key = world
        .create_key(NewDeveloperKey {
            scopes: vec![courses.clone(), accounts.clone()],
            require_scopes: true,
            ..Default::default()
        })
        .await;
    world.store.insert_access_token(AccessToken::new(key.id, 7));
    world.store.insert_access_token(AccessToken::new(key.id, 8));

    key.scopes.push(courses.clone());
    world.state.developer_keys.save(&mut key).await.unwrap();
    assert_eq!(key.scopes.len(), 2);
    assert_eq!(world.store.access_token_count(key.id), 2);

    key.scopes = vec![courses];
    world.state.developer_keys.save(&mut key).await.unwrap();
    assert_eq!(world.store.access_token_count(key.id), 0);
}

#[tokio::test]
async fn test_token_lifetime_and_signing_follow_the_key() {
    let world = TestWorld::new();
    let ttl_minutes = world.state.config.tokens.public_client_token_ttl_minutes;

    let public = world
        .create_key(NewDeveloperKey {
            client_type: ClientType::Public,
            ..Default::default()
        })
        .await;
    assert_eq!(
        public.tokens_expire_in(ttl_minutes),
        Some(Duration::minutes(120))
    );

    let confidential = world
        .create_key(NewDeveloperKey {
            client_credentials_audience: Some("external".to_string()),
            ..Default::default()
        })
        .await;
    assert_eq!(confidential.tokens_expire_in(ttl_minutes), None);

    let mut claims = developer_key_service::services::token::Claims::new();
    claims.insert("sub".to_string(), serde_json::json!(confidential.global_id()));

    let external = world.state.tokens.issue(&confidential, &claims).unwrap();
    let header = jsonwebtoken::decode_header(&external).unwrap();
    assert_eq!(header.alg, jsonwebtoken::Algorithm::RS256);
    assert!(world.state.tokens.decode_internal(&external).is_err());

    let internal = world.state.tokens.issue(&public, &claims).unwrap();
    assert_eq!(world.state.tokens.decode_internal(&internal).unwrap(), claims);
}

#[tokio::test]
async fn test_conflicting_token_flags_are_not_persisted() {
    let world = TestWorld::new();
    let mut key = world
        .create_key(NewDeveloperKey {
            redirect_uris: Some("example.com/cb".into()),
            ..Default::default()
        })
        .await;
    assert!(key.auto_expire_tokens);

    key.force_token_reuse = true;
    key.redirect_uris.push("app.example.com/cb".to_string());
    let result = world.state.developer_keys.save(&mut key).await;

    match result {
        Err(ServiceError::Validation(errors)) => {
            assert!(errors.field_errors().contains_key("auto_expire_tokens"));
        }
        other => panic!("expected a validation error, got {:?}", other),
    }
    assert_eq!(
        key.redirect_uris,
        vec!["http://example.com/cb".to_string(), "app.example.com/cb".to_string()]
    );

    let stored = world.store.find_key(key.id).await.unwrap().unwrap();
    assert!(!stored.force_token_reuse);
    assert!(stored.auto_expire_tokens);
    assert_eq!(stored.redirect_uris, vec!["http://example.com/cb".to_string()]);
}

#[tokio::test]
async fn test_invalid_key_is_rejected_without_side_effects() {
    let world = TestWorld::new();
    let result = world
        .state
        .developer_keys
        .create(NewDeveloperKey {
            scopes: vec!["url:DELETE|/api/v1/everything".to_string()],
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(ServiceError::Validation(_))));
    assert!(world.store.find_key(1).await.unwrap().is_none());
}
