use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    AppState,
    codes::issue_invite_code,
    config::Config,
    database::models::{LimitType, PermissionTag, Role, User, UserPermission, UserSettings},
    database::{MemoryStore, NewAccount, SeedData, Store},
    utils::generate_token,
};

use super::router;

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    admin: User,
    config: Config,
}

impl TestApp {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(&SeedData::standard("admin", "unused-hash".into(), Utc::now()))
            .await
            .unwrap();
        let admin = store.find_user_by_username("admin").await.unwrap().unwrap();
        let config = Config::for_tests();
        let state = AppState {
            store: store.clone(),
            config: config.clone(),
        };
        Self {
            router: router(state),
            store,
            admin,
            config,
        }
    }

    async fn add_user(&self, username: &str, role: Role) -> User {
        let now = Utc::now();
        let user = User::new(username, None, Some("not-a-hash".into()), role, now);
        let permission = (role != Role::Admin).then(|| UserPermission::unrestricted(user.id, now));
        self.store
            .create_account(NewAccount {
                settings: UserSettings::default_for(user.id),
                permission,
                redeem: None,
                user,
            })
            .await
            .unwrap()
    }

    fn token(&self, user: &User) -> String {
        generate_token(
            &user.id.to_string(),
            user.role,
            Duration::from_secs(600),
            &self.config.jwt_secret,
        )
        .unwrap()
        .0
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}

#[tokio::test]
async fn test_health() {
    let app = TestApp::new().await;
    let (status, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["status"], "ok");
}

#[tokio::test]
async fn test_non_admin_is_rejected_everywhere_without_side_effects() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let bob = app.add_user("bob", Role::User).await;
    let code = issue_invite_code(app.store.as_ref(), app.admin.id, None, None)
        .await
        .unwrap();
    let before = app.store.table_counts().await.unwrap();
    let caller = alice.id.to_string();

    let requests = vec![
        (Method::GET, format!("/api/admin/users?adminUserId={caller}"), None),
        (
            Method::POST,
            "/api/admin/users".to_string(),
            Some(json!({"adminUserId": caller, "username": "mallory", "password": "secret123"})),
        ),
        (
            Method::PATCH,
            "/api/admin/users".to_string(),
            Some(json!({"adminUserId": caller, "userId": bob.id, "action": "updateStatus", "isActive": false})),
        ),
        (
            Method::DELETE,
            format!("/api/admin/users?adminUserId={caller}&userId={}", bob.id),
            None,
        ),
        (Method::GET, format!("/api/admin/codes?adminUserId={caller}&type=invite"), None),
        (
            Method::POST,
            "/api/admin/codes".to_string(),
            Some(json!({"adminUserId": caller, "type": "invite"})),
        ),
        (
            Method::PATCH,
            "/api/admin/codes".to_string(),
            Some(json!({"adminUserId": caller, "type": "invite", "id": code.id})),
        ),
        (
            Method::DELETE,
            format!("/api/admin/codes?adminUserId={caller}&type=invite&id={}", code.id),
            None,
        ),
        (Method::GET, format!("/api/admin/database-reset?adminUserId={caller}"), None),
        (
            Method::POST,
            "/api/admin/database-reset".to_string(),
            Some(json!({"adminUserId": caller, "confirmText": "RESET DATABASE"})),
        ),
    ];

    for (method, uri, body) in requests {
        let (status, json) = app.send(method.clone(), &uri, body, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
        assert_eq!(json["code"], 1003);
    }

    assert_eq!(app.store.table_counts().await.unwrap(), before);
    assert!(app.store.find_user(bob.id).await.unwrap().unwrap().is_active);
    assert!(!app.store.find_invite_code(code.id).await.unwrap().unwrap().is_used);
}

#[tokio::test]
async fn test_deactivated_admin_loses_admin_access() {
    let app = TestApp::new().await;
    let other = app.add_user("root2", Role::Admin).await;
    app.store
        .set_user_active(other.id, false, Utc::now())
        .await
        .unwrap();

    let uri = format!("/api/admin/users?adminUserId={}", other.id);
    let (status, _) = app.send(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_or_malformed_admin_id_is_bad_request() {
    let app = TestApp::new().await;
    let (status, _) = app.send(Method::GET, "/api/admin/users", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .send(Method::GET, "/api/admin/users?adminUserId=not-a-uuid", None, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_cannot_ban_or_delete_self() {
    let app = TestApp::new().await;
    let admin_id = app.admin.id;

    let (status, _) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": admin_id, "userId": admin_id, "action": "updateStatus", "isActive": false})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let uri = format!("/api/admin/users?adminUserId={admin_id}&userId={admin_id}");
    let (status, _) = app.send(Method::DELETE, &uri, None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let admin = app.store.find_user(admin_id).await.unwrap().unwrap();
    assert!(admin.is_active);
}

#[tokio::test]
async fn test_update_status_and_unknown_user() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;

    let (status, body) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "userId": alice.id, "action": "updateStatus", "isActive": false})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["isActive"], false);

    // 停用后令牌失效
    let token = app.token(&alice);
    let (status, _) = app
        .send(Method::GET, "/api/conversations", None, Some(&token))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "userId": Uuid::new_v4(), "action": "updateStatus", "isActive": true})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "userId": alice.id, "action": "promote"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_user_validation_and_duplicates() {
    let app = TestApp::new().await;
    app.add_user("alice", Role::User).await;

    let (status, _) = app
        .send(
            Method::POST,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "username": "carol", "password": "123"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "username": "ALICE", "password": "secret123"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 1001);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "username": "carol", "password": "secret123", "email": "carol@example.com"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["respData"]["role"], "user");
    assert_eq!(body["respData"]["permission"]["limitType"], "none");
    assert!(body["respData"].get("passwordHash").is_none());

    let carol = app.store.find_user_by_username("carol").await.unwrap().unwrap();
    assert!(app.store.find_settings(carol.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_list_users_pagination_and_stats() {
    let app = TestApp::new().await;
    app.add_user("alice", Role::User).await;
    app.add_user("bob", Role::User).await;

    let uri = format!(
        "/api/admin/users?adminUserId={}&role=user&limit=1&includeStats=true",
        app.admin.id
    );
    let (status, body) = app.send(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["total"], 2);
    assert_eq!(body["respData"]["users"].as_array().unwrap().len(), 1);
    assert_eq!(body["respData"]["users"][0]["stats"]["conversationCount"], 0);

    let uri = format!("/api/admin/users?adminUserId={}&limit=500", app.admin.id);
    let (status, _) = app.send(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_update_permissions() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;

    let (status, _) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "userId": alice.id, "action": "updatePermissions", "limitType": "token"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({
                "adminUserId": app.admin.id,
                "userId": alice.id,
                "action": "updatePermissions",
                "limitType": "token",
                "limitPeriod": "monthly",
                "tokenLimit": 1000,
                "allowedModels": ["gpt-4o-mini"]
            })),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["permission"]["tokenLimit"], 1000);

    let permission = app.store.find_permission(alice.id).await.unwrap().unwrap();
    assert_eq!(permission.limit_type, LimitType::Token);
    assert_eq!(permission.allowed_models, Some(vec!["gpt-4o-mini".to_string()]));

    let (status, body) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "userId": alice.id, "action": "updateAccessCodePermission", "enabled": true})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let tags = body["respData"]["permission"]["permissions"].as_array().unwrap();
    assert!(tags.contains(&json!("access_code")));
    assert!(
        app.store
            .find_permission(alice.id)
            .await
            .unwrap()
            .unwrap()
            .has(PermissionTag::AccessCode)
    );
}

#[tokio::test]
async fn test_toggle_flips_only_the_target_flag() {
    let app = TestApp::new().await;
    let admin_id = app.admin.id;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/admin/codes",
            Some(json!({"adminUserId": admin_id, "type": "invite", "maxUses": 3})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["respData"]["type"], "invite");
    let invite = body["respData"]["code"].clone();
    assert_eq!(invite["code"].as_str().unwrap().len(), 12);

    let (status, body) = app
        .send(
            Method::PATCH,
            "/api/admin/codes",
            Some(json!({"adminUserId": admin_id, "type": "invite", "id": invite["id"]})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let toggled = &body["respData"]["code"];
    assert_eq!(toggled["isUsed"], true);
    assert_eq!(toggled["currentUses"], invite["currentUses"]);
    assert_eq!(toggled["maxUses"], invite["maxUses"]);
    assert_eq!(toggled["expiresAt"], invite["expiresAt"]);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/admin/codes",
            Some(json!({"adminUserId": admin_id, "type": "access", "allowedModels": ["gpt-4o"]})),
            None,
        )
        .await;
    let access = body["respData"]["code"].clone();
    assert_eq!(access["isActive"], true);

    let (_, body) = app
        .send(
            Method::PATCH,
            "/api/admin/codes",
            Some(json!({"adminUserId": admin_id, "type": "access", "id": access["id"]})),
            None,
        )
        .await;
    let toggled = &body["respData"]["code"];
    assert_eq!(toggled["isActive"], false);
    assert_eq!(toggled["currentUses"], access["currentUses"]);
    assert_eq!(toggled["allowedModels"], access["allowedModels"]);

    let (status, _) = app
        .send(
            Method::PATCH,
            "/api/admin/codes",
            Some(json!({"adminUserId": admin_id, "type": "access", "id": Uuid::new_v4()})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_and_delete_codes() {
    let app = TestApp::new().await;
    let admin_id = app.admin.id;
    let code = issue_invite_code(app.store.as_ref(), admin_id, None, None)
        .await
        .unwrap();

    let uri = format!("/api/admin/codes?adminUserId={admin_id}&type=invite");
    let (status, body) = app.send(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["type"], "invite");
    assert_eq!(body["respData"]["codes"].as_array().unwrap().len(), 1);

    let uri = format!("/api/admin/codes?adminUserId={admin_id}&type=coupon");
    let (status, _) = app.send(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let uri = format!(
        "/api/admin/codes?adminUserId={admin_id}&type=invite&id={}",
        code.id
    );
    let (status, _) = app.send(Method::DELETE, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.send(Method::DELETE, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_requires_exact_confirmation() {
    let app = TestApp::new().await;
    app.add_user("alice", Role::User).await;
    let before = app.store.table_counts().await.unwrap();

    for confirm in [json!("reset database"), json!("RESET DATABASE "), Value::Null] {
        let (status, _) = app
            .send(
                Method::POST,
                "/api/admin/database-reset",
                Some(json!({"adminUserId": app.admin.id, "confirmText": confirm})),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    assert_eq!(app.store.table_counts().await.unwrap(), before);

    let uri = format!("/api/admin/database-reset?adminUserId={}", app.admin.id);
    let (status, body) = app.send(Method::GET, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["confirmText"], "RESET DATABASE");
}

#[tokio::test]
async fn test_reset_runs_reset_then_seed() {
    let app = TestApp::new().await;
    app.add_user("alice", Role::User).await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/admin/database-reset",
            Some(json!({"adminUserId": app.admin.id, "confirmText": "RESET DATABASE"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["reset"]["succeeded"], true);
    assert_eq!(body["respData"]["seed"]["succeeded"], true);

    assert!(app.store.find_user_by_username("alice").await.unwrap().is_none());
    let admin = app.store.find_user_by_username("admin").await.unwrap().unwrap();
    assert_ne!(admin.id, app.admin.id);
    assert!(!app.store.list_models().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_reset_returns_step_report() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    app.store.fail_reset(true);
    let before = app.store.table_counts().await.unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            "/api/admin/database-reset",
            Some(json!({"adminUserId": app.admin.id, "confirmText": "RESET DATABASE"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["respData"]["reset"]["attempted"], true);
    assert_eq!(body["respData"]["reset"]["succeeded"], false);
    assert_eq!(body["respData"]["seed"]["attempted"], false);
    assert_eq!(body["respData"]["seed"]["succeeded"], false);

    assert_eq!(app.store.table_counts().await.unwrap(), before);
    assert!(app.store.find_user(alice.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_user_cascades() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let token = app.token(&alice);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o"})),
            Some(&token),
        )
        .await;
    let conversation_id = body["respData"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/conversations/{conversation_id}/messages");
    app.send(
        Method::POST,
        &uri,
        Some(json!({"role": "user", "content": "hello"})),
        Some(&token),
    )
    .await;
    let (status, _) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "assistant", "content": "hi"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    issue_invite_code(app.store.as_ref(), alice.id, None, None)
        .await
        .unwrap();

    let now = Utc::now();
    let mut guest = User::new("alice-guest", None, None, Role::Guest, now);
    guest.host_user_id = Some(alice.id);
    let guest = app
        .store
        .create_account(NewAccount {
            settings: UserSettings::default_for(guest.id),
            permission: None,
            redeem: None,
            user: guest,
        })
        .await
        .unwrap();
    let guest_token = app.token(&guest);
    let (status, _) = app.send(Method::GET, "/api/quota", None, Some(&guest_token)).await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!(
        "/api/admin/users?adminUserId={}&userId={}",
        app.admin.id, alice.id
    );
    let (status, body) = app.send(Method::DELETE, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["deleted"], true);

    assert!(app.store.find_user(alice.id).await.unwrap().is_none());
    assert!(app.store.list_conversations(alice.id).await.unwrap().is_empty());
    assert!(app.store.list_usage(alice.id, 10).await.unwrap().is_empty());
    assert!(app.store.list_invite_codes().await.unwrap().is_empty());
    assert!(app.store.find_permission(alice.id).await.unwrap().is_none());
    // 主用户删除后访客被停用，不能脱离主用户的配额继续使用
    let guest = app.store.find_user(guest.id).await.unwrap().unwrap();
    assert_eq!(guest.host_user_id, None);
    assert!(!guest.is_active);
    let (status, _) = app.send(Method::GET, "/api/quota", None, Some(&guest_token)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = app
        .send(
            Method::PATCH,
            "/api/admin/users",
            Some(json!({"adminUserId": app.admin.id, "userId": guest.id, "action": "updateStatus", "isActive": true})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!app.store.find_user(guest.id).await.unwrap().unwrap().is_active);

    let (status, _) = app.send(Method::DELETE, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_chat_routes_require_token() {
    let app = TestApp::new().await;
    let (status, body) = app.send(Method::GET, "/api/conversations", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 1002);

    let (status, _) = app
        .send(Method::GET, "/api/conversations", None, Some("garbage"))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_conversation_title_is_trimmed_and_truncated() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let token = app.token(&alice);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "claude-3-5-haiku"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["respData"]["providerId"], "anthropic");
    let id = body["respData"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/conversations/{id}");

    let (status, body) = app
        .send(
            Method::PATCH,
            &uri,
            Some(json!({"title": "  一二三四五六七八九十  "})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["title"], "一二三四五六七八");

    let (status, _) = app
        .send(Method::PATCH, &uri, Some(json!({"title": "   "})), Some(&token))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // 其他用户看不到这个对话
    let bob = app.add_user("bob", Role::User).await;
    let (status, _) = app
        .send(
            Method::PATCH,
            &uri,
            Some(json!({"title": "hijack"})),
            Some(&app.token(&bob)),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_message_actions_and_edit_rules() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let token = app.token(&alice);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o-mini"})),
            Some(&token),
        )
        .await;
    let id = body["respData"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/conversations/{id}/messages");

    let (_, body) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "user", "content": "hello"})),
            Some(&token),
        )
        .await;
    let user_message = body["respData"]["message"].clone();
    assert_eq!(user_message["actions"], json!(["copy", "edit", "delete"]));

    let (_, body) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "assistant", "content": "hi there"})),
            Some(&token),
        )
        .await;
    let reply = body["respData"]["message"].clone();
    assert_eq!(reply["actions"], json!(["copy", "delete", "retry"]));
    // 未回报用量时按字符数估算
    assert_eq!(body["respData"]["usage"]["promptTokens"], 2);
    assert_eq!(body["respData"]["usage"]["completionTokens"], 2);
    assert_eq!(body["respData"]["usage"]["isEstimated"], true);

    let (status, body) = app
        .send(
            Method::PATCH,
            &format!("/api/messages/{}", user_message["id"].as_str().unwrap()),
            Some(json!({"content": "hello again"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["content"], "hello again");

    let (status, _) = app
        .send(
            Method::PATCH,
            &format!("/api/messages/{}", reply["id"].as_str().unwrap()),
            Some(json!({"content": "rewritten"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.send(Method::GET, &uri, None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"].as_array().unwrap().len(), 2);
    assert_eq!(body["respData"][0]["role"], "user");
}

#[tokio::test]
async fn test_quota_exhaustion_blocks_new_prompts() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let mut permission = app.store.find_permission(alice.id).await.unwrap().unwrap();
    permission.limit_type = LimitType::Token;
    permission.token_limit = Some(10);
    app.store.save_permission(&permission).await.unwrap();
    let token = app.token(&alice);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o"})),
            Some(&token),
        )
        .await;
    let uri = format!(
        "/api/conversations/{}/messages",
        body["respData"]["id"].as_str().unwrap()
    );

    let (status, _) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "user", "content": "hello"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "assistant", "content": "hi", "promptTokens": 8, "completionTokens": 5})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["respData"]["usage"]["totalTokens"], 13);
    assert_eq!(body["respData"]["usage"]["isEstimated"], false);
    assert!(body["respData"]["usage"]["cost"].is_number());
    assert_eq!(body["respData"]["quota"]["exhausted"], true);

    let (status, body) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "user", "content": "one more"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], 1006);

    let (status, body) = app.send(Method::GET, "/api/quota", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["respData"]["unrestricted"], false);
    assert_eq!(body["respData"]["quota"]["tokenUsed"], 13);
}

#[tokio::test]
async fn test_oversized_token_counts_are_rejected() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let token = app.token(&alice);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o"})),
            Some(&token),
        )
        .await;
    let conversation_id = body["respData"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/conversations/{conversation_id}/messages");

    for counts in [
        json!({"promptTokens": i64::MAX, "completionTokens": 1}),
        json!({"promptTokens": 1, "completionTokens": crate::quota::MAX_REPORTED_TOKENS + 1}),
        json!({"promptTokens": -1, "completionTokens": 1}),
    ] {
        let mut body = json!({"role": "assistant", "content": "hi"});
        body.as_object_mut()
            .unwrap()
            .extend(counts.as_object().unwrap().clone());
        let (status, body) = app.send(Method::POST, &uri, Some(body), Some(&token)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 1000);
    }

    let id = Uuid::parse_str(&conversation_id).unwrap();
    assert!(app.store.list_messages(id).await.unwrap().is_empty());
    assert!(app.store.list_usage(alice.id, 10).await.unwrap().is_empty());
    let permission = app.store.find_permission(alice.id).await.unwrap().unwrap();
    assert_eq!(permission.token_used, 0);
}

#[tokio::test]
async fn test_every_message_role_needs_chat_permission() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let token = app.token(&alice);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o"})),
            Some(&token),
        )
        .await;
    let conversation_id = body["respData"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/conversations/{conversation_id}/messages");

    let mut permission = app.store.find_permission(alice.id).await.unwrap().unwrap();
    permission.permissions.remove(&PermissionTag::Chat);
    app.store.save_permission(&permission).await.unwrap();

    for role in ["user", "assistant", "system"] {
        let (status, _) = app
            .send(
                Method::POST,
                &uri,
                Some(json!({"role": role, "content": "hi", "promptTokens": 5, "completionTokens": 5})),
                Some(&token),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    // 恢复 chat 权限但把模型移出白名单，助手消息同样被拒绝
    permission.permissions.insert(PermissionTag::Chat);
    permission.allowed_models = Some(vec!["gpt-4o-mini".into()]);
    app.store.save_permission(&permission).await.unwrap();
    let (status, _) = app
        .send(
            Method::POST,
            &uri,
            Some(json!({"role": "assistant", "content": "hi"})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let id = Uuid::parse_str(&conversation_id).unwrap();
    assert!(app.store.list_messages(id).await.unwrap().is_empty());
    assert!(app.store.list_usage(alice.id, 10).await.unwrap().is_empty());
    let permission = app.store.find_permission(alice.id).await.unwrap().unwrap();
    assert_eq!(permission.token_used, 0);
}

#[tokio::test]
async fn test_login() {
    let app = TestApp::new().await;
    let now = Utc::now();
    let hash = bcrypt::hash("secret123", 4).unwrap();
    let user = User::new("dave", None, Some(hash), Role::User, now);
    app.store
        .create_account(NewAccount {
            settings: UserSettings::default_for(user.id),
            permission: Some(UserPermission::unrestricted(user.id, now)),
            redeem: None,
            user,
        })
        .await
        .unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            "/api/auth/login",
            Some(json!({"username": "dave", "password": "secret123"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["respData"]["token"].as_str().unwrap().to_string();

    let (status, _) = app.send(Method::GET, "/api/settings", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .send(
            Method::POST,
            "/api/auth/login",
            Some(json!({"username": "dave", "password": "wrong-password"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_register_consumes_invite_code() {
    let app = TestApp::new().await;
    let code = issue_invite_code(app.store.as_ref(), app.admin.id, Some(1), None)
        .await
        .unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            "/api/auth/register",
            Some(json!({"username": "erin", "password": "secret123", "inviteCode": code.code.to_lowercase()})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["respData"]["user"]["role"], "user");

    let code = app.store.find_invite_code(code.id).await.unwrap().unwrap();
    assert_eq!(code.current_uses, 1);
    assert!(code.is_used);

    let (status, _) = app
        .send(
            Method::POST,
            "/api/auth/register",
            Some(json!({"username": "frank", "password": "secret123", "inviteCode": code.code})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.store.find_user_by_username("frank").await.unwrap().is_none());
}

#[tokio::test]
async fn test_guest_session_through_access_code() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let alice_token = app.token(&alice);

    // 没有 access_code 权限时不能创建
    let (status, _) = app
        .send(Method::POST, "/api/access-codes", Some(json!({})), Some(&alice_token))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let mut permission = app.store.find_permission(alice.id).await.unwrap().unwrap();
    permission.permissions.insert(PermissionTag::AccessCode);
    app.store.save_permission(&permission).await.unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            "/api/access-codes",
            Some(json!({"maxUses": 2, "allowedModels": ["gpt-4o-mini"]})),
            Some(&alice_token),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let access_code = body["respData"]["code"].as_str().unwrap().to_string();

    let (status, body) = app
        .send(
            Method::POST,
            "/api/auth/guest",
            Some(json!({"accessCode": access_code, "nickname": "visitor"})),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["respData"]["user"]["role"], "guest");
    assert_eq!(body["respData"]["user"]["hostUserId"], json!(alice.id));
    let guest_token = body["respData"]["token"].as_str().unwrap().to_string();

    let (_, body) = app.send(Method::GET, "/api/models", None, Some(&guest_token)).await;
    let groups = body["respData"].as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["models"][0]["id"], "gpt-4o-mini");

    let (status, _) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o"})),
            Some(&guest_token),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // 访客的用量记在主用户名下
    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o-mini"})),
            Some(&guest_token),
        )
        .await;
    let uri = format!(
        "/api/conversations/{}/messages",
        body["respData"]["id"].as_str().unwrap()
    );
    app.send(
        Method::POST,
        &uri,
        Some(json!({"role": "assistant", "content": "hello", "promptTokens": 3, "completionTokens": 4})),
        Some(&guest_token),
    )
    .await;
    let host = app.store.find_permission(alice.id).await.unwrap().unwrap();
    assert_eq!(host.token_used, 7);

    let (_, body) = app.send(Method::GET, "/api/access-codes", None, Some(&alice_token)).await;
    assert_eq!(body["respData"][0]["currentUses"], 1);
}

#[tokio::test]
async fn test_chat_view_projection() {
    let app = TestApp::new().await;
    let alice = app.add_user("alice", Role::User).await;
    let token = app.token(&alice);

    let (status, _) = app
        .send(
            Method::PUT,
            "/api/settings",
            Some(json!({"theme": "dark", "modelGroupOrder": ["google", "anthropic"]})),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .send(
            Method::POST,
            "/api/conversations",
            Some(json!({"modelId": "gpt-4o", "title": "first"})),
            Some(&token),
        )
        .await;
    let first = body["respData"]["id"].as_str().unwrap().to_string();
    app.send(
        Method::POST,
        "/api/conversations",
        Some(json!({"modelId": "gpt-4o", "title": "second"})),
        Some(&token),
    )
    .await;

    let uri = format!("/api/chat/view?conversationId={first}");
    let (status, body) = app.send(Method::GET, &uri, None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let view = &body["respData"];
    assert_eq!(view["sidebar"][0]["title"], "second");
    assert_eq!(view["sidebar"][1]["selected"], true);
    assert_eq!(view["selectedModelId"], "gpt-4o");
    let order: Vec<&str> = view["modelGroups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["name"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["google", "anthropic", "openai"]);
}
