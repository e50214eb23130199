use axum::{
    extract::{Json, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    AppState,
    database::NewAccount,
    database::models::{CodeRedemption, Role, User, UserPermission, UserSettings},
    error::{AppError, AppResult},
    routes::{ensure_account_available, validate_email, validate_password, validate_username},
    utils::{generate_token, hash_password, success_to_api_response, verify_password},
};

use super::model::{AuthResponse, GuestRequest, LoginRequest, RegisterRequest};

const MAX_NICKNAME_CHARS: usize = 20;

fn issue_token(state: &AppState, user: User, ttl: std::time::Duration) -> AppResult<AuthResponse> {
    let (token, expires_at) =
        generate_token(&user.id.to_string(), user.role, ttl, &state.config.jwt_secret)?;
    Ok(AuthResponse {
        token,
        expires_at,
        user,
    })
}

fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let invalid = || AppError::Unauthorized("用户名或密码错误".into());

    let user = state
        .store
        .find_user_by_username(req.username.trim())
        .await?
        .ok_or_else(invalid)?;
    // 访客没有密码，只能通过访问码进入
    let hash = user.password_hash.as_deref().ok_or_else(invalid)?;
    if !verify_password(&req.password, hash)? {
        tracing::info!("Failed login for {}", user.username);
        return Err(invalid());
    }
    if !user.is_active {
        return Err(AppError::Unauthorized("账号已停用".into()));
    }

    tracing::info!("User {} logged in", user.id);
    let ttl = state.config.jwt_expiration();
    Ok(success_to_api_response(issue_token(&state, user, ttl)?))
}

/// 使用邀请码注册，兑换与建号在同一事务中完成
#[axum::debug_handler]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let username = validate_username(&req.username)?;
    validate_password(&req.password)?;
    let email = validate_email(req.email.as_deref())?;

    let now = Utc::now();
    let invite = state
        .store
        .find_invite_code_by_code(&normalize_code(&req.invite_code))
        .await?
        .filter(|code| code.is_usable(now))
        .ok_or_else(|| AppError::validation("邀请码无效或已失效"))?;
    ensure_account_available(&state, &username, email.as_deref()).await?;

    let mut user = User::new(
        &username,
        email,
        Some(hash_password(&req.password)?),
        Role::User,
        now,
    );
    user.invite_code_id = Some(invite.id);
    let account = NewAccount {
        settings: UserSettings::default_for(user.id),
        permission: Some(UserPermission::unrestricted(user.id, now)),
        redeem: Some(CodeRedemption::Invite(invite.id)),
        user,
    };
    let user = state.store.create_account(account).await?;
    tracing::info!("User {} registered with invite code {}", user.id, invite.id);

    let ttl = state.config.jwt_expiration();
    Ok((
        StatusCode::CREATED,
        success_to_api_response(issue_token(&state, user, ttl)?),
    ))
}

/// 使用访问码创建访客，访客的用量记在主用户名下
#[axum::debug_handler]
pub async fn guest(
    State(state): State<AppState>,
    payload: Result<Json<GuestRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(req) = payload?;
    let now = Utc::now();

    let code = state
        .store
        .find_access_code_by_code(&normalize_code(&req.access_code))
        .await?
        .filter(|code| code.is_usable(now))
        .ok_or_else(|| AppError::validation("访问码无效或已失效"))?;
    let host = state
        .store
        .find_user(code.created_by)
        .await?
        .filter(|host| host.is_active)
        .ok_or_else(|| AppError::validation("访问码无效或已失效"))?;

    let suffix = Uuid::new_v4().simple().to_string();
    let username = match req.nickname.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(nickname) => {
            if nickname.chars().count() > MAX_NICKNAME_CHARS {
                return Err(AppError::validation(format!(
                    "昵称不能超过 {MAX_NICKNAME_CHARS} 个字符"
                )));
            }
            validate_username(&format!("{}-{}", nickname, &suffix[..6]))?
        }
        None => format!("guest-{}", &suffix[..6]),
    };

    let mut user = User::new(&username, None, None, Role::Guest, now);
    user.host_user_id = Some(host.id);
    user.access_code_id = Some(code.id);
    let mut permission = UserPermission::unrestricted(user.id, now);
    permission.allowed_models = code.model_allow_list();

    let account = NewAccount {
        settings: UserSettings::default_for(user.id),
        permission: Some(permission),
        redeem: Some(CodeRedemption::Access(code.id)),
        user,
    };
    let user = state.store.create_account(account).await?;
    tracing::info!(
        "Guest {} joined through access code {} of {}",
        user.id,
        code.id,
        host.id
    );

    let ttl = state.config.guest_token_expiration();
    Ok((
        StatusCode::CREATED,
        success_to_api_response(issue_token(&state, user, ttl)?),
    ))
}
