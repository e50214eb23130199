use std::collections::{BTreeSet, HashMap};

use axum::{
    extract::{Json, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    AppState,
    database::NewAccount,
    database::models::{
        LimitType, PermissionTag, Role, User, UserFilter, UserPermission, UserSettings, UserStats,
    },
    error::{AppError, AppResult},
    routes::{
        ensure_account_available, parse_id, parse_opt, validate_email, validate_password,
        validate_username,
    },
    utils::{hash_password, success_to_api_response},
};

use super::{
    authorize_admin, body_str,
    model::{
        AdminUserView, CreateUserRequest, DeleteUserQuery, DeleteUserResponse, ListUsersQuery,
        PermissionPatch, UserAction, UserListResponse,
    },
    parse_body,
};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[axum::debug_handler]
pub async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
) -> AppResult<impl IntoResponse> {
    authorize_admin(&state, query.admin_user_id.as_deref()).await?;

    let role = parse_opt::<Role>("role", query.role.as_deref())?;
    let active = parse_opt::<bool>("active", query.active.as_deref())?;
    let limit = parse_opt::<i64>("limit", query.limit.as_deref())?.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&limit) {
        return Err(AppError::validation(format!(
            "limit 必须在 1 到 {MAX_PAGE_SIZE} 之间"
        )));
    }
    let offset = parse_opt::<i64>("offset", query.offset.as_deref())?.unwrap_or(0);
    if offset < 0 {
        return Err(AppError::validation("offset 不能为负数"));
    }
    let include_stats =
        parse_opt::<bool>("includeStats", query.include_stats.as_deref())?.unwrap_or(false);

    let filter = UserFilter {
        role,
        active,
        limit,
        offset,
    };
    let (users, total) = state.store.list_users(&filter).await?;

    let mut stats: HashMap<Uuid, UserStats> = if include_stats {
        let ids: Vec<Uuid> = users.iter().map(|u| u.id).collect();
        state
            .store
            .user_stats(&ids)
            .await?
            .into_iter()
            .map(|s| (s.user_id, s))
            .collect()
    } else {
        HashMap::new()
    };

    let mut views = Vec::with_capacity(users.len());
    for user in users {
        let permission = state.store.find_permission(user.id).await?;
        let stats = include_stats.then(|| {
            stats.remove(&user.id).unwrap_or_else(|| UserStats {
                user_id: user.id,
                ..Default::default()
            })
        });
        views.push(AdminUserView {
            user,
            permission,
            stats,
        });
    }

    Ok(success_to_api_response(UserListResponse {
        users: views,
        total,
        limit,
        offset,
    }))
}

#[axum::debug_handler]
pub async fn create_user(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(body) = payload?;
    let admin = authorize_admin(&state, body_str(&body, "adminUserId")).await?;
    let req: CreateUserRequest = parse_body(body)?;

    let username = validate_username(&req.username)?;
    validate_password(&req.password)?;
    let email = validate_email(req.email.as_deref())?;
    let role = parse_opt::<Role>("role", req.role.as_deref())?.unwrap_or(Role::User);
    if role == Role::Guest {
        return Err(AppError::validation("访客账号只能通过访问码创建"));
    }
    ensure_account_available(&state, &username, email.as_deref()).await?;

    let now = Utc::now();
    let user = User::new(
        &username,
        email,
        Some(hash_password(&req.password)?),
        role,
        now,
    );
    let permission = (role != Role::Admin).then(|| UserPermission::unrestricted(user.id, now));
    let account = NewAccount {
        settings: UserSettings::default_for(user.id),
        permission: permission.clone(),
        redeem: None,
        user,
    };
    let user = state.store.create_account(account).await?;
    tracing::info!(
        "Admin {} created user {} ({}) with role {}",
        admin.id,
        user.id,
        user.username,
        user.role
    );

    Ok((
        StatusCode::CREATED,
        success_to_api_response(AdminUserView {
            user,
            permission,
            stats: None,
        }),
    ))
}

#[axum::debug_handler]
pub async fn update_user(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(body) = payload?;
    let admin = authorize_admin(&state, body_str(&body, "adminUserId")).await?;
    let user_id = parse_id("userId", body_str(&body, "userId"))?;
    let action: UserAction = parse_body(body)?;
    let now = Utc::now();

    let view = match action {
        UserAction::UpdateStatus { is_active } => {
            if !is_active && user_id == admin.id {
                return Err(AppError::validation("不能停用自己的账号"));
            }
            if is_active {
                let target = find_target(&state, user_id).await?;
                if target.is_guest() && target.host_user_id.is_none() {
                    return Err(AppError::validation("主用户已删除，访客不能重新启用"));
                }
            }
            let user = state
                .store
                .set_user_active(user_id, is_active, now)
                .await?
                .ok_or_else(|| AppError::not_found("用户不存在"))?;
            tracing::info!(
                "Admin {} set user {} active = {}",
                admin.id,
                user.id,
                is_active
            );
            let permission = state.store.find_permission(user.id).await?;
            AdminUserView {
                user,
                permission,
                stats: None,
            }
        }
        UserAction::UpdateAccessCodePermission { enabled } => {
            let user = find_target(&state, user_id).await?;
            let mut permission = load_permission(&state, &user, now).await?;
            if enabled {
                permission.permissions.insert(PermissionTag::AccessCode);
            } else {
                permission.permissions.remove(&PermissionTag::AccessCode);
            }
            permission.updated_at = now;
            state.store.save_permission(&permission).await?;
            tracing::info!(
                "Admin {} set access code permission of {} to {}",
                admin.id,
                user.id,
                enabled
            );
            AdminUserView {
                user,
                permission: Some(permission),
                stats: None,
            }
        }
        UserAction::UpdatePermissions(patch) => {
            let user = find_target(&state, user_id).await?;
            let mut permission = load_permission(&state, &user, now).await?;
            apply_patch(&state, &mut permission, patch, now).await?;
            state.store.save_permission(&permission).await?;
            tracing::info!("Admin {} updated permissions of {}", admin.id, user.id);
            AdminUserView {
                user,
                permission: Some(permission),
                stats: None,
            }
        }
    };

    Ok(success_to_api_response(view))
}

#[axum::debug_handler]
pub async fn delete_user(
    State(state): State<AppState>,
    Query(query): Query<DeleteUserQuery>,
) -> AppResult<impl IntoResponse> {
    let admin = authorize_admin(&state, query.admin_user_id.as_deref()).await?;
    let user_id = parse_id("userId", query.user_id.as_deref())?;
    if user_id == admin.id {
        return Err(AppError::validation("不能删除自己的账号"));
    }

    if !state.store.delete_user_cascade(user_id).await? {
        return Err(AppError::not_found("用户不存在"));
    }
    tracing::info!("Admin {} deleted user {}", admin.id, user_id);

    Ok(success_to_api_response(DeleteUserResponse {
        user_id,
        deleted: true,
    }))
}

async fn find_target(state: &AppState, user_id: Uuid) -> AppResult<User> {
    state
        .store
        .find_user(user_id)
        .await?
        .ok_or_else(|| AppError::not_found("用户不存在"))
}

/// 没有权限记录的用户按不限额处理
async fn load_permission(
    state: &AppState,
    user: &User,
    now: DateTime<Utc>,
) -> AppResult<UserPermission> {
    Ok(state
        .store
        .find_permission(user.id)
        .await?
        .unwrap_or_else(|| UserPermission::unrestricted(user.id, now)))
}

/// 先完整校验再修改，校验失败时记录保持原样
async fn apply_patch(
    state: &AppState,
    permission: &mut UserPermission,
    patch: PermissionPatch,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let tags = match patch.permissions {
        Some(raw) => Some(
            raw.iter()
                .map(|tag| tag.parse::<PermissionTag>().map_err(AppError::Validation))
                .collect::<AppResult<BTreeSet<_>>>()?,
        ),
        None => None,
    };

    if patch.token_limit.is_some_and(|limit| limit <= 0) {
        return Err(AppError::validation("tokenLimit 必须大于 0"));
    }
    if patch
        .cost_limit
        .is_some_and(|limit| !limit.is_finite() || limit <= 0.0)
    {
        return Err(AppError::validation("costLimit 必须大于 0"));
    }

    let allowed_models = match patch.allowed_models {
        Some(models) if models.is_empty() => Some(None),
        Some(models) => {
            let mut checked: Vec<String> = Vec::with_capacity(models.len());
            for model_id in models {
                let model_id = model_id.trim().to_string();
                if state.store.find_model(&model_id).await?.is_none() {
                    return Err(AppError::validation(format!("未知模型: {model_id}")));
                }
                if !checked.contains(&model_id) {
                    checked.push(model_id);
                }
            }
            Some(Some(checked))
        }
        None => None,
    };

    let mut next = permission.clone();
    if let Some(tags) = tags {
        next.permissions = tags;
    }
    if let Some(limit_type) = patch.limit_type {
        next.limit_type = limit_type;
    }
    if let Some(limit_period) = patch.limit_period {
        next.limit_period = limit_period;
    }
    if patch.token_limit.is_some() {
        next.token_limit = patch.token_limit;
    }
    if patch.cost_limit.is_some() {
        next.cost_limit = patch.cost_limit;
    }
    if let Some(allowed_models) = allowed_models {
        next.allowed_models = allowed_models;
    }
    if patch.reset_usage {
        next.token_used = 0;
        next.cost_used = 0.0;
        next.last_reset_at = now;
    }

    match next.limit_type {
        LimitType::Token if next.token_limit.is_none() => {
            return Err(AppError::validation("token 限额需要设置 tokenLimit"));
        }
        LimitType::Cost if next.cost_limit.is_none() => {
            return Err(AppError::validation("cost 限额需要设置 costLimit"));
        }
        _ => {}
    }

    next.updated_at = now;
    *permission = next;
    Ok(())
}
