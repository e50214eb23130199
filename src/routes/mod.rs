pub mod access_code;
pub mod admin;
pub mod auth;
pub mod chat;

#[cfg(test)]
mod tests;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    AppState,
    error::{AppError, AppResult},
    middleware::auth_middleware,
    utils::success_to_api_response,
};

const MIN_PASSWORD_CHARS: usize = 6;
const MAX_USERNAME_CHARS: usize = 32;

/// 解析请求中的 UUID 参数，缺失或格式错误返回 400
pub(crate) fn parse_id(field: &str, value: Option<&str>) -> AppResult<Uuid> {
    let raw = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation(format!("缺少参数 {field}")))?;
    Uuid::parse_str(raw).map_err(|_| AppError::validation(format!("参数 {field} 格式无效")))
}

/// 解析可选的查询参数
pub(crate) fn parse_opt<T: std::str::FromStr>(field: &str, value: Option<&str>) -> AppResult<Option<T>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| AppError::validation(format!("参数 {field} 格式无效"))),
    }
}

pub(crate) fn validate_username(username: &str) -> AppResult<String> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(AppError::validation(format!(
            "用户名长度必须在 1 到 {MAX_USERNAME_CHARS} 之间"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(AppError::validation(
            "用户名只允许使用字母、数字、下划线、短横线和点",
        ));
    }
    Ok(username.to_string())
}

pub(crate) fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AppError::validation(format!(
            "密码至少需要 {MIN_PASSWORD_CHARS} 个字符"
        )));
    }
    Ok(())
}

pub(crate) fn validate_email(email: Option<&str>) -> AppResult<Option<String>> {
    match email.map(str::trim).filter(|e| !e.is_empty()) {
        None => Ok(None),
        Some(email) if email.contains('@') && !email.starts_with('@') && !email.ends_with('@') => {
            Ok(Some(email.to_lowercase()))
        }
        Some(_) => Err(AppError::validation("邮箱格式无效")),
    }
}

/// 用户名或邮箱已被占用时返回 400
pub(crate) async fn ensure_account_available(
    state: &AppState,
    username: &str,
    email: Option<&str>,
) -> AppResult<()> {
    if state.store.find_user_by_username(username).await?.is_some() {
        return Err(AppError::Conflict("用户名已存在".into()));
    }
    if let Some(email) = email {
        if state.store.find_user_by_email(email).await?.is_some() {
            return Err(AppError::Conflict("邮箱已被使用".into()));
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> impl axum::response::IntoResponse {
    success_to_api_response(HealthResponse { status: "ok" })
}

/// 构建全部路由。管理接口通过 adminUserId 鉴权，聊天接口需要 Bearer 令牌。
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/register", post(auth::register))
        .route("/auth/guest", post(auth::guest))
        .route(
            "/admin/users",
            get(admin::list_users)
                .post(admin::create_user)
                .patch(admin::update_user)
                .delete(admin::delete_user),
        )
        .route(
            "/admin/codes",
            get(admin::list_codes)
                .post(admin::create_code)
                .patch(admin::toggle_code)
                .delete(admin::delete_code),
        )
        .route(
            "/admin/database-reset",
            get(admin::reset_info).post(admin::reset_database),
        );

    let protected_routes = Router::new()
        // 对话
        .route(
            "/conversations",
            get(chat::list_conversations).post(chat::create_conversation),
        )
        .route(
            "/conversations/{id}",
            patch(chat::rename_conversation).delete(chat::delete_conversation),
        )
        .route(
            "/conversations/{id}/messages",
            get(chat::list_messages).post(chat::append_message),
        )
        .route(
            "/messages/{id}",
            patch(chat::edit_message).delete(chat::delete_message),
        )
        // 配额与模型
        .route("/quota", get(chat::get_quota))
        .route("/usage", get(chat::list_usage))
        .route("/models", get(chat::list_models))
        .route(
            "/settings",
            get(chat::get_settings).put(chat::update_settings),
        )
        .route("/chat/view", get(chat::chat_view))
        // 用户自己的访问码
        .route(
            "/access-codes",
            get(access_code::list_access_codes).post(access_code::create_access_code),
        )
        .route("/access-codes/{id}", delete(access_code::delete_access_code))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .nest(
            &state.config.api_base_uri.clone(),
            Router::new().merge(public_routes).merge(protected_routes),
        )
        .with_state(state)
}
