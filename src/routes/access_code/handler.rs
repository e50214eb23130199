use axum::{
    extract::{Extension, Json, Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use crate::{
    AppState,
    codes::issue_access_code,
    database::models::{PermissionTag, User},
    error::{AppError, AppResult},
    middleware::CurrentUser,
    permission::require_permission,
    routes::parse_id,
    utils::success_to_api_response,
};

use super::model::{CreateAccessCodeRequest, DeleteAccessCodeResponse};

/// 持有 access_code 权限的正式用户才能管理自己的访问码
async fn authorize_issuer(state: &AppState, user: &User) -> AppResult<()> {
    if user.is_guest() {
        return Err(AppError::forbidden("访客不能创建访问码"));
    }
    require_permission(state.store.as_ref(), user.id, PermissionTag::AccessCode).await?;
    Ok(())
}

#[axum::debug_handler]
pub async fn list_access_codes(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    authorize_issuer(&state, &user).await?;
    let codes = state.store.list_access_codes(Some(user.id)).await?;
    Ok(success_to_api_response(codes))
}

/// 访问码的模型范围不能超出创建者自己的白名单
#[axum::debug_handler]
pub async fn create_access_code(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    payload: Result<Json<CreateAccessCodeRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    authorize_issuer(&state, &user).await?;
    let Json(req) = payload?;

    let own_models = state
        .store
        .find_permission(user.id)
        .await?
        .and_then(|p| p.allowed_models);
    let allowed_models = match (req.allowed_models, own_models) {
        (Some(requested), Some(own)) => {
            if let Some(model_id) = requested.iter().find(|m| !own.contains(&m.trim().to_string())) {
                return Err(AppError::forbidden(format!("无权使用模型 {model_id}")));
            }
            Some(requested)
        }
        (None, Some(own)) => Some(own),
        (requested, None) => requested,
    };

    let code = issue_access_code(
        state.store.as_ref(),
        user.id,
        req.max_uses,
        req.expires_in_days,
        allowed_models,
    )
    .await?;
    Ok((StatusCode::CREATED, success_to_api_response(code)))
}

#[axum::debug_handler]
pub async fn delete_access_code(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    authorize_issuer(&state, &user).await?;
    let id = parse_id("id", Some(&id))?;

    state
        .store
        .find_access_code(id)
        .await?
        .filter(|code| code.created_by == user.id)
        .ok_or_else(|| AppError::not_found("访问码不存在"))?;
    let deleted = state.store.delete_access_code(id).await?;
    tracing::info!("User {} deleted access code {}", user.id, id);

    Ok(success_to_api_response(DeleteAccessCodeResponse { id, deleted }))
}
