use axum::{
    extract::{Json, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::Value;

use crate::{
    AppState,
    codes::{CodeKind, issue_access_code, issue_invite_code},
    error::{AppError, AppResult},
    routes::parse_id,
    utils::success_to_api_response,
};

use super::{
    authorize_admin, body_str,
    model::{CodeList, CodeQuery, CodeRecord, CodeTarget, CreateCodeRequest, DeleteCodeResponse},
    parse_body,
};

fn parse_kind(raw: Option<&str>) -> AppResult<CodeKind> {
    raw.ok_or_else(|| AppError::validation("缺少参数 type"))?
        .parse()
        .map_err(AppError::Validation)
}

#[axum::debug_handler]
pub async fn list_codes(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> AppResult<impl IntoResponse> {
    authorize_admin(&state, query.admin_user_id.as_deref()).await?;

    let list = match parse_kind(query.kind.as_deref())? {
        CodeKind::Invite => CodeList::Invite(state.store.list_invite_codes().await?),
        CodeKind::Access => CodeList::Access(state.store.list_access_codes(None).await?),
    };
    Ok(success_to_api_response(list))
}

#[axum::debug_handler]
pub async fn create_code(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(body) = payload?;
    let admin = authorize_admin(&state, body_str(&body, "adminUserId")).await?;
    let req: CreateCodeRequest = parse_body(body)?;

    let record = match req {
        CreateCodeRequest::Invite {
            max_uses,
            expires_in_days,
        } => CodeRecord::Invite(
            issue_invite_code(state.store.as_ref(), admin.id, max_uses, expires_in_days).await?,
        ),
        CreateCodeRequest::Access {
            max_uses,
            expires_in_days,
            allowed_models,
        } => CodeRecord::Access(
            issue_access_code(
                state.store.as_ref(),
                admin.id,
                max_uses,
                expires_in_days,
                allowed_models,
            )
            .await?,
        ),
    };
    Ok((StatusCode::CREATED, success_to_api_response(record)))
}

/// 邀请码切换 is_used，访问码切换 is_active
#[axum::debug_handler]
pub async fn toggle_code(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(body) = payload?;
    let admin = authorize_admin(&state, body_str(&body, "adminUserId")).await?;
    let target: CodeTarget = parse_body(body)?;

    let record = match target.kind {
        CodeKind::Invite => state
            .store
            .toggle_invite_code(target.id)
            .await?
            .map(CodeRecord::Invite),
        CodeKind::Access => state
            .store
            .toggle_access_code(target.id)
            .await?
            .map(CodeRecord::Access),
    }
    .ok_or_else(|| AppError::not_found("兑换码不存在"))?;

    tracing::info!("Admin {} toggled {:?} code {}", admin.id, target.kind, target.id);
    Ok(success_to_api_response(record))
}

#[axum::debug_handler]
pub async fn delete_code(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> AppResult<impl IntoResponse> {
    let admin = authorize_admin(&state, query.admin_user_id.as_deref()).await?;
    let kind = parse_kind(query.kind.as_deref())?;
    let id = parse_id("id", query.id.as_deref())?;

    let deleted = match kind {
        CodeKind::Invite => state.store.delete_invite_code(id).await?,
        CodeKind::Access => state.store.delete_access_code(id).await?,
    };
    if !deleted {
        return Err(AppError::not_found("兑换码不存在"));
    }

    tracing::info!("Admin {} deleted {:?} code {}", admin.id, kind, id);
    Ok(success_to_api_response(DeleteCodeResponse {
        kind,
        id,
        deleted: true,
    }))
}
