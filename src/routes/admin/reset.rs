use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde_json::Value;

use crate::{
    AppState,
    database::{SeedData, maintenance::reset_and_seed},
    error::{AppError, AppResult},
    utils::{ApiResponse, error_codes, hash_password, success_to_api_response},
};

use super::{
    authorize_admin, body_str,
    model::{AdminQuery, ResetInfoResponse, ResetRequest},
    parse_body,
};

pub const RESET_CONFIRM_TEXT: &str = "RESET DATABASE";

#[axum::debug_handler]
pub async fn reset_info(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
) -> AppResult<impl IntoResponse> {
    authorize_admin(&state, query.admin_user_id.as_deref()).await?;
    let tables = state.store.table_counts().await?;
    Ok(success_to_api_response(ResetInfoResponse {
        tables,
        confirm_text: RESET_CONFIRM_TEXT,
    }))
}

/// 清空并重建数据库。无论成功与否都返回每一步的执行报告。
#[axum::debug_handler]
pub async fn reset_database(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(body) = payload?;
    let admin = authorize_admin(&state, body_str(&body, "adminUserId")).await?;
    let req: ResetRequest = parse_body(body)?;
    if req.confirm_text.as_deref() != Some(RESET_CONFIRM_TEXT) {
        return Err(AppError::validation(format!(
            "确认文本必须为 \"{RESET_CONFIRM_TEXT}\""
        )));
    }

    tracing::warn!("Admin {} ({}) is resetting the database", admin.id, admin.username);
    let seed = SeedData::standard(
        &state.config.seed_admin_username,
        hash_password(&state.config.seed_admin_password)?,
        Utc::now(),
    );
    let report = reset_and_seed(state.store.as_ref(), &seed, state.config.reset_step_timeout()).await;

    let (status, code, msg) = if report.succeeded() {
        (StatusCode::OK, error_codes::SUCCESS, "数据库已重置".to_string())
    } else if !report.reset.succeeded {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "数据库重置失败".to_string(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_codes::INTERNAL_ERROR,
            "数据库已重置，但初始数据写入失败".to_string(),
        )
    };

    Ok((
        status,
        Json(ApiResponse {
            code,
            msg,
            resp_data: Some(report),
        }),
    ))
}
