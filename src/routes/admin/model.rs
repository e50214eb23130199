use serde::{Deserialize, Serialize};

use crate::codes::CodeKind;
use crate::database::TableCount;
use crate::database::models::{
    AccessCode, InviteCode, LimitPeriod, LimitType, User, UserPermission, UserStats,
};

// 查询参数统一按字符串接收，由处理器在权限检查之后再解析

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminQuery {
    pub admin_user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUsersQuery {
    pub admin_user_id: Option<String>,
    pub role: Option<String>,
    pub active: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub include_stats: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserQuery {
    pub admin_user_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeQuery {
    pub admin_user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

/// 用户更新操作，按 action 区分
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UserAction {
    UpdateStatus { is_active: bool },
    UpdateAccessCodePermission { enabled: bool },
    UpdatePermissions(PermissionPatch),
}

/// 未提供的字段保持不变；allowedModels 传空数组表示取消限制
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPatch {
    pub permissions: Option<Vec<String>>,
    pub limit_type: Option<LimitType>,
    pub limit_period: Option<LimitPeriod>,
    pub token_limit: Option<i64>,
    pub cost_limit: Option<f64>,
    pub allowed_models: Option<Vec<String>>,
    #[serde(default)]
    pub reset_usage: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum CreateCodeRequest {
    Invite {
        max_uses: Option<i32>,
        expires_in_days: Option<i64>,
    },
    Access {
        max_uses: Option<i32>,
        expires_in_days: Option<i64>,
        allowed_models: Option<Vec<String>>,
    },
}

#[derive(Debug, Deserialize)]
pub struct CodeTarget {
    #[serde(rename = "type")]
    pub kind: CodeKind,
    pub id: uuid::Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    pub confirm_text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUserView {
    #[serde(flatten)]
    pub user: User,
    pub permission: Option<UserPermission>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<UserStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserListResponse {
    pub users: Vec<AdminUserView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserResponse {
    pub user_id: uuid::Uuid,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "codes", rename_all = "lowercase")]
pub enum CodeList {
    Invite(Vec<InviteCode>),
    Access(Vec<AccessCode>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "code", rename_all = "lowercase")]
pub enum CodeRecord {
    Invite(InviteCode),
    Access(AccessCode),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCodeResponse {
    #[serde(rename = "type")]
    pub kind: CodeKind,
    pub id: uuid::Uuid,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetInfoResponse {
    pub tables: Vec<TableCount>,
    pub confirm_text: &'static str,
}
