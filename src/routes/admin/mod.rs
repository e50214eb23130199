// 管理接口：用户、兑换码、数据库重置
// 所有接口先校验 adminUserId 的管理权限，再校验其余参数

mod codes;
mod model;
mod reset;
mod users;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    AppState,
    database::models::{PermissionTag, User},
    error::{AppError, AppResult},
    permission::require_permission,
};

use super::parse_id;

pub use codes::{create_code, delete_code, list_codes, toggle_code};
pub use reset::{RESET_CONFIRM_TEXT, reset_database, reset_info};
pub use users::{create_user, delete_user, list_users, update_user};

/// 返回通过 admin_panel 检查的调用者
async fn authorize_admin(state: &AppState, admin_user_id: Option<&str>) -> AppResult<User> {
    let admin_id = parse_id("adminUserId", admin_user_id)?;
    require_permission(state.store.as_ref(), admin_id, PermissionTag::AdminPanel).await
}

fn body_str<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    body.get(field).and_then(Value::as_str)
}

/// 权限检查通过后再把请求体解析成具体类型
fn parse_body<T: DeserializeOwned>(body: Value) -> AppResult<T> {
    serde_json::from_value(body).map_err(|e| AppError::validation(format!("请求参数无效: {e}")))
}
