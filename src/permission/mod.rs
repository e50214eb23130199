// 权限检查

use uuid::Uuid;

use crate::database::models::{PermissionTag, User};
use crate::database::{Store, StoreResult};
use crate::error::{AppError, AppResult};

/// 用户是否拥有某个权限标签。
/// 不存在或已停用的用户没有任何权限；管理员拥有全部权限。
pub async fn check_user_permission(
    store: &dyn Store,
    user_id: Uuid,
    tag: PermissionTag,
) -> StoreResult<bool> {
    let Some(user) = store.find_user(user_id).await? else {
        return Ok(false);
    };
    if !user.is_active {
        return Ok(false);
    }
    if user.is_admin() {
        return Ok(true);
    }
    Ok(store
        .find_permission(user_id)
        .await?
        .is_some_and(|permission| permission.has(tag)))
}

/// 检查通过时返回调用者，否则返回 403
pub async fn require_permission(
    store: &dyn Store,
    user_id: Uuid,
    tag: PermissionTag,
) -> AppResult<User> {
    if !check_user_permission(store, user_id, tag).await? {
        tracing::warn!("Permission {} denied for {}", tag, user_id);
        return Err(AppError::forbidden("权限不足"));
    }
    store
        .find_user(user_id)
        .await?
        .ok_or_else(|| AppError::forbidden("权限不足"))
}
