// 兑换码签发
// 邀请码与访问码共用同一个生成流程，遇到重复码时重试

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::database::models::code::join_model_list;
use crate::database::models::{AccessCode, InviteCode};
use crate::database::{Store, StoreError};
use crate::error::{AppError, AppResult};
use crate::utils::generate_code;

const MAX_GENERATE_ATTEMPTS: usize = 5;
const MAX_EXPIRY_DAYS: i64 = 3650;

/// 兑换码类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Invite,
    Access,
}

impl std::str::FromStr for CodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invite" => Ok(CodeKind::Invite),
            "access" => Ok(CodeKind::Access),
            other => Err(format!("type 必须为 invite 或 access，收到 {other}")),
        }
    }
}

fn expiry(expires_in_days: Option<i64>, now: DateTime<Utc>) -> AppResult<Option<DateTime<Utc>>> {
    match expires_in_days {
        None => Ok(None),
        Some(days) if (1..=MAX_EXPIRY_DAYS).contains(&days) => Ok(Some(now + Duration::days(days))),
        Some(_) => Err(AppError::validation(format!(
            "expiresInDays 必须在 1 到 {MAX_EXPIRY_DAYS} 之间"
        ))),
    }
}

pub async fn issue_invite_code(
    store: &dyn Store,
    created_by: Uuid,
    max_uses: Option<i32>,
    expires_in_days: Option<i64>,
) -> AppResult<InviteCode> {
    let max_uses = max_uses.unwrap_or(1);
    if max_uses < 1 {
        return Err(AppError::validation("maxUses 必须大于 0"));
    }
    let now = Utc::now();
    let expires_at = expiry(expires_in_days, now)?;

    for _ in 0..MAX_GENERATE_ATTEMPTS {
        let code = InviteCode::new(generate_code(), created_by, max_uses, expires_at, now);
        match store.insert_invite_code(&code).await {
            Ok(()) => {
                tracing::info!("Invite code {} issued by {}", code.id, created_by);
                return Ok(code);
            }
            Err(StoreError::Conflict(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(AppError::Internal("could not generate a unique invite code".into()))
}

pub async fn issue_access_code(
    store: &dyn Store,
    created_by: Uuid,
    max_uses: Option<i32>,
    expires_in_days: Option<i64>,
    allowed_models: Option<Vec<String>>,
) -> AppResult<AccessCode> {
    if max_uses.is_some_and(|max| max < 1) {
        return Err(AppError::validation("maxUses 必须大于 0"));
    }
    let now = Utc::now();
    let expires_at = expiry(expires_in_days, now)?;

    let allowed_models = match allowed_models {
        Some(models) => {
            for model_id in &models {
                if store.find_model(model_id.trim()).await?.is_none() {
                    return Err(AppError::validation(format!("未知模型: {model_id}")));
                }
            }
            join_model_list(&models)
        }
        None => None,
    };

    for _ in 0..MAX_GENERATE_ATTEMPTS {
        let code = AccessCode::new(
            generate_code(),
            created_by,
            max_uses,
            expires_at,
            allowed_models.clone(),
            now,
        );
        match store.insert_access_code(&code).await {
            Ok(()) => {
                tracing::info!("Access code {} issued by {}", code.id, created_by);
                return Ok(code);
            }
            Err(StoreError::Conflict(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(AppError::Internal("could not generate a unique access code".into()))
}
