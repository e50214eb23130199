// 邀请码与访问码实体

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 邀请码：用于注册新账号
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InviteCode {
    pub id: Uuid,
    pub code: String,
    pub created_by: Uuid,
    pub max_uses: i32,
    pub current_uses: i32,
    /// 管理员可手动标记为已使用
    pub is_used: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl InviteCode {
    pub fn new(
        code: String,
        created_by: Uuid,
        max_uses: i32,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            created_by,
            max_uses,
            current_uses: 0,
            is_used: false,
            expires_at,
            created_at: now,
        }
    }

    /// 未被标记、未达上限且未过期
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_used
            && self.current_uses < self.max_uses
            && self.expires_at.is_none_or(|expires| now < expires)
    }

    /// 记录一次使用，达到上限时标记为已使用
    pub fn redeem(&mut self) {
        self.current_uses += 1;
        if self.current_uses >= self.max_uses {
            self.is_used = true;
        }
    }
}

/// 访问码：在主用户名下创建访客会话
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessCode {
    pub id: Uuid,
    pub code: String,
    pub created_by: Uuid,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<i32>,
    pub current_uses: i32,
    /// 逗号分隔的模型 ID 白名单
    pub allowed_models: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AccessCode {
    pub fn new(
        code: String,
        created_by: Uuid,
        max_uses: Option<i32>,
        expires_at: Option<DateTime<Utc>>,
        allowed_models: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            created_by,
            is_active: true,
            expires_at,
            max_uses,
            current_uses: 0,
            allowed_models,
            created_at: now,
        }
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.max_uses.is_none_or(|max| self.current_uses < max)
            && self.expires_at.is_none_or(|expires| now < expires)
    }

    pub fn redeem(&mut self) {
        self.current_uses += 1;
    }

    /// 访客继承的模型白名单
    pub fn model_allow_list(&self) -> Option<Vec<String>> {
        self.allowed_models.as_deref().and_then(split_model_list)
    }
}

/// 解析逗号分隔的模型列表，空列表视为不限制
pub fn split_model_list(raw: &str) -> Option<Vec<String>> {
    let models: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();
    if models.is_empty() { None } else { Some(models) }
}

/// 把模型列表规范化为逗号分隔的存储格式
pub fn join_model_list(models: &[String]) -> Option<String> {
    let joined = models
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join(",");
    if joined.is_empty() { None } else { Some(joined) }
}

/// 兑换码的使用方式，在创建账号的同一事务中计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRedemption {
    Invite(Uuid),
    Access(Uuid),
}
